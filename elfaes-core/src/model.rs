//! The object document: the mutable, per-object metadata record that anchors
//! an event log to the hash chain of commit markers written to the data
//! store (§3).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::version::{EntityTag, Version, EMPTY_STREAM_VERSION};

/// A stream identifier: a domain prefix followed by a zero-padded 10-digit
/// suffix, e.g. `order-0000000000`. Continuation increments the suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamIdentifier(pub String);

impl StreamIdentifier {
    /// Builds the genesis stream identifier for a freshly created object:
    /// `{id-without-dashes}-0000000000`.
    #[must_use]
    pub fn genesis(object_id: &str) -> Self {
        let stripped: String = object_id.chars().filter(|c| *c != '-').collect();
        Self(format!("{stripped}-{:010}", 0))
    }

    /// Returns the continuation identifier: same prefix, suffix incremented
    /// by one.
    ///
    /// # Panics
    ///
    /// Panics if the identifier does not match the `{prefix}-{10 digits}`
    /// shape; this would indicate a previously corrupted document and is
    /// treated as a programming error rather than a recoverable one.
    #[must_use]
    pub fn continuation(&self) -> Self {
        let (prefix, suffix) = self
            .0
            .rsplit_once('-')
            .expect("stream identifier must contain a '-' separated suffix");
        let next: u64 = suffix
            .parse::<u64>()
            .expect("stream identifier suffix must be a 10-digit number")
            + 1;

        Self(format!("{prefix}-{next:010}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One bounded-size segment of a stream's events, stored as its own blob so
/// that a stream can outgrow a single backend object (§3, §4.3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(rename = "chunkId")]
    pub chunk_id: u32,
    #[serde(rename = "firstVersion")]
    pub first_version: Version,
    #[serde(rename = "lastVersion")]
    pub last_version: Version,
}

impl StreamChunk {
    #[must_use]
    pub fn genesis() -> Self {
        Self {
            chunk_id: 0,
            first_version: 0,
            last_version: EMPTY_STREAM_VERSION,
        }
    }

    /// Builds the successor chunk opened right after `self` fills up.
    #[must_use]
    pub fn next(&self) -> Self {
        let first_version = self.last_version + 1;
        Self {
            chunk_id: self.chunk_id + 1,
            first_version,
            last_version: first_version - 1,
        }
    }
}

/// Per-store routing names resolved for the active stream. Each name is an
/// override over the document's configured defaults (§6 `Default*Store`
/// keys); `None` means "use the configured default".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRouting {
    #[serde(rename = "dataStore", skip_serializing_if = "Option::is_none")]
    pub data_store: Option<String>,
    #[serde(rename = "documentStore", skip_serializing_if = "Option::is_none")]
    pub document_store: Option<String>,
    #[serde(rename = "documentTagStore", skip_serializing_if = "Option::is_none")]
    pub document_tag_store: Option<String>,
    #[serde(rename = "streamTagStore", skip_serializing_if = "Option::is_none")]
    pub stream_tag_store: Option<String>,
    #[serde(rename = "snapshotStore", skip_serializing_if = "Option::is_none")]
    pub snapshot_store: Option<String>,
}

/// Chunk settings for the active stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSettings {
    pub enabled: bool,
    #[serde(rename = "chunkSize")]
    pub chunk_size: u64,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            chunk_size: 10_000,
        }
    }
}

/// The active stream's info sub-record, exclusively owned by the object
/// document (§3 Ownership).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveStreamInfo {
    #[serde(rename = "streamIdentifier")]
    pub stream_identifier: StreamIdentifier,
    #[serde(rename = "currentStreamVersion")]
    pub current_stream_version: Version,
    pub routing: StreamRouting,
    #[serde(rename = "chunkSettings")]
    pub chunk_settings: ChunkSettings,
    #[serde(default)]
    pub chunks: Vec<StreamChunk>,
}

impl ActiveStreamInfo {
    #[must_use]
    pub fn new(object_id: &str) -> Self {
        Self {
            stream_identifier: StreamIdentifier::genesis(object_id),
            current_stream_version: EMPTY_STREAM_VERSION,
            routing: StreamRouting::default(),
            chunk_settings: ChunkSettings::default(),
            chunks: Vec::new(),
        }
    }

    /// Returns the chunk currently accepting appends, if chunking is
    /// enabled and at least one chunk has been opened.
    #[must_use]
    pub fn last_chunk(&self) -> Option<&StreamChunk> {
        self.chunks.last()
    }

    #[must_use]
    pub fn last_chunk_mut(&mut self) -> Option<&mut StreamChunk> {
        self.chunks.last_mut()
    }
}

/// A stream that has been terminated in favour of a continuation stream
/// (§3 Terminated stream).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminatedStream {
    #[serde(rename = "streamId")]
    pub stream_id: StreamIdentifier,
    #[serde(rename = "continuationStreamId")]
    pub continuation_stream_id: StreamIdentifier,
    #[serde(rename = "continuationStreamType")]
    pub continuation_stream_type: String,
    #[serde(rename = "continuationDataStore", skip_serializing_if = "Option::is_none")]
    pub continuation_data_store: Option<String>,
    #[serde(rename = "continuationDocumentStore", skip_serializing_if = "Option::is_none")]
    pub continuation_document_store: Option<String>,
    pub reason: String,
}

/// The per-object metadata document (§3 Object document). Mutated only via
/// conditional write keyed on its prior entity tag; `hash`/`previous_hash`
/// are recomputed by [`ObjectDocument::seal`] after every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDocument {
    #[serde(rename = "objectName")]
    pub object_name: String,
    #[serde(rename = "objectId")]
    pub object_id: String,
    #[serde(rename = "schemaVersion")]
    pub schema_version: String,
    #[serde(rename = "hash")]
    pub hash: String,
    #[serde(rename = "previousHash")]
    pub previous_hash: String,
    #[serde(rename = "terminatedStreams", default)]
    pub terminated_streams: Vec<TerminatedStream>,
    #[serde(rename = "activeStream")]
    pub active_stream: ActiveStreamInfo,

    /// The stream version the most recently saved snapshot covers, if the
    /// snapshot-store collaborator has ever been asked to snapshot this
    /// object (§4.4 Snapshot).
    #[serde(rename = "snapshotVersion", default, skip_serializing_if = "Option::is_none")]
    pub snapshot_version: Option<Version>,

    /// The entity tag the document was loaded with. `None` for a document
    /// that has never been persisted (drives `If-None-Match: *` on save).
    #[serde(skip)]
    pub entity_tag: Option<EntityTag>,
}

const GENESIS_HASH: &str = "*";

impl ObjectDocument {
    /// Constructs a brand-new, never-persisted document for `(name, id)`
    /// with default routing, an empty stream, and a fresh stream identifier
    /// (§4.1 Create).
    #[must_use]
    pub fn new(object_name: impl Into<String>, object_id: impl Into<String>) -> Self {
        let object_id = object_id.into();
        let mut document = Self {
            object_name: object_name.into(),
            object_id: object_id.clone(),
            schema_version: "1".to_owned(),
            hash: GENESIS_HASH.to_owned(),
            previous_hash: GENESIS_HASH.to_owned(),
            terminated_streams: Vec::new(),
            active_stream: ActiveStreamInfo::new(&object_id),
            snapshot_version: None,
            entity_tag: None,
        };
        document.hash = document.compute_hash();
        document
    }

    /// Returns `document.hash`, or `"*"` if the document has no hash yet
    /// (used as the genesis marker's `h` field per §6).
    #[must_use]
    pub fn hash_or_genesis(&self) -> &str {
        if self.hash.is_empty() {
            GENESIS_HASH
        } else {
            &self.hash
        }
    }

    #[must_use]
    pub fn previous_hash_or_genesis(&self) -> &str {
        if self.previous_hash.is_empty() {
            GENESIS_HASH
        } else {
            &self.previous_hash
        }
    }

    /// Canonical SHA-256 hash of the document, computed over the same
    /// byte-for-byte JSON serialization that is written to storage (§9
    /// Canonical hashing). Must not be re-derived from a re-serialization
    /// performed after the hash is computed.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let mut unhashed = self.clone();
        unhashed.hash = String::new();
        unhashed.entity_tag = None;

        let canonical =
            serde_json::to_vec(&unhashed).expect("ObjectDocument serialization is infallible");

        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }

    /// Rolls `hash` into `previous_hash` and recomputes `hash` from the
    /// document's current contents. Called by the document store right
    /// before every conditional write (§4.1 Hashing).
    pub fn seal(&mut self) {
        self.previous_hash = self.hash.clone();
        self.hash = self.compute_hash();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_stream_identifier_strips_dashes_and_pads() {
        let id = StreamIdentifier::genesis("ab-cd-ef");
        assert_eq!(id.as_str(), "abcdef-0000000000");
    }

    #[test]
    fn continuation_increments_suffix() {
        let id = StreamIdentifier("order-0000000003".to_owned());
        assert_eq!(id.continuation().as_str(), "order-0000000004");
    }

    #[test]
    fn new_document_has_empty_stream_version() {
        let document = ObjectDocument::new("order", "abc-123");
        assert_eq!(
            document.active_stream.current_stream_version,
            EMPTY_STREAM_VERSION
        );
        assert_eq!(document.previous_hash, GENESIS_HASH);
    }

    #[test]
    fn seal_rolls_hash_into_previous_hash() {
        let mut document = ObjectDocument::new("order", "abc-123");
        let initial_hash = document.hash.clone();

        document.active_stream.current_stream_version = 0;
        document.seal();

        assert_eq!(document.previous_hash, initial_hash);
        assert_ne!(document.hash, initial_hash);
    }

    #[test]
    fn chunk_next_starts_where_previous_left_off() {
        let genesis = StreamChunk::genesis();
        let mut chunk = genesis.clone();
        chunk.last_version = 999;

        let next = chunk.next();
        assert_eq!(next.chunk_id, 1);
        assert_eq!(next.first_version, 1000);
        assert_eq!(next.last_version, 999);
    }
}
