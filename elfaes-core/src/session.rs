//! The leased session (§4.3): collects events produced inside a single
//! user-provided block, assigns monotonic versions, evaluates pre-append
//! hooks, commits with chunk management, and runs post-commit hooks.
//!
//! Not safe for concurrent use: event numbering and buffer mutation are
//! single-threaded within one session (§5 Scheduling model).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::value::RawValue;

use crate::data_store::{DataStore, NewEvent};
use crate::document_store::{self, DocumentStore};
use crate::error::{DomainError, PostCommitFailure, ValidationError};
use crate::message::{ActionMetadata, Metadata};
use crate::model::{ObjectDocument, StreamChunk};
use crate::version::Version;

/// The constraint a caller may place on the stream's state at [`Session`]
/// open time (§4.3 Open).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenConstraint {
    /// No constraint: the session opens regardless of the stream's state.
    Loose,
    /// The stream must already have at least one event.
    Existing,
    /// The stream must be empty.
    New,
}

impl OpenConstraint {
    fn check(self, document: &ObjectDocument) -> Result<(), DomainError> {
        let stream_identifier = document.active_stream.stream_identifier.clone();
        let current = document.active_stream.current_stream_version;

        match self {
            Self::Loose => Ok(()),
            Self::Existing if current == crate::version::EMPTY_STREAM_VERSION => {
                Err(DomainError::ConstraintViolation {
                    stream_identifier,
                    reason: "stream does not exist yet",
                })
            }
            Self::Existing => Ok(()),
            Self::New if current != crate::version::EMPTY_STREAM_VERSION => {
                Err(DomainError::ConstraintViolation {
                    stream_identifier,
                    reason: "stream already has events",
                })
            }
            Self::New => Ok(()),
        }
    }
}

type EncodeFn = Arc<dyn Fn(&dyn Any) -> Result<Box<RawValue>, serde_json::Error> + Send + Sync>;

#[derive(Clone)]
struct EventTypeEntry {
    name: String,
    encode: EncodeFn,
}

/// Maps a Rust payload type to the domain event name and JSON encoder the
/// session uses when that type is appended (§4.3 Append: "looks up the
/// event type registry to obtain the event name and JSON encoder").
#[derive(Clone, Default)]
pub struct EventTypeRegistry {
    entries: HashMap<TypeId, EventTypeEntry>,
}

impl EventTypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `name`. A later registration for the same `T`
    /// replaces the earlier one.
    pub fn register<T>(&mut self, name: impl Into<String>)
    where
        T: Serialize + 'static,
    {
        let encode: EncodeFn = Arc::new(|payload: &dyn Any| {
            let payload = payload
                .downcast_ref::<T>()
                .expect("registry invariant: encoder called with the type it was registered for");
            RawValue::from_string(serde_json::to_string(payload)?)
        });
        self.entries.insert(TypeId::of::<T>(), EventTypeEntry { name: name.into(), encode });
    }

    fn lookup<T: 'static>(&self) -> Option<&EventTypeEntry> {
        self.entries.get(&TypeId::of::<T>())
    }
}

/// A pre-append hook: transforms an event's encoded JSON payload before it
/// is buffered (§4.3 Append, §4.4 registration surface).
pub type PreAppendHook = Arc<dyn Fn(Box<RawValue>) -> Box<RawValue> + Send + Sync>;

/// A post-commit hook: observes the full committed batch after a successful
/// commit. Returning `Err` records the hook as failed without rolling back
/// the already-durable events (§7 Post-commit).
pub type PostCommitHook =
    Arc<dyn Fn(&ObjectDocument, &[NewEvent]) -> Result<(), anyhow::Error> + Send + Sync>;

/// Notified with the identifier of a chunk that has just filled, right after
/// the document recording its successor is saved (§4.3 Commit, chunked).
pub type ChunkClosedHook = Arc<dyn Fn(u32) + Send + Sync>;

/// The cumulative, order-preserving hook registrations a [`Session`] is
/// opened with (§4.4). Built once by the façade and injected into every
/// session it opens.
#[derive(Clone, Default)]
pub struct SessionHooks {
    pub pre_append: Vec<PreAppendHook>,
    pub post_commit: Vec<PostCommitHook>,
    pub chunk_closed: Vec<ChunkClosedHook>,
}

/// A handle to an event appended within the current session, returned by
/// [`Session::append`] (§4.3 Append).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHandle {
    pub version: Version,
    pub event_type: String,
}

/// Collects events produced inside a single user block, assigns monotonic
/// versions, and commits them with the two-phase protocol (§4.3).
///
/// `Session` is `!Sync` by convention (not enforced at the type level, since
/// the capability traits require `Send + Sync` on the stores themselves):
/// callers must not share one instance across concurrent tasks (§5
/// Scheduling model).
pub struct Session<'a, D, S> {
    documents: &'a D,
    data: &'a S,
    document: ObjectDocument,
    event_types: &'a EventTypeRegistry,
    hooks: SessionHooks,
    buffer: Vec<NewEvent>,
}

impl<'a, D, S> Session<'a, D, S>
where
    D: DocumentStore,
    S: DataStore,
{
    /// Opens a session over `document`, enforcing `constraint` (§4.3 Open).
    pub fn open(
        documents: &'a D,
        data: &'a S,
        document: ObjectDocument,
        event_types: &'a EventTypeRegistry,
        hooks: SessionHooks,
        constraint: OpenConstraint,
    ) -> Result<Self, DomainError> {
        constraint.check(&document)?;
        Ok(Self {
            documents,
            data,
            document,
            event_types,
            hooks,
            buffer: Vec::new(),
        })
    }

    #[must_use]
    pub fn document(&self) -> &ObjectDocument {
        &self.document
    }

    /// Appends a typed payload to the in-memory buffer (§4.3 Append).
    ///
    /// Per the resolved Open Question in SPEC_FULL.md §4.3: the in-memory
    /// version counter only advances once the payload has been encoded and
    /// every pre-append hook has run without error. A failing hook leaves
    /// `current_stream_version` untouched, so a caller that catches the
    /// error and keeps using the session does not observe a version gap.
    pub fn append<T>(
        &mut self,
        payload: T,
        action_metadata: Option<ActionMetadata>,
        event_type_override: Option<String>,
        external_sequencer: Option<String>,
        metadata: Option<Metadata>,
    ) -> Result<EventHandle, DomainError>
    where
        T: 'static,
    {
        let entry = self.event_types.lookup::<T>().ok_or_else(|| {
            DomainError::Validation(ValidationError::UnregisteredEventType(
                std::any::type_name::<T>().to_owned(),
            ))
        })?;

        let mut encoded = (entry.encode)(&payload).map_err(|source| {
            DomainError::Validation(ValidationError::UndecodableEvent {
                version: self.next_version(),
                source,
            })
        })?;

        for hook in &self.hooks.pre_append {
            encoded = hook(encoded);
        }

        let version = self.next_version();
        let event_type = event_type_override.unwrap_or_else(|| entry.name.clone());

        self.document.active_stream.current_stream_version = version;

        self.buffer.push(NewEvent {
            event_type: event_type.clone(),
            version,
            timestamp: Utc::now(),
            payload: encoded,
            action_metadata: action_metadata.unwrap_or_default(),
            metadata: metadata.unwrap_or_default(),
            external_sequencer,
            schema_version: self.document.schema_version.clone(),
        });

        Ok(EventHandle { version, event_type })
    }

    fn next_version(&self) -> Version {
        self.document.active_stream.current_stream_version + 1
    }

    /// Commits the buffered batch (§4.3 Commit) and clears the buffer.
    /// Dispatches to the chunked or unchunked path depending on
    /// `document.active_stream.chunk_settings.enabled`.
    pub async fn commit(mut self) -> Result<Vec<NewEvent>, DomainError> {
        if self.buffer.is_empty() {
            return Ok(Vec::new());
        }

        let committed = if self.document.active_stream.chunk_settings.enabled {
            self.commit_chunked().await?
        } else {
            self.commit_unchunked().await?
        };

        self.run_post_commit_hooks(&committed)?;
        Ok(committed)
    }

    async fn commit_unchunked(&mut self) -> Result<Vec<NewEvent>, DomainError> {
        let events = std::mem::take(&mut self.buffer);

        self.document.seal();
        self.documents.set(&mut self.document).await?;
        self.data.append(&self.document, events.clone(), false).await?;

        Ok(events)
    }

    /// Partitions the buffer across chunk boundaries computed by
    /// subtraction against each chunk's `[first_version, first_version +
    /// chunk_size - 1]` range, never by modulo on a possibly-negative value
    /// (§4.3 Commit, chunked).
    async fn commit_chunked(&mut self) -> Result<Vec<NewEvent>, DomainError> {
        if self.document.active_stream.chunks.is_empty() {
            // Chunking was just enabled (fresh stream, or turned on partway
            // through): open chunk 0 starting at the first buffered event's
            // version. `current_stream_version` has already been advanced
            // past every buffered event by `append`, so it cannot be used
            // here — the buffer itself is the source of truth for where
            // this commit actually starts.
            let first_version = self
                .buffer
                .first()
                .map(|event| event.version)
                .unwrap_or_else(|| self.next_version());
            self.document.active_stream.chunks.push(StreamChunk {
                chunk_id: 0,
                first_version,
                last_version: first_version - 1,
            });
        }

        let chunk_size = self.document.active_stream.chunk_settings.chunk_size;
        let events = std::mem::take(&mut self.buffer);
        let mut committed = Vec::with_capacity(events.len());
        let mut remaining = events.into_iter().peekable();

        while remaining.peek().is_some() {
            let chunk_end = {
                let chunk = self
                    .document
                    .active_stream
                    .last_chunk()
                    .expect("chunked stream always has at least one chunk open");
                chunk.first_version as i64 + chunk_size as i64 - 1
            };

            let mut partition = Vec::new();
            while let Some(event) = remaining.peek() {
                if event.version as i64 > chunk_end {
                    break;
                }
                partition.push(remaining.next().expect("peeked Some"));
            }

            if partition.is_empty() {
                // The buffer's next version doesn't fit even a fresh chunk
                // (chunk_size == 0 or a corrupt chunk boundary); avoid
                // looping forever and surface it as a validation failure.
                return Err(DomainError::Validation(ValidationError::StreamMismatch {
                    expected: format!("version <= {chunk_end}"),
                    actual: remaining
                        .peek()
                        .map(|e| e.version.to_string())
                        .unwrap_or_default(),
                }));
            }

            let partition_max = partition.iter().map(|e| e.version).max().expect("non-empty");
            let chunk_id = {
                let chunk = self
                    .document
                    .active_stream
                    .last_chunk_mut()
                    .expect("chunked stream always has at least one chunk open");
                chunk.last_version = partition_max;
                chunk.chunk_id
            };

            self.document.seal();
            self.documents.set(&mut self.document).await?;

            self.data.append(&self.document, partition.clone(), false).await?;

            committed.extend(partition);

            if partition_max as i64 == chunk_end {
                let next_chunk = self
                    .document
                    .active_stream
                    .last_chunk()
                    .expect("just appended to")
                    .next();
                self.document.active_stream.chunks.push(next_chunk);
                self.document.seal();
                self.documents.set(&mut self.document).await?;

                for hook in &self.hooks.chunk_closed {
                    hook(chunk_id);
                }
            }
        }

        Ok(committed)
    }

    fn run_post_commit_hooks(&self, committed: &[NewEvent]) -> Result<(), DomainError> {
        if self.hooks.post_commit.is_empty() || committed.is_empty() {
            return Ok(());
        }

        let mut failed = Vec::new();
        let mut succeeded = Vec::new();
        let mut first_error = None;

        for (index, hook) in self.hooks.post_commit.iter().enumerate() {
            match hook(&self.document, committed) {
                Ok(()) => succeeded.push(index.to_string()),
                Err(error) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                    failed.push(index.to_string());
                }
            }
        }

        if let Some(first_error) = first_error {
            let versions: Vec<Version> = committed.iter().map(|e| e.version).collect();
            let range = (
                *versions.iter().min().expect("non-empty"),
                *versions.iter().max().expect("non-empty"),
            );

            return Err(DomainError::PostCommit(PostCommitFailure {
                failed_actions: failed,
                succeeded_actions: succeeded,
                committed_events: committed.len(),
                committed_version_range: range,
                first_error,
            }));
        }

        Ok(())
    }
}

/// Loads or creates the document for `(object_name, object_id)` and opens a
/// session over it (§4.1 Create composed with §4.3 Open).
pub async fn open_session<'a, D, S>(
    documents: &'a D,
    data: &'a S,
    object_name: &str,
    object_id: &str,
    event_types: &'a EventTypeRegistry,
    hooks: SessionHooks,
    constraint: OpenConstraint,
) -> Result<Session<'a, D, S>, DomainError>
where
    D: DocumentStore,
    S: DataStore,
{
    let document = document_store::create_or_load(documents, data, object_name, object_id, None).await?;
    Session::open(documents, data, document, event_types, hooks, constraint)
}
