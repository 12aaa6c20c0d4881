//! Encodes and decodes event and commit-marker records as newline-delimited
//! JSON (§6 On-blob format). Payloads are kept as raw JSON bytes end to end
//! so that bridging JSON-to-JSON never re-quotes them (§9 Dynamic JSON
//! payload).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::message::{ActionMetadata, Metadata};
use crate::version::Version;

/// Marker byte sequence a raw blob line is prefixed with when it is a
/// [`CommitMarker`] rather than an [`EventRecord`] (§4.2.1 step 5).
pub const MARKER_PREFIX: &str = "{\"$m\":";

/// An immutable, append-only event record (§3 Event record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "eventType")]
    pub event_type: String,

    #[serde(rename = "eventVersion")]
    pub event_version: Version,

    pub timestamp: DateTime<Utc>,

    /// Raw, not re-quoted, JSON payload. Validity of the bytes is the
    /// producer's responsibility (§9 Dynamic JSON payload).
    pub payload: Box<RawValue>,

    #[serde(rename = "actionMetadata", default, skip_serializing_if = "is_default_action")]
    pub action_metadata: ActionMetadata,

    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,

    #[serde(rename = "externalSequencer", skip_serializing_if = "Option::is_none")]
    pub external_sequencer: Option<String>,

    #[serde(rename = "schemaVersion")]
    pub schema_version: String,
}

fn is_default_action(action: &ActionMetadata) -> bool {
    action.causation_id.is_none() && action.correlation_id.is_none()
}

impl EventRecord {
    /// `true` for an event whose `event_type` marks the stream as closed
    /// (§4.2.1 step 5, the `closed` flag precedent aside).
    #[must_use]
    pub fn is_stream_closed_event(&self) -> bool {
        self.event_type == "EventStream.Closed"
    }
}

/// An immutable, in-line sentinel that closes a batch and records the
/// document hash chain (§3 Commit marker).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitMarker {
    #[serde(rename = "$m")]
    pub marker_tag: MarkerTag,

    /// The document hash *after* the batch this marker closes.
    pub h: String,

    /// The document hash this marker's batch was built against (`"*"` for
    /// the genesis marker, or the prior marker's `h`).
    pub ph: String,

    /// The stream version of the last event covered by this marker.
    pub v: Version,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub o: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkerTag {
    #[serde(rename = "c")]
    Commit,
}

impl CommitMarker {
    /// Builds the genesis marker for a newly created blob (§6 Genesis
    /// marker): `h = document.hash ?? "*"`, `ph = "*"`, `v = 0`, `o = 0`.
    #[must_use]
    pub fn genesis(document_hash: &str) -> Self {
        Self {
            marker_tag: MarkerTag::Commit,
            h: if document_hash.is_empty() {
                "*".to_owned()
            } else {
                document_hash.to_owned()
            },
            ph: "*".to_owned(),
            v: 0,
            o: Some(0),
            closed: None,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.unwrap_or(false)
    }
}

/// One decoded line of an append-blob: either a persisted event, or a
/// commit marker.
#[derive(Debug, Clone)]
pub enum Line {
    Event(EventRecord),
    Marker(CommitMarker),
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to decode blob line as JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Classifies and decodes a single newline-delimited blob line.
pub fn decode_line(line: &str) -> Result<Line, CodecError> {
    if line.starts_with(MARKER_PREFIX) {
        Ok(Line::Marker(serde_json::from_str(line)?))
    } else {
        Ok(Line::Event(serde_json::from_str(line)?))
    }
}

/// Encodes an event record as a single NDJSON line, terminated with `\n`.
pub fn encode_event_line(event: &EventRecord) -> Result<String, CodecError> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    Ok(line)
}

/// Encodes a commit marker as a single NDJSON line, terminated with `\n`.
pub fn encode_marker_line(marker: &CommitMarker) -> Result<String, CodecError> {
    let mut line = serde_json::to_string(marker)?;
    line.push('\n');
    Ok(line)
}

/// Splits a downloaded blob chunk into its constituent lines, tolerating a
/// trailing partial line with no terminator (can happen when ranged reads
/// land mid-line; callers reading from a known marker offset never hit
/// this, but a defensive tail scan might).
pub fn split_lines(body: &str) -> impl Iterator<Item = &str> {
    body.lines().filter(|line| !line.is_empty())
}
