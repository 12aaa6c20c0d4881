//! Contains the types necessary for Optimistic Concurrency Control, both on
//! the document (entity-tag based) and on the event log (byte-offset based).

use std::fmt;

use serde::{Deserialize, Serialize};

/// A stream version. `-1` denotes an empty stream (no events appended yet),
/// matching the `current stream version == -1` sentinel used throughout the
/// append-blob protocol (§3, §4.3).
pub type Version = i64;

/// Sentinel value for a stream that has never been appended to.
pub const EMPTY_STREAM_VERSION: Version = -1;

/// Opaque optimistic-concurrency token returned by the document backend.
///
/// Used as the `If-Match`/`If-None-Match` precondition on every mutating
/// document write (§4.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityTag(pub String);

impl fmt::Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte offset into an append-blob, used as the `If-Append-Position-Equal`
/// precondition on every append-block request (§4.2.1 step 9).
pub type ByteOffset = u64;

/// This error is returned when an optimistic-concurrency precondition (on
/// either the document's entity tag or the blob's byte offset) has been
/// refused by the backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("ES_CONCURRENCY_CONFLICT: optimistic concurrency conflict on {subject}: expected {expected}, found {actual}")]
pub struct OptimisticConflict {
    /// What the precondition was guarding: `"document"` or `"stream offset"`.
    pub subject: &'static str,
    pub expected: String,
    pub actual: String,
}

impl OptimisticConflict {
    #[must_use]
    pub fn document(expected: &EntityTag, actual: &EntityTag) -> Self {
        Self {
            subject: "document",
            expected: expected.0.clone(),
            actual: actual.0.clone(),
        }
    }

    #[must_use]
    pub fn stream_offset(expected: ByteOffset, actual: ByteOffset) -> Self {
        Self {
            subject: "stream offset",
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    #[must_use]
    pub fn marker_hash(expected: &str, actual: &str) -> Self {
        Self {
            subject: "marker hash",
            expected: expected.to_owned(),
            actual: actual.to_owned(),
        }
    }
}
