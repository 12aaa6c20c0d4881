//! Contains the definition of the metadata types carried alongside every
//! persisted [`event::Envelope`][crate::codec::EventRecord], plus the action
//! metadata recorded by the [`session`][crate::session] on append.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Free-form string metadata attached to an event record.
///
/// Kept as a flat `String -> String` map rather than arbitrary JSON: the
/// on-blob format (§6) only ever needs key/value annotations (trace ids,
/// tenant ids, and so on), never nested structure.
pub type Metadata = HashMap<String, String>;

/// Causation/correlation metadata recorded by the session for every batch of
/// events appended within one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMetadata {
    /// Identifier of the action (command, external request, ...) that
    /// caused this batch of events to be recorded.
    #[serde(rename = "causationId", skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Identifier shared by every message that is part of the same logical
    /// operation, used to correlate events across streams.
    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ActionMetadata {
    #[must_use]
    pub fn new(causation_id: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            causation_id: Some(causation_id.into()),
            correlation_id: Some(correlation_id.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_metadata_omits_absent_fields_on_serialization() {
        let metadata = ActionMetadata::default();
        let json = serde_json::to_string(&metadata).unwrap();

        assert_eq!(json, "{}");
    }

    #[test]
    fn action_metadata_round_trips() {
        let metadata = ActionMetadata::new("cmd-1", "corr-1");
        let json = serde_json::to_string(&metadata).unwrap();
        let decoded: ActionMetadata = serde_json::from_str(&json).unwrap();

        assert_eq!(metadata, decoded);
    }
}
