//! Layered configuration (§6 Configuration, §0 expansion). Resolves the
//! recognized keys down to the constants the data store and resilience
//! wrapper fall back on when a caller does not override them.

use serde::{Deserialize, Serialize};

use crate::data_store::{BLOCK_COUNT_THRESHOLD, INCREMENTAL_READ_THRESHOLD, TAIL_READ_SIZE};

/// The recognized configuration keys for one backend (§6 Configuration).
///
/// Every field is optional on deserialization; [`Config::resolved`] fills in
/// the protocol defaults for anything left unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    pub default_document_store: Option<String>,
    pub default_data_store: Option<String>,
    pub default_document_container: Option<String>,
    pub default_document_bucket: Option<String>,
    pub default_document_tag_store: Option<String>,
    pub default_snap_shot_store: Option<String>,
    pub enable_stream_chunks: Option<bool>,
    pub default_chunk_size: Option<u64>,
    pub auto_create_container: Option<bool>,
    pub auto_create_bucket: Option<bool>,
    pub block_count_threshold: Option<u32>,
    pub tail_read_size: Option<u64>,
    pub incremental_read_threshold: Option<u64>,
}

/// [`Config`] with every optional key resolved to either the caller's
/// override or the protocol default (§4.2 constants).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTunables {
    pub block_count_threshold: u32,
    pub tail_read_size: u64,
    pub incremental_read_threshold: u64,
}

impl Default for ResolvedTunables {
    fn default() -> Self {
        Self {
            block_count_threshold: BLOCK_COUNT_THRESHOLD,
            tail_read_size: TAIL_READ_SIZE,
            incremental_read_threshold: INCREMENTAL_READ_THRESHOLD,
        }
    }
}

impl Config {
    /// Resolves the three data-store tunables, falling back to the protocol
    /// defaults for anything left unset (§6 Configuration overrides).
    #[must_use]
    pub fn resolved_tunables(&self) -> ResolvedTunables {
        let defaults = ResolvedTunables::default();
        ResolvedTunables {
            block_count_threshold: self
                .block_count_threshold
                .unwrap_or(defaults.block_count_threshold),
            tail_read_size: self.tail_read_size.unwrap_or(defaults.tail_read_size),
            incremental_read_threshold: self
                .incremental_read_threshold
                .unwrap_or(defaults.incremental_read_threshold),
        }
    }

    /// Default chunk size when [`Config::default_chunk_size`] is unset
    /// (matches [`crate::model::ChunkSettings::default`]).
    #[must_use]
    pub fn chunk_size_or_default(&self) -> u64 {
        self.default_chunk_size.unwrap_or(10_000)
    }

    /// `true` if chunking is enabled for streams created under this config.
    #[must_use]
    pub fn stream_chunks_enabled(&self) -> bool {
        self.enable_stream_chunks.unwrap_or(false)
    }

    /// `true` if the named container/bucket should be lazily created rather
    /// than requiring pre-provisioning (§4.1 Container/bucket verification).
    #[must_use]
    pub fn auto_create(&self) -> bool {
        self.auto_create_container.unwrap_or(false) || self.auto_create_bucket.unwrap_or(false)
    }
}
