//! Error taxonomy (§7). Every domain error carries a stable code that
//! prefixes its human message, per §6 Error payload conventions.

use crate::model::StreamIdentifier;
use crate::version::OptimisticConflict;

/// Errors raised while resolving configuration (§0 Configuration, §7
/// Configuration).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("ELFAES-CFG-0001: no document store named '{0}' is configured")]
    MissingDocumentStore(String),

    #[error("ELFAES-CFG-0002: no data store named '{0}' is configured")]
    MissingDataStore(String),

    #[error("ELFAES-CFG-0003: container/bucket '{0}' is not configured and auto-create is disabled")]
    MissingContainer(String),

    #[error("ELFAES-CFG-0004: unable to select a factory for stream type '{0}'")]
    UnableToCreateEventStreamForStreamType(String),
}

/// Errors raised while validating inputs at the session/codec boundary
/// (§7 Validation).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("ELFAES-VAL-0001: object id '{0}' is not a valid identifier")]
    InvalidObjectId(String),

    #[error("ELFAES-VAL-0001: event type '{0}' is not registered on this stream")]
    UnregisteredEventType(String),

    #[error("ELFAES-VAL-0004: failed to decode in-transit event at version {version}: {source}")]
    UndecodableEvent {
        version: crate::version::Version,
        #[source]
        source: serde_json::Error,
    },

    #[error("ELFAES-VAL-0004: version token stream mismatch: expected stream '{expected}', found '{actual}'")]
    StreamMismatch { expected: String, actual: String },
}

/// Detail carried by [`DomainError::StreamClosed`], enabling the caller to
/// retarget to the continuation stream (§6 Continuation contract).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamClosedInfo {
    pub stream_identifier: StreamIdentifier,
    pub continuation_stream_id: Option<StreamIdentifier>,
    pub continuation_stream_type: Option<String>,
    pub continuation_data_store: Option<String>,
    pub continuation_document_store: Option<String>,
    pub reason: Option<String>,
}

/// Errors raised when a post-commit hook failed; the events are nevertheless
/// durably committed (§7 Post-commit).
#[derive(Debug)]
pub struct PostCommitFailure {
    pub failed_actions: Vec<String>,
    pub succeeded_actions: Vec<String>,
    pub committed_events: usize,
    pub committed_version_range: (crate::version::Version, crate::version::Version),
    pub first_error: anyhow::Error,
}

impl std::fmt::Display for PostCommitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ELFAES-POSTCOMMIT-0001: {} post-commit hook(s) failed ({:?}); first error: {}",
            self.failed_actions.len(),
            self.failed_actions,
            self.first_error
        )
    }
}

impl std::error::Error for PostCommitFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.first_error.as_ref())
    }
}

/// Errors raised when commit cleanup (for backends that can truncate a
/// partial commit) itself failed, carrying both the original commit error
/// and the cleanup error (§7 Commit).
#[derive(Debug, thiserror::Error)]
#[error("ELFAES-COMMIT-0002: commit failed ({commit_error}) and cleanup also failed: {cleanup_error}")]
pub struct CommitCleanupFailure {
    pub commit_error: anyhow::Error,
    pub cleanup_error: anyhow::Error,
}

/// Top-level domain error type returned by the façade and the leased
/// session. Infrastructure/transient errors never reach this type directly:
/// the [`resilience`][crate::resilience] wrapper recovers them locally, and
/// what remains is wrapped in [`DomainError::Backend`].
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Conflict(#[from] OptimisticConflict),

    #[error("ELFAES-BIZ-0001: constraint violation opening session on stream '{stream_identifier}': {reason}")]
    ConstraintViolation {
        stream_identifier: StreamIdentifier,
        reason: &'static str,
    },

    #[error("ES_STREAM_CLOSED: event stream '{}' is closed", .0.stream_identifier)]
    StreamClosed(StreamClosedInfo),

    #[error("document '{object_id}' was not found")]
    DocumentNotFound { object_id: String },

    #[error("ELFAES-STALE-0001: stale decision: validated checkpoint {expected} no longer matches {actual}")]
    StaleDecision {
        expected: crate::version::Version,
        actual: crate::version::Version,
    },

    #[error(transparent)]
    CommitCleanup(#[from] CommitCleanupFailure),

    #[error(transparent)]
    PostCommit(#[from] PostCommitFailure),

    #[error("backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl From<crate::data_store::DataStoreError> for DomainError {
    fn from(error: crate::data_store::DataStoreError) -> Self {
        use crate::data_store::DataStoreError;
        match error {
            DataStoreError::Conflict(conflict) => Self::Conflict(conflict),
            DataStoreError::StreamClosed(info) => Self::StreamClosed(info),
            DataStoreError::Backend { source, .. } => Self::Backend(source),
        }
    }
}

impl From<crate::document_store::DocumentStoreError> for DomainError {
    fn from(error: crate::document_store::DocumentStoreError) -> Self {
        use crate::document_store::DocumentStoreError;
        match error {
            DocumentStoreError::NotFound(object_id) => Self::DocumentNotFound { object_id },
            DocumentStoreError::Conflict(conflict) => Self::Conflict(conflict),
            DocumentStoreError::MissingContainer(container) => {
                Self::Config(ConfigError::MissingContainer(container))
            }
            DocumentStoreError::Backend { source, .. } => Self::Backend(source),
        }
    }
}

impl DomainError {
    /// `ES_CONCURRENCY_CONFLICT`/`ES_STREAM_CLOSED` per §6; used by callers
    /// that need the stable string code rather than the formatted message.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(ConfigError::MissingDocumentStore(_)) => "ELFAES-CFG-0001",
            Self::Config(ConfigError::MissingDataStore(_)) => "ELFAES-CFG-0002",
            Self::Config(ConfigError::MissingContainer(_)) => "ELFAES-CFG-0003",
            Self::Config(ConfigError::UnableToCreateEventStreamForStreamType(_)) => {
                "ELFAES-CFG-0004"
            }
            Self::Validation(ValidationError::InvalidObjectId(_))
            | Self::Validation(ValidationError::UnregisteredEventType(_)) => "ELFAES-VAL-0001",
            Self::Validation(ValidationError::UndecodableEvent { .. })
            | Self::Validation(ValidationError::StreamMismatch { .. }) => "ELFAES-VAL-0004",
            Self::Conflict(_) => "ES_CONCURRENCY_CONFLICT",
            Self::ConstraintViolation { .. } => "ELFAES-BIZ-0001",
            Self::StreamClosed(_) => "ES_STREAM_CLOSED",
            Self::DocumentNotFound { .. } => "ELFAES-VAL-0001",
            Self::StaleDecision { .. } => "ELFAES-STALE-0001",
            Self::CommitCleanup(_) => "ELFAES-COMMIT-0002",
            Self::PostCommit(_) => "ELFAES-POSTCOMMIT-0001",
            Self::Backend(_) => "ELFAES-BACKEND-0000",
        }
    }
}
