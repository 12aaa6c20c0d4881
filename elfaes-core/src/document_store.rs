//! The object-document store capability (§4.1): load/save the per-object
//! metadata document under an entity-tag precondition.

use async_trait::async_trait;

use crate::data_store::DataStore;
use crate::model::ObjectDocument;
use crate::version::{EntityTag, OptimisticConflict};

/// Errors a [`DocumentStore`] backend can raise. Backends wrap their own
/// SDK/driver errors behind [`DocumentStoreError::Backend`].
#[derive(Debug, thiserror::Error)]
pub enum DocumentStoreError {
    #[error("document for object '{0}' was not found")]
    NotFound(String),

    #[error(transparent)]
    Conflict(#[from] OptimisticConflict),

    #[error("ELFAES-CFG-0003: container/bucket '{0}' is not configured and auto-create is disabled")]
    MissingContainer(String),

    /// An opaque infrastructure failure. `transient` records whether the
    /// [`resilience`][crate::resilience] wrapper should retry the call that
    /// produced it (§4.7, §5 Retries).
    #[error("backend error: {source}")]
    Backend {
        #[source]
        source: anyhow::Error,
        transient: bool,
    },
}

impl DocumentStoreError {
    #[must_use]
    pub fn backend(source: impl Into<anyhow::Error>, transient: bool) -> Self {
        Self::Backend {
            source: source.into(),
            transient,
        }
    }

    /// `true` if the [`resilience`][crate::resilience] wrapper should retry
    /// the operation that produced this error (§4.7).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend { transient: true, .. })
    }
}

/// Capability set a backend must provide to act as the object-document
/// store (§4.1 Operations, minus [`create`][create_document] which is a
/// cross-store orchestration and lives as a free function below).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Reads the entity tag and body for `(object_name, object_id)`,
    /// optionally scoped to a non-default store name. Fails with
    /// [`DocumentStoreError::NotFound`] if the document does not exist.
    async fn get(
        &self,
        object_name: &str,
        object_id: &str,
        store_override: Option<&str>,
    ) -> Result<ObjectDocument, DocumentStoreError>;

    /// Writes `document` via `If-Match: <prior tag>` when the document
    /// carries an entity tag, or `If-None-Match: *` for a document that has
    /// never been persisted. On success, updates `document.entity_tag` to
    /// the tag the backend assigned.
    async fn set(&self, document: &mut ObjectDocument) -> Result<(), DocumentStoreError>;

    /// Resolves a document via a previously recorded tag (e.g. an
    /// idempotency key), returning the first match.
    async fn get_first_by_tag(&self, tag: &str) -> Result<ObjectDocument, DocumentStoreError>;

    /// Resolves every document carrying `tag`.
    async fn get_by_tag(&self, tag: &str) -> Result<Vec<ObjectDocument>, DocumentStoreError>;

    /// Ensures the backend's container/bucket exists, performed at most
    /// once per process per container via the caller-supplied guard set
    /// (§4.1 Container/bucket verification). `auto_create` toggles whether
    /// a missing container is lazily created versus surfacing
    /// [`DocumentStoreError::MissingContainer`].
    async fn ensure_container(&self, auto_create: bool) -> Result<(), DocumentStoreError>;
}

/// Loads the document for `(object_name, object_id)` if present; otherwise
/// constructs a new one and, when `data_store` uses an append-blob, creates
/// the initial blob with a genesis commit marker (§4.1 Create).
///
/// Racing creators converge: a concurrent "blob already exists" is treated
/// as a successful creation by the append-blob backend itself (idempotent
/// against concurrent creators), and the document write below still goes
/// through the usual `If-None-Match: *` precondition, so at most one
/// creator's document write wins; the other observes
/// [`DocumentStoreError::Conflict`] and should re-`get` instead.
pub async fn create_or_load<D, S>(
    documents: &D,
    data: &S,
    object_name: &str,
    object_id: &str,
    store_override: Option<&str>,
) -> Result<ObjectDocument, DocumentStoreError>
where
    D: DocumentStore + ?Sized,
    S: DataStore + ?Sized,
{
    match documents.get(object_name, object_id, store_override).await {
        Ok(document) => Ok(document),
        Err(DocumentStoreError::NotFound(_)) => {
            let mut document = ObjectDocument::new(object_name, object_id);
            data.create_initial_blob(&document).await.map_err(|e| {
                let transient = e.is_transient();
                DocumentStoreError::backend(anyhow::Error::from(e), transient)
            })?;
            documents.set(&mut document).await?;
            Ok(document)
        }
        Err(other) => Err(other),
    }
}

/// Saves `document`'s new hash and entity tag after a successful Phase 1
/// write, discarding the prior entity tag (§4.1 Set).
pub fn record_saved_tag(document: &mut ObjectDocument, new_tag: EntityTag) {
    document.entity_tag = Some(new_tag);
}
