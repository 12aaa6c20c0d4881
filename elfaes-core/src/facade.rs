//! Event stream façade (§4.4): the registration surface for event types,
//! hooks, and upcasters, plus the three operations it exposes to the
//! external aggregate/projection collaborators this crate treats as
//! boundaries — read, session, snapshot.

use async_trait::async_trait;

use crate::codec::EventRecord;
use crate::data_store::DataStore;
use crate::document_store::{self, DocumentStore};
use crate::error::DomainError;
use crate::session::{
    ChunkClosedHook, EventTypeRegistry, OpenConstraint, PostCommitHook, PreAppendHook, Session,
    SessionHooks,
};
use crate::upcaster::Upcasters;
use crate::version::Version;

/// A post-read hook: transforms the fully upcast sequence right before it
/// is returned to the caller (§4.4 registration surface).
pub type PostReadHook = std::sync::Arc<dyn Fn(Vec<EventRecord>) -> Vec<EventRecord> + Send + Sync>;

/// The snapshot-store collaborator contract (§4.4 Snapshot, §1 Non-goals:
/// snapshot *policy* lives outside this crate — this is only the seam the
/// façade calls through).
#[async_trait]
pub trait SnapshotStore<State>: Send + Sync
where
    State: Send + Sync,
{
    /// Loads the most recently saved snapshot for `object_id`, if any.
    async fn load(&self, object_id: &str) -> Result<Option<(Version, State)>, anyhow::Error>;

    /// Persists `state` as the snapshot at `version` for `object_id`.
    async fn save(&self, object_id: &str, version: Version, state: &State) -> Result<(), anyhow::Error>;
}

/// Registers event types/hooks/upcasters and exposes read, session, and
/// snapshot operations over a `(DocumentStore, DataStore)` pair (§4.4, §4.6).
pub struct EventStreamFacade<D, S> {
    documents: D,
    data: S,
    event_types: EventTypeRegistry,
    pre_append: Vec<PreAppendHook>,
    post_read: Vec<PostReadHook>,
    post_commit: Vec<PostCommitHook>,
    chunk_closed: Vec<ChunkClosedHook>,
    upcasters: Upcasters,
}

impl<D, S> EventStreamFacade<D, S>
where
    D: DocumentStore,
    S: DataStore,
{
    pub fn new(documents: D, data: S) -> Self {
        Self {
            documents,
            data,
            event_types: EventTypeRegistry::new(),
            pre_append: Vec::new(),
            post_read: Vec::new(),
            post_commit: Vec::new(),
            chunk_closed: Vec::new(),
            upcasters: Upcasters::new(),
        }
    }

    #[must_use]
    pub fn documents(&self) -> &D {
        &self.documents
    }

    #[must_use]
    pub fn data(&self) -> &S {
        &self.data
    }

    /// Registers a Rust payload type under `name` so that sessions opened
    /// through this façade can append it (§4.4 registration surface).
    pub fn register_event_type<T>(&mut self, name: impl Into<String>)
    where
        T: serde::Serialize + 'static,
    {
        self.event_types.register::<T>(name);
    }

    pub fn register_pre_append_hook(&mut self, hook: PreAppendHook) {
        self.pre_append.push(hook);
    }

    pub fn register_post_read_hook(&mut self, hook: PostReadHook) {
        self.post_read.push(hook);
    }

    pub fn register_post_commit_hook(&mut self, hook: PostCommitHook) {
        self.post_commit.push(hook);
    }

    pub fn register_chunk_closed_hook(&mut self, hook: ChunkClosedHook) {
        self.chunk_closed.push(hook);
    }

    /// Registers an upcaster transform. Returns the registry's
    /// [`RegistryFrozen`][crate::upcaster::RegistryFrozen] error if the
    /// registry has already been frozen.
    pub fn register_upcaster(
        &mut self,
        event_name: impl Into<String>,
        from_version: impl Into<String>,
        to_version: impl Into<String>,
        apply: impl Fn(EventRecord) -> Vec<EventRecord> + Send + Sync + 'static,
    ) -> Result<(), crate::upcaster::RegistryFrozen> {
        self.upcasters.register(event_name, from_version, to_version, apply)
    }

    /// Freezes the upcaster registry; no more upcasters may be registered
    /// afterward (§4.5).
    pub fn freeze_upcasters(&mut self) {
        self.upcasters.freeze();
    }

    /// Reads `[start, until ?? current]`, optionally stable-sorted by the
    /// external sequencer field, with the upcaster pipeline and post-read
    /// hooks applied (§4.4 Read).
    pub async fn read(
        &self,
        object_name: &str,
        object_id: &str,
        start: Version,
        until: Option<Version>,
        use_external_sequencer: bool,
    ) -> Result<Vec<EventRecord>, DomainError> {
        let document = self.documents.get(object_name, object_id, None).await?;

        let mut events = if document.active_stream.chunk_settings.enabled {
            let mut all = Vec::new();
            for chunk in &document.active_stream.chunks {
                let mut chunk_events =
                    self.data.read(&document, start, until, Some(chunk)).await?;
                all.append(&mut chunk_events);
            }
            all
        } else {
            self.data.read(&document, start, until, None).await?
        };

        if use_external_sequencer {
            events.sort_by(|a, b| a.external_sequencer.cmp(&b.external_sequencer));
        }

        let mut events = self.upcasters.apply_all(events);

        for hook in &self.post_read {
            events = hook(events);
        }

        Ok(events)
    }

    /// Loads or creates `(object_name, object_id)`'s document and opens a
    /// leased session over it, injecting the currently-registered hooks
    /// (§4.4 Session).
    pub async fn get_session(
        &self,
        object_name: &str,
        object_id: &str,
        constraint: OpenConstraint,
    ) -> Result<Session<'_, D, S>, DomainError> {
        let document =
            document_store::create_or_load(&self.documents, &self.data, object_name, object_id, None)
                .await?;

        let hooks = SessionHooks {
            pre_append: self.pre_append.clone(),
            post_commit: self.post_commit.clone(),
            chunk_closed: self.chunk_closed.clone(),
        };

        Session::open(
            &self.documents,
            &self.data,
            document,
            &self.event_types,
            hooks,
            constraint,
        )
    }

    /// Loads the snapshot at or below `current stream version` through
    /// `snapshots`, or `None` if the object has never been snapshotted;
    /// then, when `save` is `Some(state)`, persists a fresh snapshot at the
    /// document's current version and records the snapshot marker on the
    /// document (§4.4 Snapshot).
    pub async fn snapshot<Store, State>(
        &self,
        snapshots: &Store,
        object_name: &str,
        object_id: &str,
        save: Option<&State>,
    ) -> Result<Option<(Version, State)>, DomainError>
    where
        Store: SnapshotStore<State>,
        State: Send + Sync,
    {
        let mut document = self.documents.get(object_name, object_id, None).await?;

        let loaded = snapshots
            .load(object_id)
            .await
            .map_err(DomainError::Backend)?;

        let Some(state) = save else {
            return Ok(loaded);
        };

        let version = document.active_stream.current_stream_version;
        snapshots
            .save(object_id, version, state)
            .await
            .map_err(DomainError::Backend)?;

        document.snapshot_version = Some(version);
        document.seal();
        self.documents.set(&mut document).await?;

        Ok(loaded)
    }
}
