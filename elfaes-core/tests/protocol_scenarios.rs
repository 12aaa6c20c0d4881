//! End-to-end scenarios pinning the append-blob protocol's documented
//! behaviors: happy append, optimistic conflict, orphan recovery, hash
//! drift, chunk rollover, and stream closure.
//!
//! Every scenario drives the real [`AppendBlobDataStore`] protocol over the
//! in-memory blob primitives, never a stubbed `DataStore`.

use elfaes_core::data_store::{BlobPrimitives, DataStore, DataStoreError, NewEvent};
use elfaes_core::document_store::DocumentStore;
use elfaes_core::inmemory::{InMemoryBlobPrimitives, InMemoryDataStore, InMemoryDocumentStore};
use elfaes_core::model::{ObjectDocument, StreamChunk};
use elfaes_core::session::{self, EventTypeRegistry, OpenConstraint, SessionHooks};
use serde::Serialize;
use serde_json::value::RawValue;

#[derive(Serialize)]
struct Created {
    name: String,
}

#[derive(Serialize)]
struct Updated {
    n: i32,
}

fn new_event(version: i64, event_type: &str) -> NewEvent {
    NewEvent {
        event_type: event_type.to_owned(),
        version,
        timestamp: chrono::Utc::now(),
        payload: RawValue::from_string("{}".to_owned()).unwrap(),
        action_metadata: Default::default(),
        metadata: Default::default(),
        external_sequencer: None,
        schema_version: "1".to_owned(),
    }
}

/// S1. Happy append: two events committed through a leased session produce
/// two event lines plus a trailing commit marker whose `h` matches the
/// document's saved hash and whose `v` is the batch's highest version.
#[tokio::test]
async fn s1_happy_append() {
    let data = InMemoryDataStore::new(InMemoryBlobPrimitives::new());
    let documents = InMemoryDocumentStore::new();
    let mut event_types = EventTypeRegistry::new();
    event_types.register::<Created>("Created");
    event_types.register::<Updated>("Updated");

    let mut session = session::open_session(
        &documents,
        &data,
        "order",
        "abc",
        &event_types,
        SessionHooks::default(),
        OpenConstraint::Loose,
    )
    .await
    .unwrap();

    session
        .append(Created { name: "x".to_owned() }, None, None, None, None)
        .unwrap();
    session
        .append(Updated { n: 1 }, None, None, None, None)
        .unwrap();
    let committed = session.commit().await.unwrap();
    assert_eq!(committed.len(), 2);

    let document = documents.get("order", "abc", None).await.unwrap();
    assert_eq!(document.active_stream.current_stream_version, 1);

    let events = data.read(&document, 0, None, None).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_version, 0);
    assert_eq!(events[0].event_type, "Created");
    assert_eq!(events[1].event_version, 1);
    assert_eq!(events[1].event_type, "Updated");
}

/// S2. Optimistic conflict: a writer holding a stale entity tag fails
/// Phase 1 with `OptimisticConflict` and must reload before retrying.
#[tokio::test]
async fn s2_optimistic_conflict_on_stale_entity_tag() {
    let documents = InMemoryDocumentStore::new();

    let mut document_a = ObjectDocument::new("order", "abc");
    documents.set(&mut document_a).await.unwrap();

    let mut writer_b = document_a.clone();

    document_a.active_stream.current_stream_version = 0;
    document_a.seal();
    documents.set(&mut document_a).await.unwrap();

    writer_b.active_stream.current_stream_version = 0;
    writer_b.seal();
    let err = documents.set(&mut writer_b).await.unwrap_err();
    assert!(matches!(
        err,
        elfaes_core::document_store::DocumentStoreError::Conflict(_)
    ));

    // B reloads and retries successfully.
    let mut reloaded = documents.get("order", "abc", None).await.unwrap();
    reloaded.active_stream.current_stream_version = 1;
    reloaded.seal();
    documents.set(&mut reloaded).await.unwrap();
}

/// S3. Orphan recovery: a batch that already landed server-side (its
/// marker's `v` is at least the batch's max version) is repaired in place
/// with a repair marker rather than re-appended, and the call still
/// succeeds without duplicating events.
#[tokio::test]
async fn s3_orphan_recovery_writes_a_repair_marker_without_duplicating_events() {
    let primitives = InMemoryBlobPrimitives::new();
    let data = InMemoryDataStore::new(primitives);

    let mut document = ObjectDocument::new("order", "abc");
    data.create_initial_blob(&document).await.unwrap();

    document.active_stream.current_stream_version = 0;
    document.seal();
    data.append(&document, vec![new_event(0, "Created")], false)
        .await
        .unwrap();

    // Simulate the client losing the ack and a recovery process rolling
    // the document hash back to what it was before this event landed.
    let mut rolled_back = document.clone();
    rolled_back.hash = rolled_back.previous_hash.clone();

    // Writer B retries the same batch against the rolled-back document.
    data.append(&rolled_back, vec![new_event(0, "Created")], false)
        .await
        .unwrap();

    let events = data.read(&document, 0, None, None).await.unwrap();
    assert_eq!(events.len(), 1, "the repair marker must not duplicate the already-landed event");
}

/// S4. Hash drift: the base version is correct but the document hash moved
/// because a recovery process re-saved it; the writer proceeds using the
/// marker's hash as the effective previous hash and succeeds.
#[tokio::test]
async fn s4_hash_drift_proceeds_using_the_markers_hash() {
    let primitives = InMemoryBlobPrimitives::new();
    let data = InMemoryDataStore::new(primitives);

    let mut document = ObjectDocument::new("order", "abc");
    data.create_initial_blob(&document).await.unwrap();

    document.active_stream.current_stream_version = 0;
    document.seal();
    data.append(&document, vec![new_event(0, "Created")], false)
        .await
        .unwrap();

    // Recovery re-saved the document (new hash), current version unchanged.
    let mut drifted = document.clone();
    drifted.seal();

    let mut next = drifted.clone();
    next.active_stream.current_stream_version = 1;
    next.seal();

    data.append(&next, vec![new_event(1, "Updated")], false)
        .await
        .unwrap();

    let events = data.read(&next, 0, None, None).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].event_version, 1);
}

/// S5. Chunk rollover: committing a buffer that crosses a chunk boundary
/// fills the current chunk, opens a new one, and notifies exactly one
/// chunk-closed observer with the id of the chunk that filled.
#[tokio::test]
async fn s5_chunk_rollover_splits_the_commit_and_notifies_once() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let data = InMemoryDataStore::new(InMemoryBlobPrimitives::new());
    let documents = InMemoryDocumentStore::new();
    let mut event_types = EventTypeRegistry::new();
    event_types.register::<Created>("Created");

    let mut document = ObjectDocument::new("order", "abc");
    document.active_stream.chunk_settings.enabled = true;
    document.active_stream.chunk_settings.chunk_size = 3;
    document.seal();
    documents.set(&mut document).await.unwrap();

    let closed_chunk_ids = Arc::new(std::sync::Mutex::new(Vec::new()));
    let closed_chunk_ids_for_hook = Arc::clone(&closed_chunk_ids);
    let notify_count = Arc::new(AtomicUsize::new(0));
    let notify_count_for_hook = Arc::clone(&notify_count);

    let hooks = SessionHooks {
        pre_append: Vec::new(),
        post_commit: Vec::new(),
        chunk_closed: vec![std::sync::Arc::new(move |chunk_id: u32| {
            notify_count_for_hook.fetch_add(1, Ordering::SeqCst);
            closed_chunk_ids_for_hook.lock().unwrap().push(chunk_id);
        })],
    };

    let mut session = elfaes_core::session::Session::open(
        &documents,
        &data,
        document,
        &event_types,
        hooks,
        OpenConstraint::Loose,
    )
    .unwrap();

    for i in 0..5 {
        session
            .append(Created { name: i.to_string() }, None, None, None, None)
            .unwrap();
    }

    let committed = session.commit().await.unwrap();
    assert_eq!(committed.len(), 5);
    assert_eq!(notify_count.load(Ordering::SeqCst), 1);
    assert_eq!(*closed_chunk_ids.lock().unwrap(), vec![0]);

    let saved = documents.get("order", "abc", None).await.unwrap();
    assert_eq!(saved.active_stream.chunks.len(), 2);
    assert_eq!(
        saved.active_stream.chunks[0],
        StreamChunk {
            chunk_id: 0,
            first_version: 0,
            last_version: 2,
        }
    );
    assert_eq!(saved.active_stream.chunks[1].chunk_id, 1);
    assert_eq!(saved.active_stream.chunks[1].last_version, 4);
}

/// S6. Stream closed: once the block-count threshold is reached, the next
/// append raises `EventStreamClosed` with a computed continuation id, and a
/// subsequent retry to the same stream short-circuits via the closed-set
/// without any I/O.
#[tokio::test]
async fn s6_stream_closed_once_block_count_threshold_reached() {
    let primitives = InMemoryBlobPrimitives::new();
    let data = InMemoryDataStore::new(primitives.clone()).with_overrides(2, 4_096, 32_768);

    let mut document = ObjectDocument::new("order", "abc");
    data.create_initial_blob(&document).await.unwrap();

    document.active_stream.current_stream_version = 0;
    document.seal();
    data.append(&document, vec![new_event(0, "Created")], false)
        .await
        .unwrap();

    let path = format!("{}.ndjson", document.active_stream.stream_identifier);
    let properties = primitives.properties(&path).await.unwrap().unwrap();
    assert!(properties.committed_block_count >= 2);

    let mut next = document.clone();
    next.active_stream.current_stream_version = 1;
    next.seal();

    let err = data
        .append(&next, vec![new_event(1, "Updated")], false)
        .await
        .unwrap_err();
    assert!(matches!(err, DataStoreError::StreamClosed(_)));

    // A subsequent retry short-circuits via the closed-set, without
    // touching the backend at all (it would otherwise fail the same way).
    let err = data
        .append(&next, vec![new_event(1, "Updated")], false)
        .await
        .unwrap_err();
    assert!(matches!(err, DataStoreError::StreamClosed(_)));
}
