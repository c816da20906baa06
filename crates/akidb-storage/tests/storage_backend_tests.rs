//! Integration tests for the StorageBackend lifecycle

use akidb_core::{CollectionId, DocumentId, VectorDocument};
use akidb_storage::object_store::{collection_prefix, MockFailure};
use akidb_storage::{
    BackendState, CompactionOutcome, JsonSnapshotter, LocalObjectStore, LogSequenceNumber,
    MockS3ObjectStore, Snapshotter, StorageBackend, StorageConfig, TierTransition, UploadTask,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn doc(i: usize) -> VectorDocument {
    VectorDocument::new(DocumentId::new(), vec![i as f32, (i * 2) as f32, 0.5])
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_every_artifact_carries_the_collection_id() {
    let temp_dir = TempDir::new().unwrap();
    let cold = Arc::new(MockS3ObjectStore::new());
    let config = StorageConfig::new(temp_dir.path()).without_background_compaction();
    let collection_id = CollectionId::allocate();

    let backend = StorageBackend::open(collection_id, config.clone(), cold.clone(), None)
        .await
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..50 {
        let d = doc(i);
        ids.push(d.doc_id);
        backend.insert(d).await.unwrap();
    }
    for id in &ids[..10] {
        backend.delete(id).await.unwrap();
    }

    // WAL
    let entries = backend.wal_entries(LogSequenceNumber::ZERO).await.unwrap();
    assert_eq!(entries.len(), 60);
    assert!(entries.iter().all(|(_, e)| e.collection_id() == collection_id));

    // Uploads
    assert!(wait_for(|| backend.metrics().uploads == 60).await);
    let prefix = collection_prefix(collection_id);
    assert_eq!(cold.keys().len(), 40);
    assert!(cold.keys().iter().all(|k| k.starts_with(&prefix)));

    // Compaction baseline and cold snapshot
    let outcome = backend.compact().await.unwrap();
    let CompactionOutcome::Compacted { snapshot_id, .. } = outcome else {
        panic!("expected a compaction, got {outcome:?}");
    };
    let local = JsonSnapshotter::new(
        Arc::new(LocalObjectStore::new(config.snapshot_dir()).await.unwrap()),
        config.snapshot_compression,
    );
    let baseline = local.get_metadata(collection_id, snapshot_id).await.unwrap();
    assert_eq!(baseline.collection_id, collection_id);
    assert_eq!(baseline.document_count, 40);

    backend.transition_to(TierTransition::DemoteToWarm).await.unwrap();
    backend.transition_to(TierTransition::DemoteToCold).await.unwrap();
    assert!(cold.keys().iter().all(|k| k.starts_with(&prefix)));
    assert!(cold.keys().iter().any(|k| k.contains("/snapshots/")));

    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dead_letters_are_scoped_to_the_collection() {
    let temp_dir = TempDir::new().unwrap();
    let cold = Arc::new(MockS3ObjectStore::new_always_fail(403));
    let collection_id = CollectionId::allocate();

    let backend = StorageBackend::open(
        collection_id,
        StorageConfig::new(temp_dir.path()).without_background_compaction(),
        cold.clone(),
        None,
    )
    .await
    .unwrap();

    for i in 0..5 {
        backend.insert(doc(i)).await.unwrap();
    }

    assert!(wait_for(|| backend.metrics().dlq_size == 5).await);
    let metrics = backend.metrics();
    assert_eq!(metrics.upload_permanent_failures, 5);
    assert_eq!(metrics.uploads, 0);
    for entry in backend.dead_letters() {
        assert_eq!(entry.collection_id, collection_id);
        assert!(entry.object_key.starts_with(&collection_id.to_string()));
        assert!(entry.error_message.contains("403"));
    }

    // Never retried automatically.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backend.metrics().upload_retries, 0);

    // Operator fixes the store and requeues.
    cold.fail_all(None);
    assert_eq!(backend.requeue_all_dead_letters().unwrap(), 5);
    assert!(wait_for(|| backend.metrics().uploads == 5).await);
    assert_eq!(backend.metrics().dlq_size, 0);

    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transient_failures_retry_then_succeed() {
    let temp_dir = TempDir::new().unwrap();
    let cold = Arc::new(MockS3ObjectStore::new_with_failures(vec![
        MockFailure::Status(503),
        MockFailure::Timeout,
    ]));
    let mut config = StorageConfig::new(temp_dir.path()).without_background_compaction();
    config.retry.base_backoff_ms = 10;
    config.retry.max_backoff_ms = 40;

    let backend = StorageBackend::open(CollectionId::allocate(), config, cold.clone(), None)
        .await
        .unwrap();
    backend.insert(doc(1)).await.unwrap();

    assert!(wait_for(|| backend.metrics().uploads == 1).await);
    let metrics = backend.metrics();
    assert_eq!(metrics.upload_retries, 2);
    assert_eq!(metrics.dlq_size, 0);
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retried_upload_never_resurrects_a_deleted_document() {
    let temp_dir = TempDir::new().unwrap();
    let cold = Arc::new(MockS3ObjectStore::new_with_failures(vec![MockFailure::Status(503)]));
    let mut config = StorageConfig::new(temp_dir.path()).without_background_compaction();
    config.retry.base_backoff_ms = 200;
    config.retry.max_backoff_ms = 400;
    let collection_id = CollectionId::allocate();

    let backend = StorageBackend::open(collection_id, config, cold.clone(), None)
        .await
        .unwrap();
    let stored = doc(1);
    let key = UploadTask::delete(collection_id, stored.doc_id).object_key();

    backend.insert(stored.clone()).await.unwrap();
    assert!(wait_for(|| cold.failed_puts() == 1).await);

    // The delete lands while the put still waits for its retry.
    backend.delete(&stored.doc_id).await.unwrap();
    assert!(wait_for(|| backend.metrics().superseded_uploads == 1).await);

    assert!(!cold.contains_key(&key));
    assert_eq!(cold.successful_puts(), 0);
    assert_eq!(backend.metrics().dlq_size, 0);
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queries_metric_counts_every_successful_get() {
    let temp_dir = TempDir::new().unwrap();
    let backend = StorageBackend::open(
        CollectionId::allocate(),
        StorageConfig::new(temp_dir.path()),
        Arc::new(MockS3ObjectStore::new()),
        None,
    )
    .await
    .unwrap();

    let stored = doc(7);
    backend.insert(stored.clone()).await.unwrap();

    let mut previous = backend.metrics().queries;
    for round in 0..20 {
        let id = if round % 2 == 0 { stored.doc_id } else { DocumentId::new() };
        backend.get(&id).await.unwrap();
        let now = backend.metrics().queries;
        assert_eq!(now, previous + 1);
        previous = now;
    }

    // Internal lookups are not queries.
    assert_eq!(backend.peek(&stored.doc_id).await.unwrap(), Some(stored.clone()));
    assert_eq!(backend.metrics().queries, previous);

    // Reads from a Warm collection count the same way.
    backend.transition_to(TierTransition::DemoteToWarm).await.unwrap();
    backend.get(&stored.doc_id).await.unwrap();
    backend.get(&stored.doc_id).await.unwrap();
    let metrics = backend.metrics();
    assert_eq!(metrics.queries, previous + 2);
    assert_eq!(metrics.cache_misses, 1);
    assert_eq!(metrics.cache_hits, 1);

    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_every_worker_and_freezes_the_wal() {
    let temp_dir = TempDir::new().unwrap();
    let config = StorageConfig::new(temp_dir.path());
    let collection_id = CollectionId::allocate();

    let backend = StorageBackend::open(
        collection_id,
        config.clone(),
        Arc::new(MockS3ObjectStore::new()),
        None,
    )
    .await
    .unwrap();
    // uploader, retry worker, DLQ cleanup, compaction
    assert_eq!(backend.running_workers(), 4);

    for i in 0..25 {
        backend.insert(doc(i)).await.unwrap();
    }
    let lsn = backend.current_lsn().await.unwrap();
    let wal_bytes = backend.metrics().wal_size_bytes;

    backend.shutdown().await.unwrap();
    assert_eq!(backend.state(), BackendState::Shutdown);
    assert_eq!(backend.running_workers(), 0);

    assert!(backend.insert(doc(99)).await.is_err());
    assert!(backend.delete(&DocumentId::new()).await.is_err());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.current_lsn().await.unwrap(), lsn);
    assert_eq!(backend.metrics().wal_size_bytes, wal_bytes);
}

#[tokio::test]
async fn test_pending_uploads_are_parked_on_shutdown() {
    let temp_dir = TempDir::new().unwrap();
    let cold = Arc::new(MockS3ObjectStore::new_always_fail(503));
    let config = StorageConfig::new(temp_dir.path()).without_background_compaction();
    let collection_id = CollectionId::allocate();

    let backend = StorageBackend::open(collection_id, config.clone(), cold.clone(), None)
        .await
        .unwrap();
    for i in 0..3 {
        backend.insert(doc(i)).await.unwrap();
    }
    backend.shutdown().await.unwrap();
    drop(backend);

    // The parked tasks survive a restart in the persisted DLQ.
    cold.fail_all(None);
    let backend = StorageBackend::open(collection_id, config, cold.clone(), None)
        .await
        .unwrap();
    assert_eq!(backend.metrics().dlq_size, 3);
    assert_eq!(backend.requeue_all_dead_letters().unwrap(), 3);
    assert!(wait_for(|| backend.metrics().uploads == 3).await);
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_inserts_get_unique_ordered_lsns() {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(
        StorageBackend::open(
            CollectionId::allocate(),
            StorageConfig::new(temp_dir.path()).without_background_compaction(),
            Arc::new(MockS3ObjectStore::new()),
            None,
        )
        .await
        .unwrap(),
    );

    let mut handles = Vec::new();
    for task in 0..8 {
        let backend = backend.clone();
        handles.push(tokio::spawn(async move {
            let mut lsns = Vec::new();
            for i in 0..25 {
                lsns.push(backend.insert(doc(task * 100 + i)).await.unwrap());
            }
            lsns
        }));
    }

    let mut lsns = Vec::new();
    for handle in handles {
        lsns.extend(handle.await.unwrap());
    }
    lsns.sort();
    lsns.dedup();
    assert_eq!(lsns.len(), 200);
    assert_eq!(lsns.first().unwrap().value(), 1);
    assert_eq!(lsns.last().unwrap().value(), 200);
    assert_eq!(backend.hot_document_count(), 200);

    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_purge_removes_collection_data() {
    let temp_dir = TempDir::new().unwrap();
    let cold = Arc::new(MockS3ObjectStore::new());
    let config = StorageConfig::new(temp_dir.path()).without_background_compaction();
    let collection_id = CollectionId::allocate();

    let backend = StorageBackend::open(collection_id, config.clone(), cold.clone(), None)
        .await
        .unwrap();
    backend.insert(doc(1)).await.unwrap();
    backend.compact().await.unwrap();

    assert!(backend.purge().await.is_err(), "purge requires shutdown");

    backend.shutdown().await.unwrap();
    backend.purge().await.unwrap();

    assert!(!config.wal_dir(collection_id).exists());
    assert!(cold.keys().is_empty());
    let local = LocalObjectStore::new(config.snapshot_dir()).await.unwrap();
    assert!(akidb_storage::ObjectStore::list(&local, &collection_prefix(collection_id))
        .await
        .unwrap()
        .is_empty());
}
