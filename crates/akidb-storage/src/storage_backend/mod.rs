//! Storage backend - per-collection facade over WAL, snapshots, the upload
//! pipeline and the background workers
//!
//! A backend owns exactly one collection. Writes are appended to the WAL
//! (durable before acknowledgement), applied to memory and queued for
//! mirroring to the cold store. Where the rest of the data lives depends on
//! the collection's tier:
//!
//! - **Hot:** every document is in memory; deletes leave tombstones until
//!   the next compaction.
//! - **Warm:** a full snapshot on local disk plus an in-memory delta of the
//!   writes after it.
//! - **Cold:** a full snapshot in the object store plus the same delta.
//!
//! Warm and Cold reads go through an LRU read-through cache.
//!
//! # Lifecycle
//!
//! `Constructing -> Ready -> ShuttingDown -> Shutdown`. Call
//! [`StorageBackend::shutdown`] before dropping a backend; it cancels and
//! awaits every worker, flushes the WAL and persists the DLQ.

mod compaction;
mod transition;

pub use compaction::CompactionOutcome;
pub use transition::{PreparedTransition, TierTransition, TransitionOutcome};

use crate::config::StorageConfig;
use crate::dlq::{DLQEntry, DeadLetterQueue};
use crate::metrics::StorageMetrics;
use crate::object_store::{collection_prefix, LocalObjectStore, ObjectStore};
use crate::snapshotter::{data_key, JsonSnapshotter, SnapshotMetadata, Snapshotter};
use crate::upload::{UploadPipeline, UploadTask};
use crate::wal::{FileWAL, LogEntry, LogSequenceNumber, WriteAheadLog};
use akidb_core::{
    CollectionId, CoreError, CoreResult, DocumentId, Tier, TierState, VectorDocument,
};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle state of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackendState {
    Constructing = 0,
    Ready = 1,
    ShuttingDown = 2,
    Shutdown = 3,
}

impl BackendState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Constructing,
            1 => Self::Ready,
            2 => Self::ShuttingDown,
            _ => Self::Shutdown,
        }
    }
}

/// Where the bulk of a collection's documents currently lives.
#[derive(Debug, Clone)]
pub(crate) enum Placement {
    Hot,
    Warm {
        snapshot: SnapshotMetadata,
        path: PathBuf,
    },
    Cold {
        snapshot: SnapshotMetadata,
    },
}

impl Placement {
    fn tier(&self) -> Tier {
        match self {
            Placement::Hot => Tier::Hot,
            Placement::Warm { .. } => Tier::Warm,
            Placement::Cold { .. } => Tier::Cold,
        }
    }
}

/// State shared between the backend handle and its workers.
pub(crate) struct Shared {
    collection_id: CollectionId,
    config: StorageConfig,
    wal: FileWAL,
    local_store: Arc<LocalObjectStore>,
    local_snapshots: JsonSnapshotter,
    cold_snapshots: JsonSnapshotter,
    pipeline: Arc<UploadPipeline>,

    /// Hot: every document (`None` = tombstone). Warm/Cold: writes after the
    /// tier snapshot.
    docs: RwLock<HashMap<DocumentId, Option<VectorDocument>>>,
    placement: RwLock<Placement>,
    read_cache: Mutex<LruCache<DocumentId, VectorDocument>>,
    /// Bumped whenever the placement changes so reads started against the
    /// previous placement do not populate the cache.
    placement_epoch: AtomicU64,

    /// Serializes WAL append + memory apply.
    write_lock: tokio::sync::Mutex<()>,
    /// Held by compaction and by a prepared tier transition.
    transition_lock: Arc<tokio::sync::Mutex<()>>,

    ops_since_compaction: AtomicU64,
    compaction_notify: Notify,
    metrics: RwLock<StorageMetrics>,
    state: AtomicU8,
    poisoned: AtomicBool,
}

impl Shared {
    fn state(&self) -> BackendState {
        BackendState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: BackendState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn ensure_ready(&self) -> CoreResult<()> {
        match self.state() {
            BackendState::Ready => Ok(()),
            other => Err(CoreError::invalid_state(format!(
                "storage backend for collection {} is {:?}",
                self.collection_id, other
            ))),
        }
    }

    fn ensure_writable(&self) -> CoreResult<()> {
        self.ensure_ready()?;
        if self.poisoned.load(Ordering::Acquire) {
            return Err(CoreError::invalid_state(format!(
                "storage backend for collection {} is unusable after a WAL failure; reopen it",
                self.collection_id
            )));
        }
        Ok(())
    }

    fn tier(&self) -> Tier {
        self.placement.read().tier()
    }

    /// A compaction would make progress: the collection is Hot, something
    /// was written since the last baseline, and a threshold is crossed.
    fn should_compact(&self) -> bool {
        let ops = self.ops_since_compaction.load(Ordering::Relaxed);
        if ops == 0 || !matches!(*self.placement.read(), Placement::Hot) {
            return false;
        }
        ops >= self.config.compaction.op_threshold
            || self.wal.size_bytes() >= self.config.compaction.byte_threshold
    }

    /// Appends to the WAL; any failure poisons the backend.
    async fn append(&self, entry: LogEntry) -> CoreResult<LogSequenceNumber> {
        match self.wal.append(entry).await {
            Ok(lsn) => Ok(lsn),
            Err(e) => {
                self.poisoned.store(true, Ordering::Release);
                tracing::error!(
                    collection_id = %self.collection_id,
                    error = %e,
                    "WAL append failed, backend is now unusable"
                );
                Err(e)
            }
        }
    }

    fn notify_compaction_if_due(&self) {
        if self.config.enable_background_compaction && self.should_compact() {
            self.compaction_notify.notify_one();
        }
    }

    /// Restores the snapshot behind a Warm/Cold placement.
    async fn restore_placement(&self, placement: &Placement) -> CoreResult<Vec<VectorDocument>> {
        match placement {
            Placement::Hot => Ok(Vec::new()),
            Placement::Warm { snapshot, .. } => {
                self.local_snapshots
                    .restore_snapshot(self.collection_id, snapshot.snapshot_id)
                    .await
            }
            Placement::Cold { snapshot } => {
                self.cold_snapshots
                    .restore_snapshot(self.collection_id, snapshot.snapshot_id)
                    .await
            }
        }
    }

    /// Full live document set, the LSN it reflects and the write count since
    /// the last compaction at that LSN.
    ///
    /// Callers must hold `transition_lock` so the placement cannot change.
    async fn materialize(&self) -> CoreResult<(Vec<VectorDocument>, LogSequenceNumber, u64)> {
        let placement = self.placement.read().clone();
        let base = self.restore_placement(&placement).await?;

        let _write = self.write_lock.lock().await;
        let lsn = self.wal.current_lsn().await?;
        let ops = self.ops_since_compaction.load(Ordering::Acquire);

        let mut live: HashMap<DocumentId, VectorDocument> =
            base.into_iter().map(|doc| (doc.doc_id, doc)).collect();
        for (doc_id, entry) in self.docs.read().iter() {
            match entry {
                Some(doc) => {
                    live.insert(*doc_id, doc.clone());
                }
                None => {
                    live.remove(doc_id);
                }
            }
        }

        Ok((live.into_values().collect(), lsn, ops))
    }

    /// WAL entries after `lsn`, folded into a per-document map.
    async fn replay_after(
        &self,
        lsn: LogSequenceNumber,
    ) -> CoreResult<(HashMap<DocumentId, Option<VectorDocument>>, u64)> {
        let from = if lsn == LogSequenceNumber::ZERO {
            LogSequenceNumber::ZERO
        } else {
            lsn.next()?
        };

        let mut delta = HashMap::new();
        let mut replayed = 0u64;
        for (_lsn, entry) in self.wal.replay(from).await? {
            if entry.collection_id() != self.collection_id {
                tracing::warn!(
                    collection_id = %self.collection_id,
                    foreign = %entry.collection_id(),
                    "Skipping WAL entry of another collection"
                );
                continue;
            }
            let doc_id = entry.doc_id();
            delta.insert(doc_id, entry.into_document());
            replayed += 1;
        }
        Ok((delta, replayed))
    }

    fn set_placement(&self, placement: Placement) {
        let mut cache = self.read_cache.lock();
        *self.placement.write() = placement;
        self.placement_epoch.fetch_add(1, Ordering::AcqRel);
        cache.clear();
    }

    fn warm_path(&self, snapshot: &SnapshotMetadata) -> CoreResult<PathBuf> {
        self.local_store.path_for(&data_key(
            self.collection_id,
            snapshot.snapshot_id,
            snapshot.compression,
        ))
    }
}

/// Storage backend of a single collection
///
/// # Examples
///
/// ```rust,no_run
/// use akidb_storage::object_store::{LocalObjectStore, ObjectStore};
/// use akidb_storage::{StorageBackend, StorageConfig};
/// use akidb_core::{CollectionId, DocumentId, VectorDocument};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> akidb_core::CoreResult<()> {
///     let config = StorageConfig::new("./data");
///     let cold: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new("./data/cold").await?);
///     let collection_id = CollectionId::allocate();
///
///     let backend = StorageBackend::open(collection_id, config, cold, None).await?;
///     backend.insert(VectorDocument::new(DocumentId::new(), vec![0.1, 0.2])).await?;
///     backend.shutdown().await
/// }
/// ```
pub struct StorageBackend {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StorageBackend {
    /// Opens the backend of `collection_id` and recovers its state.
    ///
    /// `tier_state` selects the recovery path: Hot (or `None`) restores the
    /// newest local snapshot and replays the WAL after it; Warm and Cold load
    /// the tier snapshot's metadata and replay the WAL after it into the
    /// delta.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Configuration validation fails
    /// - The WAL or the DLQ cannot be opened
    /// - The tier snapshot named by `tier_state` is missing
    pub async fn open(
        collection_id: CollectionId,
        config: StorageConfig,
        cold_store: Arc<dyn ObjectStore>,
        tier_state: Option<&TierState>,
    ) -> CoreResult<Self> {
        config.validate()?;

        let wal = FileWAL::open(config.wal_dir(collection_id), collection_id, config.wal.clone())
            .await?;
        let local_store = Arc::new(LocalObjectStore::new(config.snapshot_dir()).await?);
        let local_snapshots = JsonSnapshotter::new(local_store.clone(), config.snapshot_compression);
        let cold_snapshots = JsonSnapshotter::new(cold_store.clone(), config.snapshot_compression);

        let dlq = DeadLetterQueue::open(
            collection_id,
            config.dlq.clone(),
            config.dlq_path(collection_id),
        )
        .await?;
        let pipeline = Arc::new(UploadPipeline::new(
            collection_id,
            cold_store,
            config.upload.clone(),
            config.retry.clone(),
            config.circuit_breaker.clone(),
            dlq,
        ));

        let cache_capacity =
            NonZeroUsize::new(config.read_cache_capacity).unwrap_or(NonZeroUsize::MIN);

        let shared = Arc::new(Shared {
            collection_id,
            config,
            wal,
            local_store,
            local_snapshots,
            cold_snapshots,
            pipeline,
            docs: RwLock::new(HashMap::new()),
            placement: RwLock::new(Placement::Hot),
            read_cache: Mutex::new(LruCache::new(cache_capacity)),
            placement_epoch: AtomicU64::new(0),
            write_lock: tokio::sync::Mutex::new(()),
            transition_lock: Arc::new(tokio::sync::Mutex::new(())),
            ops_since_compaction: AtomicU64::new(0),
            compaction_notify: Notify::new(),
            metrics: RwLock::new(StorageMetrics::default()),
            state: AtomicU8::new(BackendState::Constructing as u8),
            poisoned: AtomicBool::new(false),
        });

        Self::recover(&shared, tier_state).await?;

        let backend = Self {
            shared,
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        };
        backend.shared.set_state(BackendState::Ready);
        backend.spawn_workers();

        tracing::info!(
            collection_id = %collection_id,
            tier = %backend.shared.tier(),
            "Storage backend ready"
        );
        Ok(backend)
    }

    async fn recover(shared: &Shared, tier_state: Option<&TierState>) -> CoreResult<()> {
        let collection_id = shared.collection_id;
        let tier = tier_state.map_or(Tier::Hot, |s| s.tier);

        let (placement, base, base_lsn) = match tier {
            Tier::Hot => match shared.local_snapshots.latest_snapshot(collection_id).await? {
                Some(snapshot) => {
                    let docs = shared
                        .local_snapshots
                        .restore_snapshot(collection_id, snapshot.snapshot_id)
                        .await?;
                    (Placement::Hot, docs, snapshot.wal_lsn)
                }
                None => (Placement::Hot, Vec::new(), LogSequenceNumber::ZERO),
            },
            Tier::Warm | Tier::Cold => {
                let snapshot_id = tier_state.and_then(|s| s.snapshot_id).ok_or_else(|| {
                    CoreError::invalid_state(format!(
                        "collection {collection_id} is {tier} but has no snapshot id"
                    ))
                })?;
                if tier == Tier::Warm {
                    let snapshot = shared
                        .local_snapshots
                        .get_metadata(collection_id, snapshot_id)
                        .await?;
                    let path = shared.warm_path(&snapshot)?;
                    let lsn = snapshot.wal_lsn;
                    (Placement::Warm { snapshot, path }, Vec::new(), lsn)
                } else {
                    let snapshot = shared
                        .cold_snapshots
                        .get_metadata(collection_id, snapshot_id)
                        .await?;
                    let lsn = snapshot.wal_lsn;
                    (Placement::Cold { snapshot }, Vec::new(), lsn)
                }
            }
        };

        let (delta, replayed) = shared.replay_after(base_lsn).await?;

        let mut docs: HashMap<DocumentId, Option<VectorDocument>> =
            base.into_iter().map(|doc| (doc.doc_id, Some(doc))).collect();
        docs.extend(delta);

        tracing::info!(
            collection_id = %collection_id,
            tier = %tier,
            base_lsn = %base_lsn,
            replayed,
            documents = docs.len(),
            "Recovered collection state"
        );

        *shared.docs.write() = docs;
        *shared.placement.write() = placement;
        shared.ops_since_compaction.store(replayed, Ordering::Relaxed);
        Ok(())
    }

    fn spawn_workers(&self) {
        let mut workers = self.workers.lock();
        let pipeline = &self.shared.pipeline;

        workers.push(tokio::spawn(pipeline.clone().run_uploader(self.cancel.clone())));
        workers.push(tokio::spawn(pipeline.clone().run_retry_worker(self.cancel.clone())));
        workers.push(tokio::spawn(pipeline.clone().run_dlq_cleanup(self.cancel.clone())));

        if self.shared.config.enable_background_compaction {
            workers.push(tokio::spawn(
                compaction::run_compaction_worker(self.shared.clone(), self.cancel.clone()),
            ));
        }

        tracing::debug!(
            collection_id = %self.shared.collection_id,
            workers = workers.len(),
            "Background workers started"
        );
    }

    pub fn collection_id(&self) -> CollectionId {
        self.shared.collection_id
    }

    pub fn config(&self) -> &StorageConfig {
        &self.shared.config
    }

    pub fn state(&self) -> BackendState {
        self.shared.state()
    }

    pub fn tier(&self) -> Tier {
        self.shared.tier()
    }

    /// Path of the local snapshot while Warm.
    pub fn warm_file_path(&self) -> Option<PathBuf> {
        match &*self.shared.placement.read() {
            Placement::Warm { path, .. } => Some(path.clone()),
            _ => None,
        }
    }

    /// Highest LSN written to this collection's WAL.
    pub async fn current_lsn(&self) -> CoreResult<LogSequenceNumber> {
        self.shared.wal.current_lsn().await
    }

    /// WAL entries with LSN >= `from`, for inspection and tests.
    pub async fn wal_entries(
        &self,
        from: LogSequenceNumber,
    ) -> CoreResult<Vec<(LogSequenceNumber, LogEntry)>> {
        self.shared.wal.replay(from).await
    }

    /// Inserts or replaces a document.
    ///
    /// The WAL append is durable before this returns. The cold-store mirror
    /// is updated asynchronously.
    ///
    /// # Errors
    ///
    /// - `CoreError::InvalidState` if the backend is not Ready or is poisoned
    /// - the WAL error if the append fails (the backend is then poisoned)
    pub async fn insert(&self, doc: VectorDocument) -> CoreResult<LogSequenceNumber> {
        let shared = &self.shared;
        shared.ensure_writable()?;

        let lsn = {
            let _write = shared.write_lock.lock().await;
            // Shutdown may have started while waiting for the lock.
            shared.ensure_writable()?;

            let lsn = shared
                .append(LogEntry::upsert(shared.collection_id, &doc))
                .await?;

            shared.docs.write().insert(doc.doc_id, Some(doc.clone()));
            shared.read_cache.lock().pop(&doc.doc_id);
            if let Err(e) = shared
                .pipeline
                .enqueue(UploadTask::put(shared.collection_id, doc))
            {
                tracing::error!(collection_id = %shared.collection_id, error = %e, "Failed to queue upload");
            }
            shared.ops_since_compaction.fetch_add(1, Ordering::AcqRel);
            lsn
        };

        shared.metrics.write().inserts += 1;
        shared.notify_compaction_if_due();
        Ok(lsn)
    }

    /// Looks up a document. Increments `queries` on every successful call,
    /// whether or not the document exists.
    pub async fn get(&self, doc_id: &DocumentId) -> CoreResult<Option<VectorDocument>> {
        let shared = &self.shared;
        shared.ensure_ready()?;

        let result = self.lookup(doc_id).await?;
        shared.metrics.write().queries += 1;
        Ok(result)
    }

    /// Reads a document like [`Self::get`] without counting a query, and
    /// also after shutdown. Meant for consistency repairs by the caller,
    /// such as restoring an index entry after a failed write.
    pub async fn peek(&self, doc_id: &DocumentId) -> CoreResult<Option<VectorDocument>> {
        self.lookup(doc_id).await
    }

    async fn lookup(&self, doc_id: &DocumentId) -> CoreResult<Option<VectorDocument>> {
        let shared = &self.shared;

        // Two attempts: a transition may delete the snapshot we started from.
        for _ in 0..2 {
            let (placement, epoch) = {
                if let Some(entry) = shared.docs.read().get(doc_id) {
                    return Ok(entry.clone());
                }
                let placement = shared.placement.read().clone();
                if matches!(placement, Placement::Hot) {
                    return Ok(None);
                }
                if let Some(doc) = shared.read_cache.lock().get(doc_id) {
                    shared.metrics.write().cache_hits += 1;
                    return Ok(Some(doc.clone()));
                }
                (placement, shared.placement_epoch.load(Ordering::Acquire))
            };

            shared.metrics.write().cache_misses += 1;
            let docs = match shared.restore_placement(&placement).await {
                Ok(docs) => docs,
                Err(e)
                    if e.is_not_found()
                        && shared.placement_epoch.load(Ordering::Acquire) != epoch =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            };

            let found = docs.iter().find(|d| d.doc_id == *doc_id).cloned();
            {
                let mut cache = shared.read_cache.lock();
                if shared.placement_epoch.load(Ordering::Acquire) == epoch {
                    for doc in docs {
                        cache.put(doc.doc_id, doc);
                    }
                    if let Some(doc) = &found {
                        cache.put(doc.doc_id, doc.clone());
                    }
                }
            }

            // A write may have landed in the delta while the snapshot loaded.
            if let Some(entry) = shared.docs.read().get(doc_id) {
                return Ok(entry.clone());
            }
            return Ok(found);
        }

        Err(CoreError::internal(format!(
            "placement of collection {} kept changing during read",
            shared.collection_id
        )))
    }

    /// Deletes a document by writing a tombstone. Physical removal happens at
    /// the next compaction.
    pub async fn delete(&self, doc_id: &DocumentId) -> CoreResult<LogSequenceNumber> {
        let shared = &self.shared;
        shared.ensure_writable()?;

        let lsn = {
            let _write = shared.write_lock.lock().await;
            shared.ensure_writable()?;

            let lsn = shared
                .append(LogEntry::delete(shared.collection_id, *doc_id))
                .await?;

            shared.docs.write().insert(*doc_id, None);
            shared.read_cache.lock().pop(doc_id);
            if let Err(e) = shared
                .pipeline
                .enqueue(UploadTask::delete(shared.collection_id, *doc_id))
            {
                tracing::error!(collection_id = %shared.collection_id, error = %e, "Failed to queue upload");
            }
            shared.ops_since_compaction.fetch_add(1, Ordering::AcqRel);
            lsn
        };

        shared.metrics.write().deletes += 1;
        shared.notify_compaction_if_due();
        Ok(lsn)
    }

    /// Every live document of the collection, whatever its tier.
    pub async fn all_documents(&self) -> CoreResult<Vec<VectorDocument>> {
        self.shared.ensure_ready()?;
        let _transition = self.shared.transition_lock.lock().await;
        let (docs, _lsn, _ops) = self.shared.materialize().await?;
        Ok(docs)
    }

    /// Number of live documents held in memory while Hot.
    pub fn hot_document_count(&self) -> usize {
        self.shared.docs.read().values().filter(|d| d.is_some()).count()
    }

    pub fn should_compact(&self) -> bool {
        self.shared.should_compact()
    }

    /// Runs a compaction now. See [`CompactionOutcome`].
    pub async fn compact(&self) -> CoreResult<CompactionOutcome> {
        self.shared.ensure_ready()?;
        self.shared.compact().await
    }

    /// Metrics snapshot with live gauges filled in.
    pub fn metrics(&self) -> StorageMetrics {
        let shared = &self.shared;
        let mut metrics = shared.metrics.read().clone();
        let counters = shared.pipeline.counters();

        metrics.uploads = counters.uploads.load(Ordering::Relaxed);
        metrics.upload_retries = counters.retries.load(Ordering::Relaxed);
        metrics.upload_permanent_failures = counters.permanent_failures.load(Ordering::Relaxed);
        metrics.superseded_uploads = counters.superseded.load(Ordering::Relaxed);
        if let Some(breaker) = shared.pipeline.circuit_breaker() {
            metrics.circuit_breaker_state = breaker.state().to_metric();
            metrics.circuit_breaker_error_rate = breaker.error_rate();
        }
        metrics.dlq_size = shared.pipeline.dlq().size();
        metrics.wal_size_bytes = shared.wal.size_bytes();
        metrics.ops_since_last_compaction = shared.ops_since_compaction.load(Ordering::Relaxed);
        metrics.tombstones = shared.docs.read().values().filter(|d| d.is_none()).count() as u64;
        metrics.tier = Some(shared.tier());
        metrics
    }

    pub fn upload_pipeline(&self) -> &UploadPipeline {
        &self.shared.pipeline
    }

    pub fn dead_letters(&self) -> Vec<DLQEntry> {
        self.shared.pipeline.dlq().all_entries()
    }

    /// Moves one DLQ entry back to the upload queue (admin operation).
    pub fn requeue_dead_letter(&self, entry_id: Uuid) -> CoreResult<()> {
        self.shared.ensure_ready()?;
        self.shared.pipeline.requeue_dead_letter(entry_id)
    }

    /// Moves every DLQ entry back to the upload queue (admin operation).
    pub fn requeue_all_dead_letters(&self) -> CoreResult<usize> {
        self.shared.ensure_ready()?;
        self.shared.pipeline.requeue_all_dead_letters()
    }

    /// Background workers that have not finished yet.
    pub fn running_workers(&self) -> usize {
        self.workers
            .lock()
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Gracefully shuts down the backend.
    ///
    /// This will:
    /// - Reject new operations
    /// - Cancel and await the uploader, retry, DLQ cleanup and compaction workers
    /// - Wait for in-flight writes
    /// - Park unfinished uploads in the DLQ and persist it
    /// - Flush the WAL
    ///
    /// Calling it again after it completed is a no-op.
    pub async fn shutdown(&self) -> CoreResult<()> {
        let shared = &self.shared;
        let previous = shared.state.compare_exchange(
            BackendState::Ready as u8,
            BackendState::ShuttingDown as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if let Err(current) = previous {
            if BackendState::from_u8(current) == BackendState::Shutdown {
                return Ok(());
            }
            shared.set_state(BackendState::ShuttingDown);
        }

        tracing::info!(collection_id = %shared.collection_id, "Storage backend shutting down");
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(
                    collection_id = %shared.collection_id,
                    error = %e,
                    "Background worker ended abnormally"
                );
            }
        }

        // No write holds the lock past this point and none will be accepted.
        let _write = shared.write_lock.lock().await;

        let parked = shared.pipeline.park_pending("backend shut down before upload");
        if parked > 0 {
            tracing::warn!(
                collection_id = %shared.collection_id,
                parked,
                "Shutting down with pending uploads"
            );
        }
        if let Err(e) = shared.pipeline.dlq().persist().await {
            tracing::error!(collection_id = %shared.collection_id, error = %e, "Failed to persist DLQ on shutdown");
        }

        let flushed = shared.wal.flush().await;
        shared.set_state(BackendState::Shutdown);
        flushed?;

        tracing::info!(collection_id = %shared.collection_id, "Storage backend shut down");
        Ok(())
    }

    /// Deletes every artifact of the collection: WAL, local snapshots, cold
    /// objects and the DLQ file. Only allowed after [`shutdown`](Self::shutdown).
    pub async fn purge(&self) -> CoreResult<()> {
        let shared = &self.shared;
        if shared.state() != BackendState::Shutdown {
            return Err(CoreError::invalid_state(
                "purge requires a shut down storage backend",
            ));
        }

        let prefix = collection_prefix(shared.collection_id);
        for store in [
            shared.local_snapshots.object_store(),
            shared.cold_snapshots.object_store(),
        ] {
            for object in store.list(&prefix).await? {
                store.delete(&object.key).await?;
            }
        }

        remove_path(&shared.config.wal_dir(shared.collection_id), true).await?;
        remove_path(&shared.config.dlq_path(shared.collection_id), false).await?;

        tracing::info!(collection_id = %shared.collection_id, "Collection storage purged");
        Ok(())
    }
}

async fn remove_path(path: &std::path::Path, is_dir: bool) -> CoreResult<()> {
    let result = if is_dir {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl Drop for StorageBackend {
    fn drop(&mut self) {
        if self.shared.state() != BackendState::Shutdown {
            tracing::warn!(
                collection_id = %self.shared.collection_id,
                "StorageBackend dropped without shutdown(); aborting background workers"
            );
        }
        self.cancel.cancel();
        for handle in self.workers.get_mut().drain(..) {
            handle.abort();
        }
    }
}
