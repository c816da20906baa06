use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use akidb_core::{
    CollectionDescriptor, CollectionId, CoreError, CoreResult, DistanceMetric, DocumentId,
    SearchResult, Tier, TierState, TierStateRepository, VectorDocument, VectorIndex,
};
use akidb_metadata::{create_sqlite_pool, run_migrations, SqliteTierStateRepository};
use akidb_storage::{
    CycleReport, DLQEntry, LogSequenceNumber, ObjectStore, StorageBackend, StorageMetrics,
    TieringManager,
};
use tokio_util::sync::CancellationToken;

use crate::config::AkidbConfig;
use crate::index::{rank, BruteForceIndex};
use crate::metrics::ServiceMetrics;
use crate::registry::{CollectionEntry, CollectionRegistry};

/// Builds the searchable index of a collection when it is loaded.
pub type IndexFactory = Arc<dyn Fn(&CollectionDescriptor) -> Arc<dyn VectorIndex> + Send + Sync>;

const MAX_COLLECTION_NAME_LEN: usize = 255;

/// Collection management and vector operations over tiered storage.
///
/// Every loaded collection owns a [`StorageBackend`] (durability, tiers,
/// cold mirror) and a [`VectorIndex`] (search while Hot). Writes go to the
/// index first and to storage second; a failed storage write removes the
/// document from the index again, so nothing is searchable that was not
/// made durable and nothing durable is missing from search after replay.
pub struct CollectionService {
    config: AkidbConfig,
    registry: Arc<CollectionRegistry>,
    tiering: Arc<TieringManager>,
    cold_store: Arc<dyn ObjectStore>,
    index_factory: IndexFactory,
    metrics: ServiceMetrics,
    shut_down: AtomicBool,
}

impl CollectionService {
    /// Creates the service over an existing tier state repository and cold store.
    ///
    /// # Errors
    ///
    /// `CoreError::ValidationError` if the configuration is invalid.
    pub fn new(
        config: AkidbConfig,
        repository: Arc<dyn TierStateRepository>,
        cold_store: Arc<dyn ObjectStore>,
    ) -> CoreResult<Self> {
        config
            .validate()
            .map_err(|e| CoreError::ValidationError(e.to_string()))?;

        let registry = Arc::new(CollectionRegistry::new());
        let tiering = Arc::new(TieringManager::new(
            config.tiering.clone(),
            repository,
            registry.clone(),
        )?);

        Ok(Self {
            config,
            registry,
            tiering,
            cold_store,
            index_factory: Arc::new(|descriptor: &CollectionDescriptor| {
                Arc::new(BruteForceIndex::new(
                    descriptor.dimension as usize,
                    descriptor.metric,
                )) as Arc<dyn VectorIndex>
            }),
            metrics: ServiceMetrics::new()?,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Opens the metadata database (running migrations) and the configured
    /// cold store, then creates the service.
    pub async fn bootstrap(config: AkidbConfig) -> CoreResult<Self> {
        config
            .validate()
            .map_err(|e| CoreError::ValidationError(e.to_string()))?;

        let pool = create_sqlite_pool(&config.metadata.database_url)
            .await
            .map_err(|e| CoreError::internal(format!("failed to open metadata database: {e}")))?;
        run_migrations(&pool)
            .await
            .map_err(|e| CoreError::internal(format!("failed to run migrations: {e}")))?;

        let cold_store = config
            .storage
            .cold_store
            .build(config.storage.upload.call_timeout())
            .await?;

        tracing::info!(
            database_url = %config.metadata.database_url,
            data_dir = %config.storage.data_dir.display(),
            "Collection service bootstrapped"
        );
        Self::new(
            config,
            Arc::new(SqliteTierStateRepository::new(pool)),
            cold_store,
        )
    }

    /// Replaces the index used for collections loaded from now on.
    #[must_use]
    pub fn with_index_factory(mut self, index_factory: IndexFactory) -> Self {
        self.index_factory = index_factory;
        self
    }

    pub fn config(&self) -> &AkidbConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CollectionRegistry> {
        &self.registry
    }

    pub fn tiering(&self) -> &Arc<TieringManager> {
        &self.tiering
    }

    pub fn metrics(&self) -> &ServiceMetrics {
        &self.metrics
    }

    /// Starts the background tiering worker. Stopped by [`Self::shutdown`].
    pub fn start_tiering_worker(&self) {
        self.tiering.start_worker(CancellationToken::new());
    }

    fn ensure_running(&self) -> CoreResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(CoreError::invalid_state("collection service is shut down"));
        }
        Ok(())
    }

    fn refresh_tier_gauges(&self) {
        let (hot, warm, cold) = self.registry.tier_counts();
        self.metrics.set_tier_distribution(hot, warm, cold);
    }

    // ---------------------------------------------------------------------
    // Collections
    // ---------------------------------------------------------------------

    /// Creates a new, empty collection and loads it.
    ///
    /// # Errors
    ///
    /// - `CoreError::ValidationError` for an invalid name or dimension
    /// - `CoreError::AlreadyExists` if a loaded collection has the same name
    pub async fn create_collection(
        &self,
        name: &str,
        dimension: u32,
        metric: DistanceMetric,
    ) -> CoreResult<CollectionDescriptor> {
        self.ensure_running()?;
        validate_collection_name(name)?;
        if self.registry.contains_name(name) {
            return Err(CoreError::already_exists("Collection", name));
        }

        let descriptor = CollectionDescriptor::new(name, dimension, metric);
        descriptor.validate()?;
        self.load_collection(descriptor.clone()).await?;

        tracing::info!(
            collection_id = %descriptor.collection_id,
            name = %descriptor.name,
            dimension,
            metric = metric.as_str(),
            "Collection created"
        );
        Ok(descriptor)
    }

    /// Opens a collection from its persisted tier state, WAL and snapshots.
    ///
    /// A Hot collection gets its index rebuilt from the recovered documents;
    /// documents with a mismatched dimension are skipped and logged. On any
    /// failure the backend is shut down again before returning.
    ///
    /// # Errors
    ///
    /// `CoreError::AlreadyExists` if the id or the name is loaded, or is
    /// being loaded by a concurrent call.
    pub async fn load_collection(&self, descriptor: CollectionDescriptor) -> CoreResult<()> {
        self.ensure_running()?;
        descriptor.validate()?;
        let collection_id = descriptor.collection_id;
        // Held until the entry is published; a concurrent load of the same
        // id or name fails here instead of opening the same WAL and DLQ.
        let reservation = self.registry.reserve(collection_id, &descriptor.name)?;

        let tier_state = self.tiering.register_collection(collection_id).await?;

        let backend = match StorageBackend::open(
            collection_id,
            self.config.storage.clone(),
            self.cold_store.clone(),
            Some(&tier_state),
        )
        .await
        {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                self.tiering.access_tracker().untrack(collection_id);
                return Err(e);
            }
        };

        let index = (self.index_factory)(&descriptor);
        let entry = Arc::new(CollectionEntry::new(descriptor, index, backend.clone()));

        let loaded = async {
            if tier_state.tier == Tier::Hot {
                let indexed = entry.rebuild_index().await?;
                tracing::debug!(collection_id = %collection_id, indexed, "Index rebuilt");
            }
            reservation.fulfil(entry.clone())
        }
        .await;

        if let Err(e) = loaded {
            tracing::error!(
                collection_id = %collection_id,
                error = %e,
                "Failed to load collection; shutting its backend down"
            );
            self.tiering.access_tracker().untrack(collection_id);
            if let Err(shutdown_error) = backend.shutdown().await {
                tracing::warn!(
                    collection_id = %collection_id,
                    error = %shutdown_error,
                    "Backend shutdown after failed load also failed"
                );
            }
            return Err(e);
        }

        self.refresh_tier_gauges();
        tracing::info!(
            collection_id = %collection_id,
            tier = %tier_state.tier,
            documents = backend.hot_document_count(),
            "Collection loaded"
        );
        Ok(())
    }

    /// Deletes a collection: its backend is shut down, then its WAL,
    /// snapshots, DLQ and cold objects are removed together with its tier
    /// state.
    pub async fn delete_collection(&self, collection_id: CollectionId) -> CoreResult<()> {
        self.ensure_running()?;
        let entry = self
            .registry
            .remove(collection_id)
            .ok_or_else(|| CoreError::not_found("Collection", collection_id.to_string()))?;

        // Writers still holding the gate finish before the backend stops.
        let _gate = entry.write_gate.write().await;
        entry.backend.shutdown().await?;
        entry.backend.purge().await?;
        self.tiering.forget_collection(collection_id).await?;
        if let Err(e) = entry.index.clear().await {
            tracing::warn!(collection_id = %collection_id, error = %e, "Failed to clear index");
        }

        self.refresh_tier_gauges();
        tracing::info!(collection_id = %collection_id, "Collection deleted");
        Ok(())
    }

    pub fn get_collection(&self, collection_id: CollectionId) -> CoreResult<CollectionDescriptor> {
        Ok(self.registry.get(collection_id)?.descriptor.clone())
    }

    /// Loaded collections, sorted by name.
    pub fn list_collections(&self) -> Vec<CollectionDescriptor> {
        self.registry.descriptors()
    }

    // ---------------------------------------------------------------------
    // Vector operations
    // ---------------------------------------------------------------------

    /// Inserts (or replaces) a document.
    ///
    /// Returns the LSN under which the write is durable.
    pub async fn insert(
        &self,
        collection_id: CollectionId,
        doc: VectorDocument,
    ) -> CoreResult<LogSequenceNumber> {
        self.ensure_running()?;
        let entry = self.registry.get(collection_id)?;
        check_dimension(&entry.descriptor, doc.vector.len())?;

        self.tiering.record_access(collection_id);
        let _timer = self.metrics.insert_duration_seconds.start_timer();
        let _gate = entry.write_gate.read().await;

        let doc_id = doc.doc_id;
        let indexed = entry.backend.tier() == Tier::Hot;
        if indexed {
            entry.index.insert(doc.clone()).await?;
        }

        match entry.backend.insert(doc).await {
            Ok(lsn) => {
                self.metrics.record_operation("insert");
                Ok(lsn)
            }
            Err(e) => {
                if indexed {
                    self.rollback_index_insert(&entry, doc_id).await;
                }
                Err(e)
            }
        }
    }

    /// Restores the index entry of `doc_id` to what storage holds.
    async fn rollback_index_insert(&self, entry: &CollectionEntry, doc_id: DocumentId) {
        self.metrics.index_rollbacks_total.inc();
        let collection_id = entry.collection_id();

        let previous = entry.backend.peek(&doc_id).await.ok().flatten();
        let rollback = match previous {
            Some(previous) => entry.index.insert(previous).await,
            None => entry.index.delete(doc_id).await,
        };

        match rollback {
            Ok(()) => tracing::warn!(
                collection_id = %collection_id,
                doc_id = %doc_id,
                "Storage write failed; index insert rolled back"
            ),
            Err(e) => tracing::error!(
                collection_id = %collection_id,
                doc_id = %doc_id,
                error = %e,
                "Storage write failed and the index rollback failed too"
            ),
        }
    }

    pub async fn get(
        &self,
        collection_id: CollectionId,
        doc_id: DocumentId,
    ) -> CoreResult<Option<VectorDocument>> {
        self.ensure_running()?;
        let entry = self.registry.get(collection_id)?;
        self.tiering.record_access(collection_id);

        let doc = entry.backend.get(&doc_id).await?;
        self.metrics.record_operation("get");
        Ok(doc)
    }

    /// Writes a tombstone for `doc_id` and drops it from the index.
    ///
    /// If the index refuses the removal it is rebuilt from storage, which
    /// no longer holds the document.
    ///
    /// # Errors
    ///
    /// `CoreError::Internal` if the tombstone is durable but neither the
    /// removal nor the rebuild could update the index.
    pub async fn delete(
        &self,
        collection_id: CollectionId,
        doc_id: DocumentId,
    ) -> CoreResult<LogSequenceNumber> {
        self.ensure_running()?;
        let entry = self.registry.get(collection_id)?;
        self.tiering.record_access(collection_id);
        let _gate = entry.write_gate.read().await;

        let lsn = entry.backend.delete(&doc_id).await?;
        if let Err(e) = entry.index.delete(doc_id).await {
            tracing::warn!(
                collection_id = %collection_id,
                doc_id = %doc_id,
                error = %e,
                "Index removal failed, rebuilding index from storage"
            );
            self.metrics.index_rebuilds_total.inc();
            if let Err(rebuild_error) = self.resync_index(&entry).await {
                tracing::error!(
                    collection_id = %collection_id,
                    doc_id = %doc_id,
                    error = %rebuild_error,
                    "Index rebuild after failed removal failed"
                );
                return Err(CoreError::internal(format!(
                    "document {doc_id} was deleted at {lsn} but is still indexed: {rebuild_error}"
                )));
            }
        }
        self.metrics.record_operation("delete");
        Ok(lsn)
    }

    /// Brings the index back in line with storage: rebuilt while Hot,
    /// emptied otherwise.
    async fn resync_index(&self, entry: &CollectionEntry) -> CoreResult<()> {
        if entry.backend.tier() == Tier::Hot {
            entry.rebuild_index().await.map(|_| ())
        } else {
            entry.index.clear().await
        }
    }

    /// Top-k nearest documents. Hot collections are served by their index;
    /// Warm and Cold collections are scanned from their snapshot.
    pub async fn search(
        &self,
        collection_id: CollectionId,
        query: &[f32],
        k: usize,
    ) -> CoreResult<Vec<SearchResult>> {
        self.ensure_running()?;
        let entry = self.registry.get(collection_id)?;
        check_dimension(&entry.descriptor, query.len())?;
        self.tiering.record_access(collection_id);

        let results = if entry.backend.tier() == Tier::Hot {
            entry.index.search(query, k).await?
        } else {
            let documents = entry.backend.all_documents().await?;
            rank(
                entry.descriptor.metric,
                query,
                documents
                    .iter()
                    .filter(|doc| doc.vector.len() == query.len())
                    .map(|doc| (doc.doc_id, doc.vector.as_slice())),
                k,
            )
        };
        self.metrics.record_operation("search");
        Ok(results)
    }

    // ---------------------------------------------------------------------
    // Storage administration
    // ---------------------------------------------------------------------

    pub fn storage_metrics(&self, collection_id: CollectionId) -> CoreResult<StorageMetrics> {
        Ok(self.registry.get(collection_id)?.backend.metrics())
    }

    pub fn dead_letters(&self, collection_id: CollectionId) -> CoreResult<Vec<DLQEntry>> {
        Ok(self.registry.get(collection_id)?.backend.dead_letters())
    }

    /// Moves every dead-lettered upload of the collection back into the
    /// upload queue. Returns how many were requeued.
    pub fn requeue_dead_letters(&self, collection_id: CollectionId) -> CoreResult<usize> {
        let requeued = self
            .registry
            .get(collection_id)?
            .backend
            .requeue_all_dead_letters()?;
        tracing::info!(collection_id = %collection_id, requeued, "Dead letters requeued");
        Ok(requeued)
    }

    /// Service metrics in Prometheus text format.
    pub fn export_metrics(&self) -> String {
        self.refresh_tier_gauges();
        self.metrics.export()
    }

    // ---------------------------------------------------------------------
    // Tiering
    // ---------------------------------------------------------------------

    pub async fn tier_state(&self, collection_id: CollectionId) -> CoreResult<TierState> {
        self.registry.get(collection_id)?;
        self.tiering.get_tier_state(collection_id).await
    }

    pub async fn pin(&self, collection_id: CollectionId) -> CoreResult<()> {
        self.registry.get(collection_id)?;
        self.tiering.pin(collection_id).await
    }

    pub async fn unpin(&self, collection_id: CollectionId) -> CoreResult<()> {
        self.registry.get(collection_id)?;
        self.tiering.unpin(collection_id).await
    }

    pub async fn force_promote_to_hot(&self, collection_id: CollectionId) -> CoreResult<()> {
        self.ensure_running()?;
        self.registry.get(collection_id)?;
        self.tiering.force_promote_to_hot(collection_id).await?;
        self.refresh_tier_gauges();
        Ok(())
    }

    pub async fn force_demote_to_cold(&self, collection_id: CollectionId) -> CoreResult<()> {
        self.ensure_running()?;
        self.registry.get(collection_id)?;
        self.tiering.force_demote_to_cold(collection_id).await?;
        self.refresh_tier_gauges();
        Ok(())
    }

    /// Runs one tiering cycle now, independent of the background worker.
    pub async fn run_tiering_cycle(&self) -> CoreResult<CycleReport> {
        self.ensure_running()?;
        let report = self.tiering.run_tiering_cycle().await?;
        self.refresh_tier_gauges();
        Ok(report)
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Stops the tiering worker, then shuts down every backend.
    ///
    /// Backend failures are logged and do not stop the remaining backends.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> CoreResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!("Collection service shutdown initiated");
        let started = std::time::Instant::now();

        self.tiering.shutdown().await;

        let entries = self.registry.drain();
        let total = entries.len();
        let mut failed = 0;
        for entry in entries {
            let collection_id = entry.collection_id();
            let _gate = entry.write_gate.write().await;
            match entry.backend.shutdown().await {
                Ok(()) => {
                    tracing::debug!(collection_id = %collection_id, "Backend shut down");
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!(
                        collection_id = %collection_id,
                        error = %e,
                        "Failed to shut down backend"
                    );
                }
            }
        }

        self.refresh_tier_gauges();
        tracing::info!(
            backends = total,
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Collection service shutdown complete"
        );
        Ok(())
    }
}

fn check_dimension(descriptor: &CollectionDescriptor, len: usize) -> CoreResult<()> {
    if len != descriptor.dimension as usize {
        return Err(CoreError::ValidationError(format!(
            "vector dimension {len} does not match collection dimension {}",
            descriptor.dimension
        )));
    }
    Ok(())
}

/// Names become part of operator-facing paths and logs.
fn validate_collection_name(name: &str) -> CoreResult<()> {
    const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

    if name.trim().is_empty() {
        return Err(CoreError::ValidationError(
            "collection name cannot be empty".to_string(),
        ));
    }
    if name.len() > MAX_COLLECTION_NAME_LEN {
        return Err(CoreError::ValidationError(format!(
            "collection name must be <= {MAX_COLLECTION_NAME_LEN} characters (got {})",
            name.len()
        )));
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(CoreError::ValidationError(
            "collection name contains invalid path characters (.. / \\)".to_string(),
        ));
    }
    if name.chars().any(|c| INVALID_CHARS.contains(&c)) {
        return Err(CoreError::ValidationError(
            "collection name contains invalid characters (< > : \" | ? *)".to_string(),
        ));
    }
    if name.chars().any(char::is_control) {
        return Err(CoreError::ValidationError(
            "collection name contains control characters".to_string(),
        ));
    }
    Ok(())
}
