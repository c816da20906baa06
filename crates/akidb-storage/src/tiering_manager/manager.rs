use super::{AccessTracker, TieringPolicyConfig};
use crate::storage_backend::{PreparedTransition, TierTransition};
use akidb_core::{CollectionId, CoreError, CoreResult, Tier, TierState, TierStateRepository};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Moves a collection's data between tiers on behalf of the manager.
///
/// Implementations drive the collection's
/// [`StorageBackend`](crate::StorageBackend) and keep anything derived from
/// the Hot tier (such as a search index) in step.
#[async_trait]
pub trait TierMaterializer: Send + Sync {
    async fn prepare(
        &self,
        collection_id: CollectionId,
        transition: TierTransition,
    ) -> CoreResult<PreparedTransition>;

    async fn commit(
        &self,
        collection_id: CollectionId,
        prepared: PreparedTransition,
    ) -> CoreResult<()>;

    async fn abort(&self, collection_id: CollectionId, prepared: PreparedTransition);
}

/// Counts of what one tiering cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub accesses_flushed: usize,
    pub demoted_to_warm: usize,
    pub demoted_to_cold: usize,
    pub promoted_to_warm: usize,
    pub promoted_to_hot: usize,
    /// Hot collections demoted to respect `max_hot_collections`
    pub evicted: usize,
    pub failures: usize,
}

/// Lifetime counters of the manager.
#[derive(Debug, Default)]
pub struct TieringStats {
    pub cycles: AtomicU64,
    pub promotions: AtomicU64,
    pub demotions: AtomicU64,
    pub failed_transitions: AtomicU64,
}

/// Tiering manager for hot/warm/cold tier transitions
///
/// Automatically moves collections between tiers based on access patterns:
/// - Hot → Warm: No access for `demotion_idle_threshold_secs` (default: 6h)
/// - Warm → Cold: No access for `cold_demotion_idle_threshold_secs` (default: 7d)
/// - Cold → Warm and Warm → Hot: `promotion_access_threshold` accesses in
///   `promotion_window_secs` (default: 10 in 1h)
///
/// Each transition is prepared by the [`TierMaterializer`], recorded in the
/// [`TierStateRepository`] and only then committed. A failure at any step
/// leaves the collection in its previous tier.
///
/// # Example
///
/// ```no_run
/// use akidb_storage::tiering_manager::{TierMaterializer, TieringManager, TieringPolicyConfig};
/// use akidb_core::TierStateRepository;
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example(
/// #     repository: Arc<dyn TierStateRepository>,
/// #     materializer: Arc<dyn TierMaterializer>,
/// # ) -> akidb_core::CoreResult<()> {
/// let manager = Arc::new(TieringManager::new(
///     TieringPolicyConfig::default(),
///     repository,
///     materializer,
/// )?);
///
/// manager.start_worker(CancellationToken::new());
///
/// let collection_id = akidb_core::CollectionId::allocate();
/// manager.register_collection(collection_id).await?;
/// manager.record_access(collection_id);
///
/// manager.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct TieringManager {
    access_tracker: AccessTracker,
    policy: TieringPolicyConfig,
    repository: Arc<dyn TierStateRepository>,
    materializer: Arc<dyn TierMaterializer>,
    /// One transition at a time across the manager.
    transition_lock: tokio::sync::Mutex<()>,
    stats: TieringStats,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl TieringManager {
    /// Create new tiering manager
    ///
    /// # Errors
    ///
    /// Returns error if policy validation fails
    pub fn new(
        policy: TieringPolicyConfig,
        repository: Arc<dyn TierStateRepository>,
        materializer: Arc<dyn TierMaterializer>,
    ) -> CoreResult<Self> {
        policy.validate()?;

        Ok(Self {
            access_tracker: AccessTracker::new(),
            policy,
            repository,
            materializer,
            transition_lock: tokio::sync::Mutex::new(()),
            stats: TieringStats::default(),
            worker: Mutex::new(None),
        })
    }

    pub fn policy(&self) -> &TieringPolicyConfig {
        &self.policy
    }

    pub fn access_tracker(&self) -> &AccessTracker {
        &self.access_tracker
    }

    pub fn stats(&self) -> &TieringStats {
        &self.stats
    }

    /// Creates (or loads) the collection's tier state and starts tracking it.
    pub async fn register_collection(&self, collection_id: CollectionId) -> CoreResult<TierState> {
        let state = match self.repository.get_tier_state(collection_id).await? {
            Some(state) => state,
            None => self.repository.init_tier_state(collection_id).await?,
        };
        self.access_tracker
            .track(collection_id, state.tier, state.last_accessed_at);
        Ok(state)
    }

    /// Stops tracking a deleted collection and removes its tier state.
    pub async fn forget_collection(&self, collection_id: CollectionId) -> CoreResult<()> {
        self.access_tracker.untrack(collection_id);
        self.repository.delete_tier_state(collection_id).await
    }

    /// Record collection access
    ///
    /// Called on every read and write. In-memory only; the worker flushes the
    /// counts to the repository.
    pub fn record_access(&self, collection_id: CollectionId) {
        self.access_tracker.record_access(collection_id);
    }

    /// Get current tier state
    pub async fn get_tier_state(&self, collection_id: CollectionId) -> CoreResult<TierState> {
        self.repository
            .get_tier_state(collection_id)
            .await?
            .ok_or_else(|| CoreError::not_found("TierState", collection_id.to_string()))
    }

    /// Pin collection (prevent demotion)
    pub async fn pin(&self, collection_id: CollectionId) -> CoreResult<()> {
        self.repository.pin(collection_id).await?;
        tracing::info!(collection_id = %collection_id, "Collection pinned");
        Ok(())
    }

    /// Unpin collection (allow demotion on the next cycle)
    pub async fn unpin(&self, collection_id: CollectionId) -> CoreResult<()> {
        self.repository.unpin(collection_id).await?;
        tracing::info!(collection_id = %collection_id, "Collection unpinned");
        Ok(())
    }

    /// Force promote to hot (manual control)
    pub async fn force_promote_to_hot(&self, collection_id: CollectionId) -> CoreResult<()> {
        let state = self.get_tier_state(collection_id).await?;

        match state.tier {
            Tier::Hot => Ok(()),
            Tier::Warm => self
                .transition(collection_id, TierTransition::PromoteToHot, false)
                .await
                .map(|_| ()),
            Tier::Cold => {
                // Promote cold → warm first
                self.transition(collection_id, TierTransition::PromoteToWarm, false)
                    .await?;
                // Then warm → hot
                self.transition(collection_id, TierTransition::PromoteToHot, false)
                    .await
                    .map(|_| ())
            }
        }
    }

    /// Force demote to cold (manual control)
    ///
    /// # Errors
    ///
    /// `CoreError::InvalidState` if the collection is pinned
    pub async fn force_demote_to_cold(&self, collection_id: CollectionId) -> CoreResult<()> {
        let state = self.get_tier_state(collection_id).await?;
        if state.pinned {
            return Err(CoreError::invalid_state(format!(
                "collection {collection_id} is pinned; unpin it before demoting"
            )));
        }

        match state.tier {
            Tier::Cold => Ok(()),
            Tier::Warm => self
                .transition(collection_id, TierTransition::DemoteToCold, false)
                .await
                .map(|_| ()),
            Tier::Hot => {
                // Demote hot → warm first
                self.transition(collection_id, TierTransition::DemoteToWarm, false)
                    .await?;
                // Then warm → cold
                self.transition(collection_id, TierTransition::DemoteToCold, false)
                    .await
                    .map(|_| ())
            }
        }
    }

    /// Runs one transition: prepare, persist, commit.
    ///
    /// Returns `Ok(false)` when the collection is no longer eligible (moved
    /// tier, or pinned for an automatic demotion).
    async fn transition(
        &self,
        collection_id: CollectionId,
        transition: TierTransition,
        automatic: bool,
    ) -> CoreResult<bool> {
        let _serial = self.transition_lock.lock().await;

        let state = self.get_tier_state(collection_id).await?;
        if state.tier != transition.from_tier() {
            tracing::debug!(
                collection_id = %collection_id,
                tier = %state.tier,
                transition = %transition,
                "Skipping transition: collection changed tier"
            );
            return Ok(false);
        }
        if automatic && state.pinned && !transition.is_promotion() {
            tracing::debug!(
                collection_id = %collection_id,
                "Skipping demotion: collection is pinned"
            );
            return Ok(false);
        }

        let result = self.apply_transition(collection_id, transition, &state).await;
        match &result {
            Ok(()) => {
                if transition.is_promotion() {
                    self.stats.promotions.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.demotions.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                self.stats.failed_transitions.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    collection_id = %collection_id,
                    transition = %transition,
                    error = %e,
                    "Tier transition failed; collection stays in its previous tier"
                );
            }
        }
        result.map(|()| true)
    }

    async fn apply_transition(
        &self,
        collection_id: CollectionId,
        transition: TierTransition,
        previous: &TierState,
    ) -> CoreResult<()> {
        let target = transition.to_tier();
        tracing::info!(collection_id = %collection_id, transition = %transition, "Starting tier transition");

        let prepared = self.materializer.prepare(collection_id, transition).await?;

        if let Err(e) = self
            .repository
            .update_tier_state(
                collection_id,
                target,
                prepared.warm_file_path(),
                prepared.snapshot_id(),
            )
            .await
        {
            self.materializer.abort(collection_id, prepared).await;
            return Err(e);
        }

        if let Err(e) = self.materializer.commit(collection_id, prepared).await {
            if let Err(revert) = self
                .repository
                .update_tier_state(
                    collection_id,
                    previous.tier,
                    previous.warm_file_path.clone(),
                    previous.snapshot_id,
                )
                .await
            {
                tracing::error!(
                    collection_id = %collection_id,
                    error = %revert,
                    "Failed to restore tier state after commit failure"
                );
            }
            return Err(e);
        }

        if let Err(e) = self
            .repository
            .reset_access_window(collection_id, Utc::now())
            .await
        {
            tracing::warn!(collection_id = %collection_id, error = %e, "Failed to reset access window");
        }
        self.access_tracker.set_tier(collection_id, target);
        self.access_tracker.reset_window(collection_id);

        tracing::info!(collection_id = %collection_id, tier = %target, "Tier transition complete");
        Ok(())
    }

    /// Run one tiering cycle
    ///
    /// 1. Flush buffered access counts to the repository
    /// 2. Demote idle Hot → Warm, then idle Warm → Cold
    /// 3. Promote busy Cold → Warm, then busy Warm → Hot
    /// 4. Demote least recently used Hot collections past `max_hot_collections`
    ///
    /// At most `lru_batch_size` candidates are handled per direction.
    /// Individual transition failures are counted, not returned.
    pub async fn run_tiering_cycle(&self) -> CoreResult<CycleReport> {
        let start = std::time::Instant::now();
        let mut report = CycleReport::default();
        let batch = self.policy.lru_batch_size;

        report.accesses_flushed = self.flush_accesses().await;

        let now = Utc::now();
        let hot_idle = self
            .repository
            .find_idle_candidates(Tier::Hot, now - self.policy.demotion_idle_threshold(), batch)
            .await?;
        report.demoted_to_warm = self
            .run_batch(hot_idle, TierTransition::DemoteToWarm, &mut report.failures)
            .await;

        let warm_idle = self
            .repository
            .find_idle_candidates(
                Tier::Warm,
                now - self.policy.cold_demotion_idle_threshold(),
                batch,
            )
            .await?;
        report.demoted_to_cold = self
            .run_batch(warm_idle, TierTransition::DemoteToCold, &mut report.failures)
            .await;

        let window_start = now - self.policy.promotion_window();
        let threshold = self.policy.promotion_access_threshold;
        let cold_busy = self
            .repository
            .find_high_access_candidates(Tier::Cold, window_start, threshold, batch)
            .await?;
        report.promoted_to_warm = self
            .run_batch(cold_busy, TierTransition::PromoteToWarm, &mut report.failures)
            .await;

        let warm_busy = self
            .repository
            .find_high_access_candidates(Tier::Warm, window_start, threshold, batch)
            .await?;
        report.promoted_to_hot = self
            .run_batch(warm_busy, TierTransition::PromoteToHot, &mut report.failures)
            .await;

        report.evicted = self.enforce_hot_capacity(&mut report.failures).await?;

        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            duration_ms = start.elapsed().as_millis() as u64,
            report = ?report,
            "Tiering cycle complete"
        );
        Ok(report)
    }

    async fn flush_accesses(&self) -> usize {
        let window_cutoff = Utc::now() - self.policy.promotion_window();
        let mut flushed = 0;

        for pending in self.access_tracker.drain_pending() {
            match self
                .repository
                .update_access_time(
                    pending.collection_id,
                    pending.last_accessed_at,
                    pending.count,
                    window_cutoff,
                )
                .await
            {
                Ok(()) => flushed += 1,
                Err(e) => {
                    tracing::warn!(
                        collection_id = %pending.collection_id,
                        error = %e,
                        "Failed to flush access counts; keeping them for the next cycle"
                    );
                    self.access_tracker.restore_pending(pending);
                }
            }
        }
        flushed
    }

    async fn run_batch(
        &self,
        candidates: Vec<CollectionId>,
        transition: TierTransition,
        failures: &mut usize,
    ) -> usize {
        let mut done = 0;
        for collection_id in candidates {
            match self.transition(collection_id, transition, true).await {
                Ok(true) => done += 1,
                Ok(false) => {}
                Err(_) => *failures += 1,
            }
        }
        done
    }

    async fn enforce_hot_capacity(&self, failures: &mut usize) -> CoreResult<usize> {
        let Some(max_hot) = self.policy.max_hot_collections else {
            return Ok(0);
        };

        let hot = self.repository.count_in_tier(Tier::Hot).await?;
        if hot <= max_hot {
            return Ok(0);
        }

        let excess = hot - max_hot;
        let mut evicted = 0;
        for collection_id in self
            .access_tracker
            .lru_candidates(Tier::Hot, self.policy.lru_batch_size)
        {
            if evicted == excess {
                break;
            }
            match self
                .transition(collection_id, TierTransition::DemoteToWarm, true)
                .await
            {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(_) => *failures += 1,
            }
        }

        if evicted > 0 {
            tracing::info!(evicted, max_hot, "Demoted collections above the Hot tier cap");
        }
        Ok(evicted)
    }

    /// Start background worker
    ///
    /// The worker runs a tiering cycle every `worker_interval_secs` until
    /// `cancel` fires or [`shutdown`](Self::shutdown) is called.
    pub fn start_worker(self: &Arc<Self>, cancel: CancellationToken) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            tracing::warn!("Background worker already running");
            return;
        }

        let manager = Arc::clone(self);
        let interval = self.policy.worker_interval();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(e) = manager.run_tiering_cycle().await {
                    tracing::error!(error = %e, "Tiering cycle failed");
                }
            }
            tracing::info!("Tiering worker stopped");
        });

        *worker = Some((cancel, handle));
        tracing::info!(interval_secs = interval.as_secs(), "Tiering worker started");
    }

    pub fn is_worker_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Cancels the background worker and waits for it to exit.
    pub async fn shutdown(&self) {
        let worker = self.worker.lock().take();
        if let Some((cancel, handle)) = worker {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Tiering worker ended abnormally");
            }
            tracing::info!("Background worker shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::MockS3ObjectStore;
    use crate::{StorageBackend, StorageConfig};
    use akidb_core::{DocumentId, VectorDocument};
    use akidb_metadata::{create_in_memory_pool, SqliteTierStateRepository};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    /// Backends keyed by collection, with prepare failure injection.
    #[derive(Default)]
    struct Backends {
        backends: parking_lot::RwLock<HashMap<CollectionId, Arc<StorageBackend>>>,
        fail_prepare: AtomicBool,
    }

    impl Backends {
        fn get(&self, collection_id: CollectionId) -> CoreResult<Arc<StorageBackend>> {
            self.backends
                .read()
                .get(&collection_id)
                .cloned()
                .ok_or_else(|| CoreError::not_found("Collection", collection_id.to_string()))
        }
    }

    #[async_trait]
    impl TierMaterializer for Backends {
        async fn prepare(
            &self,
            collection_id: CollectionId,
            transition: TierTransition,
        ) -> CoreResult<PreparedTransition> {
            if self.fail_prepare.load(Ordering::SeqCst) {
                return Err(CoreError::StorageError("503 Service Unavailable".into()));
            }
            self.get(collection_id)?.prepare_transition(transition).await
        }

        async fn commit(
            &self,
            collection_id: CollectionId,
            prepared: PreparedTransition,
        ) -> CoreResult<()> {
            self.get(collection_id)?.commit_transition(prepared).await
        }

        async fn abort(&self, collection_id: CollectionId, prepared: PreparedTransition) {
            if let Ok(backend) = self.get(collection_id) {
                backend.abort_transition(prepared).await;
            }
        }
    }

    struct Harness {
        dir: TempDir,
        manager: Arc<TieringManager>,
        backends: Arc<Backends>,
        repository: Arc<SqliteTierStateRepository>,
    }

    async fn setup(policy: TieringPolicyConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let pool = create_in_memory_pool().await.unwrap();
        let repository = Arc::new(SqliteTierStateRepository::new(pool));
        let backends = Arc::new(Backends::default());
        let manager = Arc::new(
            TieringManager::new(policy, repository.clone(), backends.clone()).unwrap(),
        );
        Harness {
            dir,
            manager,
            backends,
            repository,
        }
    }

    impl Harness {
        async fn add_collection(&self) -> CollectionId {
            let collection_id = CollectionId::allocate();
            let config = StorageConfig::new(self.dir.path()).without_background_compaction();
            let backend = StorageBackend::open(
                collection_id,
                config,
                Arc::new(MockS3ObjectStore::new()),
                None,
            )
            .await
            .unwrap();
            backend
                .insert(VectorDocument::new(DocumentId::new(), vec![1.0, 2.0]))
                .await
                .unwrap();
            self.backends
                .backends
                .write()
                .insert(collection_id, Arc::new(backend));
            self.manager.register_collection(collection_id).await.unwrap();
            collection_id
        }

        fn backend(&self, collection_id: CollectionId) -> Arc<StorageBackend> {
            self.backends.get(collection_id).unwrap()
        }

        async fn shutdown(self) {
            self.manager.shutdown().await;
            let backends: Vec<_> = self.backends.backends.read().values().cloned().collect();
            for backend in backends {
                backend.shutdown().await.unwrap();
            }
        }
    }

    fn eager_policy() -> TieringPolicyConfig {
        TieringPolicyConfig {
            demotion_idle_threshold_secs: 0,
            cold_demotion_idle_threshold_secs: 3600,
            promotion_access_threshold: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let harness = setup(TieringPolicyConfig::default()).await;
        let collection_id = harness.add_collection().await;

        let again = harness.manager.register_collection(collection_id).await.unwrap();
        assert_eq!(again.tier, Tier::Hot);
        assert_eq!(harness.manager.access_tracker().len(), 1);
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_cycle_flushes_access_counts() {
        let harness = setup(TieringPolicyConfig::default()).await;
        let collection_id = harness.add_collection().await;

        for _ in 0..4 {
            harness.manager.record_access(collection_id);
        }
        let report = harness.manager.run_tiering_cycle().await.unwrap();
        assert_eq!(report.accesses_flushed, 1);

        let state = harness.manager.get_tier_state(collection_id).await.unwrap();
        assert_eq!(state.access_count, 4);
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_collection_demoted_and_pinned_one_kept() {
        let harness = setup(eager_policy()).await;
        let idle = harness.add_collection().await;
        let pinned = harness.add_collection().await;
        harness.manager.pin(pinned).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let report = harness.manager.run_tiering_cycle().await.unwrap();
        assert_eq!(report.demoted_to_warm, 1);

        let idle_state = harness.manager.get_tier_state(idle).await.unwrap();
        assert_eq!(idle_state.tier, Tier::Warm);
        assert!(idle_state.snapshot_id.is_some());
        assert!(idle_state.warm_file_path.is_some());
        assert_eq!(harness.backend(idle).tier(), Tier::Warm);

        assert_eq!(harness.manager.get_tier_state(pinned).await.unwrap().tier, Tier::Hot);
        assert_eq!(harness.backend(pinned).tier(), Tier::Hot);
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_busy_warm_collection_promoted() {
        let harness = setup(eager_policy()).await;
        let collection_id = harness.add_collection().await;

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        harness.manager.run_tiering_cycle().await.unwrap();
        assert_eq!(harness.backend(collection_id).tier(), Tier::Warm);

        // Keep it from being re-demoted in the same cycle.
        harness.manager.pin(collection_id).await.unwrap();
        for _ in 0..3 {
            harness.manager.record_access(collection_id);
        }
        let report = harness.manager.run_tiering_cycle().await.unwrap();
        assert_eq!(report.promoted_to_hot, 1);
        assert_eq!(harness.backend(collection_id).tier(), Tier::Hot);
        assert_eq!(
            harness.manager.get_tier_state(collection_id).await.unwrap().tier,
            Tier::Hot
        );
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_prepare_keeps_previous_tier() {
        let harness = setup(TieringPolicyConfig::default()).await;
        let collection_id = harness.add_collection().await;
        harness.backends.fail_prepare.store(true, Ordering::SeqCst);

        assert!(harness.manager.force_demote_to_cold(collection_id).await.is_err());

        let state = harness.manager.get_tier_state(collection_id).await.unwrap();
        assert_eq!(state.tier, Tier::Hot);
        assert!(state.snapshot_id.is_none());
        assert_eq!(harness.backend(collection_id).tier(), Tier::Hot);
        assert_eq!(harness.manager.stats().failed_transitions.load(Ordering::Relaxed), 1);
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_force_round_trip_through_cold() {
        let harness = setup(TieringPolicyConfig::default()).await;
        let collection_id = harness.add_collection().await;

        harness.manager.force_demote_to_cold(collection_id).await.unwrap();
        let state = harness.manager.get_tier_state(collection_id).await.unwrap();
        assert_eq!(state.tier, Tier::Cold);
        assert!(state.warm_file_path.is_none());
        assert_eq!(harness.backend(collection_id).tier(), Tier::Cold);

        harness.manager.force_promote_to_hot(collection_id).await.unwrap();
        assert_eq!(harness.backend(collection_id).tier(), Tier::Hot);
        assert_eq!(harness.backend(collection_id).hot_document_count(), 1);
        assert_eq!(harness.manager.stats().promotions.load(Ordering::Relaxed), 2);
        assert_eq!(harness.manager.stats().demotions.load(Ordering::Relaxed), 2);
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_force_demote_rejects_pinned() {
        let harness = setup(TieringPolicyConfig::default()).await;
        let collection_id = harness.add_collection().await;
        harness.manager.pin(collection_id).await.unwrap();

        let err = harness
            .manager
            .force_demote_to_cold(collection_id)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_max_hot_collections_evicts_lru() {
        let harness = setup(TieringPolicyConfig {
            max_hot_collections: Some(1),
            ..Default::default()
        })
        .await;
        let older = harness.add_collection().await;
        let newer = harness.add_collection().await;
        harness.manager.record_access(newer);

        let report = harness.manager.run_tiering_cycle().await.unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(harness.backend(older).tier(), Tier::Warm);
        assert_eq!(harness.backend(newer).tier(), Tier::Hot);
        assert_eq!(harness.repository.count_in_tier(Tier::Hot).await.unwrap(), 1);
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let harness = setup(TieringPolicyConfig {
            worker_interval_secs: 1,
            ..Default::default()
        })
        .await;

        harness.manager.start_worker(CancellationToken::new());
        assert!(harness.manager.is_worker_running());

        harness.manager.shutdown().await;
        assert!(!harness.manager.is_worker_running());
        harness.shutdown().await;
    }
}
