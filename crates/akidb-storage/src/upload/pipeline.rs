//! Upload queue, retry queue and their background workers
//!
//! Every enqueue stamps the object key with a fresh generation. Only the
//! task holding the key's current generation may touch the object store or
//! reach the DLQ; older tasks for the same key are dropped as superseded
//! when their turn comes. Calls go out one at a time under `dispatch`, so
//! the generation check and the call it guards cannot interleave with a
//! newer task for the same key.

use super::{classify_error, ErrorClass, RetryConfig, UploadConfig, UploadOp, UploadState, UploadTask};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::dlq::{DLQEntry, DeadLetterQueue};
use crate::object_store::ObjectStore;
use akidb_core::{CollectionId, CoreError, CoreResult};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Floor of the delay applied to calls deferred by an open circuit.
const MIN_BREAKER_DEFERRAL: Duration = Duration::from_millis(100);

/// A task waiting in the upload queue.
#[derive(Debug, Clone)]
struct QueuedTask {
    task: UploadTask,
    generation: u64,
}

/// A failed or deferred upload awaiting retry.
#[derive(Debug, Clone)]
struct RetryTask {
    task: UploadTask,
    generation: u64,
    /// Failed attempts so far
    attempt: u32,
    next_retry_at: Instant,
    last_error: String,
}

/// State of an object key plus the generation of its newest task.
#[derive(Debug, Clone)]
struct TrackedKey {
    state: UploadState,
    generation: u64,
}

/// Monotonic pipeline counters.
#[derive(Debug, Default)]
pub struct UploadCounters {
    pub uploads: AtomicU64,
    pub retries: AtomicU64,
    pub permanent_failures: AtomicU64,
    /// Tasks dropped because a newer task for the same key was queued
    pub superseded: AtomicU64,
    /// Calls deferred because the circuit was open
    pub breaker_rejections: AtomicU64,
}

/// Upload pipeline of a single collection.
///
/// Owned through an `Arc` by the storage backend and by each worker it
/// spawns; every worker exits when its `CancellationToken` fires.
pub struct UploadPipeline {
    collection_id: CollectionId,
    store: Arc<dyn ObjectStore>,
    config: UploadConfig,
    retry_config: RetryConfig,
    breaker: Option<CircuitBreaker>,
    queue: Mutex<VecDeque<QueuedTask>>,
    upload_notify: Notify,
    retry_queue: Mutex<VecDeque<RetryTask>>,
    retry_notify: Notify,
    states: RwLock<HashMap<String, TrackedKey>>,
    next_generation: AtomicU64,
    dispatch: tokio::sync::Mutex<()>,
    dlq: DeadLetterQueue,
    counters: UploadCounters,
}

impl UploadPipeline {
    pub fn new(
        collection_id: CollectionId,
        store: Arc<dyn ObjectStore>,
        config: UploadConfig,
        retry_config: RetryConfig,
        breaker_config: CircuitBreakerConfig,
        dlq: DeadLetterQueue,
    ) -> Self {
        let breaker = breaker_config
            .enabled
            .then(|| CircuitBreaker::new(breaker_config));
        Self {
            collection_id,
            store,
            config,
            retry_config,
            breaker,
            queue: Mutex::new(VecDeque::new()),
            upload_notify: Notify::new(),
            retry_queue: Mutex::new(VecDeque::new()),
            retry_notify: Notify::new(),
            states: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            dispatch: tokio::sync::Mutex::new(()),
            dlq,
            counters: UploadCounters::default(),
        }
    }

    pub fn collection_id(&self) -> CollectionId {
        self.collection_id
    }

    pub fn dlq(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    pub fn counters(&self) -> &UploadCounters {
        &self.counters
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    /// Queues a task and wakes the uploader. The task supersedes every
    /// earlier task for the same object, including dead-lettered ones.
    ///
    /// # Errors
    ///
    /// `CoreError::ValidationError` if the task belongs to another collection
    pub fn enqueue(&self, task: UploadTask) -> CoreResult<()> {
        if task.collection_id != self.collection_id {
            return Err(CoreError::ValidationError(format!(
                "upload pipeline of collection {} cannot accept a task of collection {}",
                self.collection_id, task.collection_id
            )));
        }

        let key = task.object_key();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut states = self.states.write();
            states.insert(
                key.clone(),
                TrackedKey {
                    state: UploadState::Queued,
                    generation,
                },
            );
            let dropped = self.dlq.remove_for_key(&key);
            if dropped > 0 {
                tracing::debug!(key = %key, dropped, "Dropped dead letters superseded by a new write");
            }
        }

        self.queue.lock().push_back(QueuedTask { task, generation });
        self.upload_notify.notify_one();
        Ok(())
    }

    pub fn state(&self, object_key: &str) -> Option<UploadState> {
        self.states.read().get(object_key).map(|t| t.state.clone())
    }

    /// Tasks queued or waiting for a retry.
    pub fn pending_count(&self) -> usize {
        self.queue.lock().len() + self.retry_queue.lock().len()
    }

    /// Forgets the state of objects that finished uploading. Tasks still
    /// queued for a forgotten key are older than its upload and count as
    /// superseded.
    pub fn prune_completed(&self) -> usize {
        let mut states = self.states.write();
        let before = states.len();
        states.retain(|_, tracked| tracked.state != UploadState::Uploaded);
        before - states.len()
    }

    fn is_current(&self, object_key: &str, generation: u64) -> bool {
        self.states
            .read()
            .get(object_key)
            .is_some_and(|t| t.generation == generation)
    }

    /// Updates the state of `object_key` unless a newer task owns it.
    fn set_state(&self, object_key: &str, generation: u64, state: UploadState) {
        if let Some(tracked) = self.states.write().get_mut(object_key) {
            if tracked.generation == generation {
                tracked.state = state;
            }
        }
    }

    fn supersede(&self, object_key: &str, generation: u64) {
        tracing::debug!(key = %object_key, generation, "Dropping superseded upload");
        self.counters.superseded.fetch_add(1, Ordering::Relaxed);
    }

    async fn execute(&self, task: &UploadTask) -> CoreResult<()> {
        let key = task.object_key();
        match &task.op {
            UploadOp::Put(doc) => {
                let data = serde_json::to_vec(doc)
                    .map_err(|e| CoreError::SerializationError(e.to_string()))?;
                self.store.put(&key, Bytes::from(data)).await
            }
            UploadOp::Delete(_) => self.store.delete(&key).await,
        }
    }

    /// Runs one attempt of `retry.task`. `retry.attempt` counts earlier
    /// failures; zero means a first attempt from the upload queue.
    async fn attempt(&self, retry: RetryTask) {
        let key = retry.task.object_key();
        let _dispatch = self.dispatch.lock().await;

        if !self.is_current(&key, retry.generation) {
            self.supersede(&key, retry.generation);
            return;
        }

        if let Some(breaker) = &self.breaker {
            if !breaker.should_allow_request() {
                self.defer(retry, breaker.retry_after().max(MIN_BREAKER_DEFERRAL));
                return;
            }
        }

        self.set_state(&key, retry.generation, UploadState::Uploading);
        if retry.attempt > 0 {
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
        }

        let result = self.execute(&retry.task).await;
        if let Some(breaker) = &self.breaker {
            let store_unavailable =
                matches!(&result, Err(e) if classify_error(e) == ErrorClass::Transient);
            breaker.record_result(!store_unavailable);
        }

        match result {
            Ok(()) => {
                if retry.attempt > 0 {
                    tracing::info!(
                        key = %key,
                        attempts = retry.attempt + 1,
                        "Upload succeeded after retry"
                    );
                } else {
                    tracing::trace!(key = %key, "Upload succeeded");
                }
                self.counters.uploads.fetch_add(1, Ordering::Relaxed);
                self.set_state(&key, retry.generation, UploadState::Uploaded);
            }
            Err(e) => {
                if retry.attempt > 0 {
                    tracing::warn!(
                        key = %key,
                        attempt = retry.attempt + 1,
                        previous_error = %retry.last_error,
                        error = %e,
                        "Upload retry failed"
                    );
                }
                self.handle_failure(retry.task, retry.generation, retry.attempt + 1, &e);
            }
        }
    }

    /// Parks a call rejected by the open circuit without spending a retry.
    fn defer(&self, mut retry: RetryTask, delay: Duration) {
        self.counters
            .breaker_rejections
            .fetch_add(1, Ordering::Relaxed);
        retry.next_retry_at = Instant::now() + delay;
        tracing::debug!(
            key = %retry.task.object_key(),
            delay_ms = delay.as_millis() as u64,
            "Circuit open, deferring upload"
        );
        self.set_state(
            &retry.task.object_key(),
            retry.generation,
            UploadState::RetryPending {
                attempt: retry.attempt,
                next_retry_at: retry.next_retry_at,
            },
        );
        self.retry_queue.lock().push_back(retry);
    }

    /// Uploads up to `batch_size` queued tasks. Returns how many were taken.
    pub async fn process_batch(&self) -> usize {
        let batch: Vec<QueuedTask> = {
            let mut queue = self.queue.lock();
            let batch_size = queue.len().min(self.config.batch_size);
            queue.drain(..batch_size).collect()
        };
        let taken = batch.len();

        for queued in batch {
            self.attempt(RetryTask {
                task: queued.task,
                generation: queued.generation,
                attempt: 0,
                next_retry_at: Instant::now(),
                last_error: String::new(),
            })
            .await;
        }

        taken
    }

    /// Retries every task whose backoff has elapsed. Returns how many ran.
    pub async fn process_due_retries(&self) -> usize {
        let now = Instant::now();
        let ready: Vec<RetryTask> = {
            let mut queue = self.retry_queue.lock();
            let (ready, waiting): (Vec<_>, Vec<_>) =
                queue.drain(..).partition(|task| task.next_retry_at <= now);
            queue.extend(waiting);
            ready
        };
        let count = ready.len();

        for retry in ready {
            self.attempt(retry).await;
        }

        count
    }

    /// Routes a failed task to the retry queue or the DLQ. `attempt` counts
    /// failures including this one.
    fn handle_failure(&self, task: UploadTask, generation: u64, attempt: u32, error: &CoreError) {
        let error_msg = error.to_string();

        if classify_error(error) == ErrorClass::Permanent {
            tracing::error!(
                collection_id = %self.collection_id,
                key = %task.object_key(),
                error = %error_msg,
                "Permanent upload error, moving to DLQ"
            );
            self.dead_letter(task, generation, attempt, error_msg);
            return;
        }

        if attempt > self.retry_config.max_retries {
            tracing::error!(
                collection_id = %self.collection_id,
                key = %task.object_key(),
                attempts = attempt,
                error = %error_msg,
                "Max retries exceeded, moving to DLQ"
            );
            self.dead_letter(task, generation, attempt, error_msg);
            return;
        }

        let next_retry_at = Instant::now() + self.retry_config.backoff_for(attempt);
        tracing::warn!(
            key = %task.object_key(),
            attempt,
            error = %error_msg,
            "Upload failed, scheduling retry"
        );

        self.set_state(
            &task.object_key(),
            generation,
            UploadState::RetryPending {
                attempt,
                next_retry_at,
            },
        );
        self.retry_queue.lock().push_back(RetryTask {
            task,
            generation,
            attempt,
            next_retry_at,
            last_error: error_msg,
        });
        self.retry_notify.notify_one();
    }

    /// Moves the current task of a key to the DLQ, replacing older dead
    /// letters of that key. Superseded tasks are dropped instead. Returns
    /// whether the task was dead-lettered.
    fn dead_letter(&self, task: UploadTask, generation: u64, attempt: u32, error_msg: String) -> bool {
        let key = task.object_key();
        // Held across the DLQ update so a concurrent enqueue of the same key
        // either removes this entry or makes the task stale before it lands.
        let mut states = self.states.write();
        let current = states
            .get(&key)
            .is_some_and(|tracked| tracked.generation == generation);
        if !current {
            drop(states);
            self.supersede(&key, generation);
            return false;
        }

        self.dlq.remove_for_key(&key);
        let entry = DLQEntry::new(task, error_msg, attempt, self.dlq.config().ttl_seconds);
        if let Err(e) = self.dlq.add_entry(entry) {
            tracing::error!(key = %key, error = %e, "Failed to add entry to DLQ");
            return false;
        }
        if let Some(tracked) = states.get_mut(&key) {
            tracked.state = UploadState::DeadLettered;
        }
        drop(states);

        self.counters
            .permanent_failures
            .fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Moves one DLQ entry back to the upload queue with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// `CoreError::NotFound` if no entry has that id
    pub fn requeue_dead_letter(&self, entry_id: Uuid) -> CoreResult<()> {
        let entry = self
            .dlq
            .take_entry(&entry_id)
            .ok_or_else(|| CoreError::not_found("dead letter", entry_id.to_string()))?;

        tracing::info!(
            collection_id = %self.collection_id,
            key = %entry.object_key,
            "Requeueing dead letter"
        );
        self.enqueue(entry.task)
    }

    /// Moves every DLQ entry back to the upload queue. Returns how many.
    pub fn requeue_all_dead_letters(&self) -> CoreResult<usize> {
        let entries = self.dlq.take_all();
        let count = entries.len();
        for entry in entries {
            self.enqueue(entry.task)?;
        }
        if count > 0 {
            tracing::info!(collection_id = %self.collection_id, count, "Requeued dead letters");
        }
        Ok(count)
    }

    /// Parks every task that has not been uploaded yet in the DLQ so an
    /// operator can requeue it after restart. Returns how many were parked;
    /// superseded tasks are dropped, not parked.
    pub fn park_pending(&self, reason: &str) -> usize {
        let queued: Vec<QueuedTask> = self.queue.lock().drain(..).collect();
        let retrying: Vec<RetryTask> = self.retry_queue.lock().drain(..).collect();
        let mut count = 0;

        for queued in queued {
            if self.dead_letter(queued.task, queued.generation, 0, reason.to_string()) {
                count += 1;
            }
        }
        for retry in retrying {
            let message = if retry.last_error.is_empty() {
                reason.to_string()
            } else {
                format!("{reason}; last error: {}", retry.last_error)
            };
            if self.dead_letter(retry.task, retry.generation, retry.attempt, message) {
                count += 1;
            }
        }

        if count > 0 {
            tracing::warn!(
                collection_id = %self.collection_id,
                count,
                "Parked pending uploads in DLQ"
            );
        }
        count
    }

    /// Uploader loop: drains the queue on notification or every poll interval.
    pub async fn run_uploader(self: Arc<Self>, cancel: CancellationToken) {
        tracing::debug!(collection_id = %self.collection_id, "Uploader worker started");
        let poll_interval = self.config.poll_interval();

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.upload_notify.notified() => {}
                () = tokio::time::sleep(poll_interval) => {}
            }

            while self.process_batch().await > 0 {
                if cancel.is_cancelled() {
                    break;
                }
            }
        }

        tracing::debug!(collection_id = %self.collection_id, "Uploader worker stopped");
    }

    /// Retry loop: wakes on new retries or every 100ms and runs due tasks.
    pub async fn run_retry_worker(self: Arc<Self>, cancel: CancellationToken) {
        tracing::debug!(collection_id = %self.collection_id, "Retry worker started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.retry_notify.notified() => {}
                () = tokio::time::sleep(Duration::from_millis(100)) => {}
            }

            self.process_due_retries().await;
        }

        tracing::debug!(collection_id = %self.collection_id, "Retry worker stopped");
    }

    /// DLQ maintenance loop: expires entries and persists the queue.
    pub async fn run_dlq_cleanup(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.dlq.config().cleanup_interval_seconds);
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.dlq.cleanup_expired();
            if let Err(e) = self.dlq.persist().await {
                tracing::error!(collection_id = %self.collection_id, error = %e, "DLQ persistence failed");
            }
        }
    }
}
