//! Mock S3 ObjectStore for testing
//!
//! In-memory bucket with injectable failures, simulated latency and a call
//! history, used to exercise the upload retry path, the dead letter queue
//! and failed tier transitions without a real S3 endpoint.
//!
//! # Examples
//!
//! ```rust
//! use akidb_storage::object_store::{MockS3ObjectStore, MockFailure, ObjectStore};
//! use bytes::Bytes;
//!
//! # async fn example() -> akidb_core::CoreResult<()> {
//! let mock = MockS3ObjectStore::new_with_failures(vec![
//!     MockFailure::Status(503),
//!     MockFailure::Ok,
//! ]);
//!
//! assert!(mock.put("key1", Bytes::from("data1")).await.is_err());
//! assert!(mock.put("key1", Bytes::from("data1")).await.is_ok());
//! assert_eq!(mock.failed_puts(), 1);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use super::{ObjectMetadata, ObjectStore};
use akidb_core::{CoreError, CoreResult};

/// Injected outcome of a mock call.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// Error response with this HTTP status, such as 503 (retryable) or
    /// 403 (straight to the DLQ).
    Status(u16),

    /// No response at all: dispatch failure or connection reset.
    ConnectionReset,

    /// Deadline expiry.
    Timeout,

    /// Success.
    Ok,
}

impl MockFailure {
    fn to_error(&self, operation: &str) -> Option<CoreError> {
        match self {
            MockFailure::Status(code) => Some(CoreError::object_store(
                operation,
                Some(*code),
                format!("status {code} {}", reason_phrase(*code)),
            )),
            MockFailure::ConnectionReset => Some(CoreError::object_store(
                operation,
                None,
                "connection reset by peer",
            )),
            MockFailure::Timeout => Some(CoreError::timeout(
                format!("object store {operation}"),
                Duration::from_secs(30),
            )),
            MockFailure::Ok => None,
        }
    }
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// Mock S3 configuration.
#[derive(Debug, Clone)]
pub struct MockS3Config {
    /// Simulated network latency per call.
    pub latency: Duration,

    /// Enable call history tracking.
    pub track_history: bool,
}

impl Default for MockS3Config {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(1),
            track_history: true,
        }
    }
}

/// One recorded call.
#[derive(Debug, Clone)]
pub struct CallHistoryEntry {
    pub operation: &'static str,
    pub key: String,
    pub success: bool,
    pub timestamp: Instant,
}

/// In-memory S3 stand-in.
///
/// Failures queued with [`MockS3ObjectStore::new_with_failures`] or
/// [`MockS3ObjectStore::push_failures`] are consumed by `put` calls in order.
/// [`MockS3ObjectStore::fail_all`] makes every operation fail until cleared.
pub struct MockS3ObjectStore {
    storage: RwLock<BTreeMap<String, Bytes>>,
    put_failures: RwLock<VecDeque<MockFailure>>,
    fail_all: RwLock<Option<MockFailure>>,
    config: MockS3Config,
    call_history: RwLock<Vec<CallHistoryEntry>>,
}

impl MockS3ObjectStore {
    pub fn new() -> Self {
        Self::new_with_config(MockS3Config::default())
    }

    pub fn new_with_config(config: MockS3Config) -> Self {
        Self {
            storage: RwLock::new(BTreeMap::new()),
            put_failures: RwLock::new(VecDeque::new()),
            fail_all: RwLock::new(None),
            config,
            call_history: RwLock::new(Vec::new()),
        }
    }

    /// Mock whose next puts follow `pattern`; later puts succeed.
    pub fn new_with_failures(pattern: Vec<MockFailure>) -> Self {
        let mock = Self::new();
        mock.push_failures(pattern);
        mock
    }

    /// Mock whose every operation fails with HTTP `status`.
    pub fn new_always_fail(status: u16) -> Self {
        let mock = Self::new();
        mock.fail_all(Some(MockFailure::Status(status)));
        mock
    }

    /// Mock whose next 100 puts time out with probability `failure_rate`.
    pub fn new_flaky(failure_rate: f64) -> Self {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let pattern = (0..100)
            .map(|_| {
                if rng.gen::<f64>() < failure_rate {
                    MockFailure::Timeout
                } else {
                    MockFailure::Ok
                }
            })
            .collect();
        Self::new_with_failures(pattern)
    }

    /// Queues outcomes for upcoming puts.
    pub fn push_failures(&self, pattern: impl IntoIterator<Item = MockFailure>) {
        self.put_failures.write().extend(pattern);
    }

    /// Makes every operation fail with `failure`, or restores normal service
    /// with `None`.
    pub fn fail_all(&self, failure: Option<MockFailure>) {
        *self.fail_all.write() = failure;
    }

    pub fn get_call_history(&self) -> Vec<CallHistoryEntry> {
        self.call_history.read().clone()
    }

    pub fn successful_puts(&self) -> usize {
        self.count_calls("put", true)
    }

    pub fn failed_puts(&self) -> usize {
        self.count_calls("put", false)
    }

    /// Number of stored objects.
    pub fn storage_size(&self) -> usize {
        self.storage.read().len()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.storage.read().contains_key(key)
    }

    /// Stored keys in lexical order.
    pub fn keys(&self) -> Vec<String> {
        self.storage.read().keys().cloned().collect()
    }

    fn count_calls(&self, operation: &str, success: bool) -> usize {
        self.call_history
            .read()
            .iter()
            .filter(|entry| entry.operation == operation && entry.success == success)
            .count()
    }

    /// Simulates latency and returns the injected error for this call, if any.
    async fn simulate(&self, operation: &'static str, key: &str) -> CoreResult<()> {
        tokio::time::sleep(self.config.latency).await;

        let injected = self.fail_all.read().clone().or_else(|| {
            if operation == "put" {
                self.put_failures.write().pop_front()
            } else {
                None
            }
        });

        match injected.and_then(|f| f.to_error(operation)) {
            Some(error) => {
                self.record_call(operation, key, false);
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn record_call(&self, operation: &'static str, key: &str, success: bool) {
        if self.config.track_history {
            self.call_history.write().push(CallHistoryEntry {
                operation,
                key: key.to_string(),
                success,
                timestamp: Instant::now(),
            });
        }
    }

    fn metadata(key: &str, data: &Bytes) -> ObjectMetadata {
        ObjectMetadata {
            key: key.to_string(),
            size_bytes: data.len() as u64,
            last_modified: Utc::now(),
            etag: Some(format!("{:x}", md5::compute(data.as_ref()))),
        }
    }
}

impl Default for MockS3ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MockS3ObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> CoreResult<()> {
        self.simulate("put", key).await?;
        self.storage.write().insert(key.to_string(), data);
        self.record_call("put", key, true);
        Ok(())
    }

    async fn get(&self, key: &str) -> CoreResult<Bytes> {
        self.simulate("get", key).await?;
        let found = self.storage.read().get(key).cloned();
        self.record_call("get", key, found.is_some());
        found.ok_or_else(|| CoreError::not_found("object", key))
    }

    async fn exists(&self, key: &str) -> CoreResult<bool> {
        self.simulate("exists", key).await?;
        Ok(self.storage.read().contains_key(key))
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        self.simulate("delete", key).await?;
        self.storage.write().remove(key);
        self.record_call("delete", key, true);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<ObjectMetadata>> {
        self.simulate("list", prefix).await?;
        Ok(self
            .storage
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| Self::metadata(k, v))
            .collect())
    }

    async fn head(&self, key: &str) -> CoreResult<ObjectMetadata> {
        self.simulate("head", key).await?;
        let found = self.storage.read().get(key).map(|v| Self::metadata(key, v));
        self.record_call("head", key, found.is_some());
        found.ok_or_else(|| CoreError::not_found("object", key))
    }
}
