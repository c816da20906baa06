//! Asynchronous mirroring of documents to the cold object store
//!
//! Every acknowledged write is turned into an [`UploadTask`] and pushed
//! through three stages:
//!
//! ```text
//! Queued -> Uploading -> Uploaded
//!                     -> RetryPending { attempt, next_retry_at } -> Uploading ...
//!                     -> DeadLettered
//! ```
//!
//! Transient failures (timeouts, 5xx, throttling) back off exponentially up
//! to `max_retries`. Permanent failures and exhausted retries land in the
//! collection's [`DeadLetterQueue`](crate::dlq::DeadLetterQueue).

mod pipeline;

pub use pipeline::{UploadCounters, UploadPipeline};

use crate::object_store::document_key;
use akidb_core::{CollectionId, CoreError, CoreResult, DocumentId, VectorDocument};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// What an upload task does to the mirrored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "payload", rename_all = "snake_case")]
pub enum UploadOp {
    Put(VectorDocument),
    Delete(DocumentId),
}

/// One pending object-store mutation, always carrying the owning collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTask {
    pub collection_id: CollectionId,
    pub op: UploadOp,
}

impl UploadTask {
    pub fn put(collection_id: CollectionId, doc: VectorDocument) -> Self {
        Self {
            collection_id,
            op: UploadOp::Put(doc),
        }
    }

    pub fn delete(collection_id: CollectionId, doc_id: DocumentId) -> Self {
        Self {
            collection_id,
            op: UploadOp::Delete(doc_id),
        }
    }

    pub fn doc_id(&self) -> DocumentId {
        match &self.op {
            UploadOp::Put(doc) => doc.doc_id,
            UploadOp::Delete(doc_id) => *doc_id,
        }
    }

    /// `<collection_id>/documents/<document_id>`
    pub fn object_key(&self) -> String {
        document_key(self.collection_id, self.doc_id())
    }
}

/// Lifecycle of a mirrored object, tracked per object key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Queued,
    Uploading,
    Uploaded,
    RetryPending { attempt: u32, next_retry_at: Instant },
    DeadLettered,
}

/// Configuration for upload retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first failure before dead-lettering (default: 5)
    pub max_retries: u32,

    /// Delay before the first retry, doubled per attempt (default: 1s)
    pub base_backoff_ms: u64,

    /// Upper bound of the retry delay (default: 64s)
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 64_000,
        }
    }
}

impl RetryConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        calculate_backoff(
            attempt.saturating_sub(1),
            self.base_backoff(),
            self.max_backoff(),
        )
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.max_retries == 0 {
            return Err(CoreError::ValidationError(
                "retry.max_retries must be greater than 0".to_string(),
            ));
        }
        if self.base_backoff_ms == 0 {
            return Err(CoreError::ValidationError(
                "retry.base_backoff_ms must be greater than 0".to_string(),
            ));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(CoreError::ValidationError(format!(
                "retry.base_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.base_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(())
    }
}

/// Upload pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Tasks drained per uploader wake-up (default: 10)
    pub batch_size: usize,

    /// Uploader idle poll interval (default: 1s)
    pub poll_interval_ms: u64,

    /// Deadline of each object-store call (default: 30s)
    pub call_timeout_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval_ms: 1_000,
            call_timeout_ms: 30_000,
        }
    }
}

impl UploadConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.batch_size == 0 {
            return Err(CoreError::ValidationError(
                "upload.batch_size must be greater than 0".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(CoreError::ValidationError(
                "upload.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.call_timeout_ms == 0 {
            return Err(CoreError::ValidationError(
                "upload.call_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Whether a failed upload is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff
    Transient,
    /// Move to DLQ
    Permanent,
}

/// Classify an object-store error as transient (retry) or permanent (DLQ).
///
/// **Transient:** call deadlines, 5xx, 429, remote failures without a
/// response (dispatch failure, connection reset), local I/O errors.
///
/// **Permanent:** other 4xx, missing objects, validation and serialization
/// errors.
pub fn classify_error(error: &CoreError) -> ErrorClass {
    match error {
        CoreError::Timeout { .. } | CoreError::IoError(_) | CoreError::StorageError(_) => {
            ErrorClass::Transient
        }
        CoreError::ObjectStore { status: None, .. } => ErrorClass::Transient,
        CoreError::ObjectStore {
            status: Some(code), ..
        } => match code {
            429 | 500..=599 => ErrorClass::Transient,
            400..=499 => ErrorClass::Permanent,
            _ => ErrorClass::Transient,
        },
        CoreError::NotFound { .. }
        | CoreError::ValidationError(_)
        | CoreError::SerializationError(_)
        | CoreError::DeserializationError(_) => ErrorClass::Permanent,
        _ => ErrorClass::Transient,
    }
}

/// Exponential backoff: `min(base * 2^attempt, max)`.
///
/// `attempt` is clamped to 30 and the multiplication saturates, so large
/// attempt counts settle at `max` instead of overflowing.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    const MAX_ATTEMPT: u32 = 30;
    let power = 2u64.saturating_pow(attempt.min(MAX_ATTEMPT));
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);

    Duration::from_millis(base_ms.saturating_mul(power).min(max_ms))
}
