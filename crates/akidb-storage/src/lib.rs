//! Tiered storage for AkiDB collections
//!
//! - [`wal`]: per-collection write-ahead log with LSNs and rotation
//! - [`object_store`]: local, S3 and mock object stores
//! - [`snapshotter`]: full JSON snapshots (optionally gzip'd)
//! - [`upload`], [`dlq`] and [`circuit_breaker`]: asynchronous mirroring to
//!   the cold store with retry, dead-lettering and an error-rate breaker
//! - [`storage_backend`]: the per-collection facade, compaction and tier
//!   transitions
//! - [`tiering_manager`]: access tracking and the Hot/Warm/Cold policy loop

pub mod circuit_breaker;
pub mod config;
pub mod dlq;
pub mod metrics;
pub mod object_store;
pub mod snapshotter;
pub mod storage_backend;
pub mod tiering_manager;
pub mod upload;
pub mod wal;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState};
pub use config::{CompactionConfig, StorageConfig};
pub use dlq::{DLQConfig, DLQEntry, DLQMetrics, DeadLetterQueue};
pub use metrics::StorageMetrics;
pub use object_store::{
    LocalObjectStore, MockS3ObjectStore, ObjectStore, ObjectStoreConfig, S3ObjectStore,
};
pub use snapshotter::{CompressionCodec, JsonSnapshotter, SnapshotMetadata, Snapshotter};
pub use storage_backend::{
    BackendState, CompactionOutcome, PreparedTransition, StorageBackend, TierTransition,
    TransitionOutcome,
};
pub use tiering_manager::{
    AccessTracker, CycleReport, TierMaterializer, TieringManager, TieringPolicyConfig,
};
pub use upload::{RetryConfig, UploadConfig, UploadPipeline, UploadState, UploadTask};
pub use wal::{FileWAL, FileWALConfig, LogEntry, LogSequenceNumber, WriteAheadLog};
