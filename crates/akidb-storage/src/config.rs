//! Storage configuration shared by every collection backend

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::dlq::DLQConfig;
use crate::object_store::ObjectStoreConfig;
use crate::snapshotter::CompressionCodec;
use crate::upload::{RetryConfig, UploadConfig};
use crate::wal::FileWALConfig;
use akidb_core::{CollectionId, CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Compaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Compact once the retained WAL reaches this size (default: 100MB)
    pub byte_threshold: u64,
    /// Compact once this many writes happened since the last compaction
    /// (default: 10,000)
    pub op_threshold: u64,
    /// Fallback check interval of the compaction worker (default: 300s)
    pub check_interval_secs: u64,
    /// Baseline snapshots kept per collection (default: 2)
    pub snapshot_retention: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            byte_threshold: 100 * 1024 * 1024,
            op_threshold: 10_000,
            check_interval_secs: 300,
            snapshot_retention: 2,
        }
    }
}

impl CompactionConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.byte_threshold == 0 || self.op_threshold == 0 {
            return Err(CoreError::ValidationError(
                "compaction thresholds must be greater than 0".to_string(),
            ));
        }
        if self.check_interval_secs == 0 {
            return Err(CoreError::ValidationError(
                "compaction.check_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.snapshot_retention == 0 {
            return Err(CoreError::ValidationError(
                "compaction.snapshot_retention must keep at least one snapshot".to_string(),
            ));
        }
        Ok(())
    }
}

/// Storage configuration
///
/// On-disk layout under `data_dir`:
///
/// ```text
/// wal/<collection_id>/wal-<first_lsn>.log
/// snapshots/<collection_id>/snapshots/<snapshot_id>.*   (baselines, warm tier)
/// dlq/<collection_id>.json
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,

    pub wal: FileWALConfig,

    pub compaction: CompactionConfig,

    /// Run the compaction worker (default: true)
    pub enable_background_compaction: bool,

    pub retry: RetryConfig,

    pub upload: UploadConfig,

    /// Error-rate breaker in front of cold-store uploads
    pub circuit_breaker: CircuitBreakerConfig,

    pub dlq: DLQConfig,

    /// Backend of the cold tier and the document mirror
    pub cold_store: ObjectStoreConfig,

    /// Codec of newly written snapshots
    pub snapshot_compression: CompressionCodec,

    /// Documents cached per Warm/Cold collection (default: 10,000)
    pub read_cache_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::new("./data")
    }
}

impl StorageConfig {
    /// Config rooted at `data_dir`, with the cold tier in `<data_dir>/cold`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            cold_store: ObjectStoreConfig::Local {
                path: data_dir.join("cold"),
            },
            data_dir,
            wal: FileWALConfig::default(),
            compaction: CompactionConfig::default(),
            enable_background_compaction: true,
            retry: RetryConfig::default(),
            upload: UploadConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            dlq: DLQConfig::default(),
            snapshot_compression: CompressionCodec::default(),
            read_cache_capacity: 10_000,
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationError` for zero thresholds, inverted
    /// backoff bounds, a zero upload timeout or a zero WAL segment size
    pub fn validate(&self) -> CoreResult<()> {
        if self.wal.max_segment_bytes == 0 {
            return Err(CoreError::ValidationError(
                "wal.max_segment_bytes must be greater than 0".to_string(),
            ));
        }
        if self.read_cache_capacity == 0 {
            return Err(CoreError::ValidationError(
                "read_cache_capacity must be greater than 0".to_string(),
            ));
        }
        self.compaction.validate()?;
        self.retry.validate()?;
        self.upload.validate()?;
        self.circuit_breaker.validate()?;
        self.dlq.validate()?;
        Ok(())
    }

    pub fn wal_dir(&self, collection_id: CollectionId) -> PathBuf {
        self.data_dir.join("wal").join(collection_id.to_string())
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn dlq_path(&self, collection_id: CollectionId) -> PathBuf {
        self.data_dir
            .join("dlq")
            .join(format!("{collection_id}.json"))
    }

    /// Set compaction thresholds
    pub fn with_compaction_thresholds(mut self, bytes: u64, ops: u64) -> Self {
        self.compaction.byte_threshold = bytes;
        self.compaction.op_threshold = ops;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cold_store(mut self, cold_store: ObjectStoreConfig) -> Self {
        self.cold_store = cold_store;
        self
    }

    pub fn without_background_compaction(mut self) -> Self {
        self.enable_background_compaction = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        StorageConfig::default().validate().unwrap();
    }

    #[test]
    fn test_paths_are_scoped_by_collection() {
        let config = StorageConfig::new("/var/lib/akidb");
        let cid = CollectionId::allocate();
        assert_eq!(
            config.wal_dir(cid),
            PathBuf::from(format!("/var/lib/akidb/wal/{cid}"))
        );
        assert_eq!(
            config.dlq_path(cid),
            PathBuf::from(format!("/var/lib/akidb/dlq/{cid}.json"))
        );
    }

    #[test]
    fn test_rejects_zero_thresholds() {
        let config = StorageConfig::default().with_compaction_thresholds(0, 10);
        assert!(config.validate().is_err());

        let mut config = StorageConfig::default();
        config.wal.max_segment_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = StorageConfig::default();
        config.upload.call_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let config: StorageConfig = serde_json::from_str(
            r#"{"data_dir":"/data","compaction":{"op_threshold":5},"cold_store":{"kind":"s3","bucket":"cold"}}"#,
        )
        .unwrap();
        assert_eq!(config.compaction.op_threshold, 5);
        assert_eq!(config.compaction.byte_threshold, 100 * 1024 * 1024);
        assert_eq!(config.retry.max_retries, 5);
        assert!(matches!(config.cold_store, ObjectStoreConfig::S3(_)));
    }
}
