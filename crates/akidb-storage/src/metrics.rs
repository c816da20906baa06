//! Per-backend storage metrics

use akidb_core::Tier;
use chrono::{DateTime, Utc};
use std::fmt::Write;

/// Storage metrics for monitoring and debugging
#[derive(Debug, Clone, Default)]
pub struct StorageMetrics {
    /// Total insert operations
    pub inserts: u64,
    /// Successful reads (hits and misses)
    pub queries: u64,
    /// Total delete operations
    pub deletes: u64,
    /// Objects mirrored to the cold store
    pub uploads: u64,
    /// Upload retry attempts
    pub upload_retries: u64,
    /// Uploads moved to the DLQ
    pub upload_permanent_failures: u64,
    /// Uploads dropped because a newer write of the same object was queued
    pub superseded_uploads: u64,
    /// 0 = Closed, 1 = Open, 2 = HalfOpen
    pub circuit_breaker_state: u8,
    /// Error rate seen by the upload circuit breaker (0.0-1.0)
    pub circuit_breaker_error_rate: f64,
    pub dlq_size: usize,
    /// Retained WAL bytes
    pub wal_size_bytes: u64,
    /// Writes since the last compaction; reset by compaction
    pub ops_since_last_compaction: u64,
    pub compactions: u64,
    /// Tombstones held in memory
    pub tombstones: u64,
    pub tier_transitions: u64,
    /// Read-through cache hits while Warm/Cold
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub last_snapshot_at: Option<DateTime<Utc>>,
    pub tier: Option<Tier>,
}

impl StorageMetrics {
    /// Cache hit rate (0.0 = 0%, 1.0 = 100%)
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Exports storage metrics in Prometheus text format (v0.0.4).
    ///
    /// ```rust
    /// use akidb_storage::StorageMetrics;
    ///
    /// let output = StorageMetrics::default().export_prometheus();
    /// assert!(output.contains("akidb_storage_uploads_total"));
    /// ```
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        let counters: [(&str, &str, u64); 11] = [
            ("akidb_storage_inserts_total", "Total insert operations", self.inserts),
            ("akidb_storage_queries_total", "Total successful read operations", self.queries),
            ("akidb_storage_deletes_total", "Total delete operations", self.deletes),
            ("akidb_storage_uploads_total", "Objects mirrored to the cold store", self.uploads),
            ("akidb_storage_upload_retries_total", "Upload retry attempts", self.upload_retries),
            (
                "akidb_storage_upload_permanent_failures_total",
                "Uploads moved to the dead letter queue",
                self.upload_permanent_failures,
            ),
            (
                "akidb_storage_superseded_uploads_total",
                "Uploads dropped in favour of a newer write of the same object",
                self.superseded_uploads,
            ),
            ("akidb_storage_compactions_total", "Compactions performed", self.compactions),
            ("akidb_storage_tier_transitions_total", "Tier transitions committed", self.tier_transitions),
            ("akidb_storage_cache_hits_total", "Read cache hits", self.cache_hits),
            ("akidb_storage_cache_misses_total", "Read cache misses", self.cache_misses),
        ];

        let gauges: [(&str, &str, u64); 5] = [
            ("akidb_storage_dlq_size", "Current dead letter queue size", self.dlq_size as u64),
            ("akidb_storage_wal_size_bytes", "Retained WAL size in bytes", self.wal_size_bytes),
            (
                "akidb_storage_ops_since_last_compaction",
                "Writes since the last compaction",
                self.ops_since_last_compaction,
            ),
            ("akidb_storage_tombstones", "Tombstones held in memory", self.tombstones),
            (
                "akidb_storage_circuit_breaker_state",
                "Upload circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
                u64::from(self.circuit_breaker_state),
            ),
        ];

        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            let _ = writeln!(output, "{name} {value}");
        }
        for (name, help, value) in gauges {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} gauge");
            let _ = writeln!(output, "{name} {value}");
        }

        output.push_str(
            "# HELP akidb_storage_circuit_breaker_error_rate Upload error rate seen by the circuit breaker\n",
        );
        output.push_str("# TYPE akidb_storage_circuit_breaker_error_rate gauge\n");
        let _ = writeln!(
            output,
            "akidb_storage_circuit_breaker_error_rate {:.4}",
            self.circuit_breaker_error_rate
        );

        if let Some(tier) = self.tier {
            output.push_str("# HELP akidb_storage_tier Current tier of the collection\n");
            output.push_str("# TYPE akidb_storage_tier gauge\n");
            for candidate in [Tier::Hot, Tier::Warm, Tier::Cold] {
                let _ = writeln!(
                    output,
                    "akidb_storage_tier{{tier=\"{candidate}\"}} {}",
                    u8::from(candidate == tier)
                );
            }
        }

        output
    }
}
