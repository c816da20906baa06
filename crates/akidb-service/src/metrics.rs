//! Prometheus metrics of the collection service
//!
//! Each service owns its own [`Registry`], so several services in one
//! process (tests, embedded use) never collide on registration. Per-backend
//! storage counters are appended from [`StorageMetrics::export_prometheus`].
//!
//! [`StorageMetrics::export_prometheus`]: akidb_storage::StorageMetrics::export_prometheus

use akidb_core::{CoreError, CoreResult, Tier};
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

pub struct ServiceMetrics {
    registry: Registry,

    /// Vector operations by kind (insert, get, delete, search)
    pub operations_total: IntCounterVec,

    /// Index inserts undone because the storage write failed
    pub index_rollbacks_total: IntCounter,

    /// Index rebuilds forced by a failed index removal
    pub index_rebuilds_total: IntCounter,

    /// Insert latency, index and storage combined (seconds)
    pub insert_duration_seconds: Histogram,

    /// Loaded collections
    pub collections: IntGauge,

    /// Loaded collections per tier (hot/warm/cold)
    pub tier_distribution: GaugeVec,
}

impl ServiceMetrics {
    pub fn new() -> CoreResult<Self> {
        let registry = Registry::new();

        let operations_total = IntCounterVec::new(
            Opts::new("akidb_operations_total", "Vector operations by kind"),
            &["operation"],
        )
        .map_err(metric_error)?;

        let index_rollbacks_total = IntCounter::new(
            "akidb_index_rollbacks_total",
            "Index inserts undone after a failed storage write",
        )
        .map_err(metric_error)?;

        let index_rebuilds_total = IntCounter::new(
            "akidb_index_rebuilds_total",
            "Index rebuilds after a failed index removal",
        )
        .map_err(metric_error)?;

        let insert_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "akidb_insert_duration_seconds",
                "Vector insert latency in seconds",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5]),
        )
        .map_err(metric_error)?;

        let collections = IntGauge::new("akidb_collections", "Loaded collections")
            .map_err(metric_error)?;

        let tier_distribution = GaugeVec::new(
            Opts::new(
                "akidb_tier_distribution_collections",
                "Number of collections per tier",
            ),
            &["tier"],
        )
        .map_err(metric_error)?;

        registry
            .register(Box::new(operations_total.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(index_rollbacks_total.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(index_rebuilds_total.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(insert_duration_seconds.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(collections.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(tier_distribution.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            registry,
            operations_total,
            index_rollbacks_total,
            index_rebuilds_total,
            insert_duration_seconds,
            collections,
            tier_distribution,
        })
    }

    pub fn record_operation(&self, operation: &str) {
        self.operations_total.with_label_values(&[operation]).inc();
    }

    /// Replaces the tier gauges with the given per-tier counts.
    pub fn set_tier_distribution(&self, hot: usize, warm: usize, cold: usize) {
        for (tier, count) in [(Tier::Hot, hot), (Tier::Warm, warm), (Tier::Cold, cold)] {
            self.tier_distribution
                .with_label_values(&[tier.as_str()])
                .set(count as f64);
        }
        self.collections.set((hot + warm + cold) as i64);
    }

    /// Service metrics in Prometheus text format
    pub fn export(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %e, "Failed to encode metrics");
        }

        String::from_utf8(buffer).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to convert metrics to UTF-8");
            String::from("# Error encoding metrics\n")
        })
    }
}

fn metric_error(e: prometheus::Error) -> CoreError {
    CoreError::internal(format!("metric registration failed: {e}"))
}
