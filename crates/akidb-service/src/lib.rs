//! Collection service for the AkiDB tiered storage engine.
//!
//! Ties a searchable index and a [`akidb_storage::StorageBackend`] together
//! per collection, drives tiering through the registry, and carries the
//! process-level concerns: layered configuration, tracing setup and
//! Prometheus metrics.

mod collection_service;
pub mod config;
pub mod index;
pub mod metrics;
pub mod registry;
pub mod telemetry;

pub use collection_service::{CollectionService, IndexFactory};
pub use config::{AkidbConfig, LogFormat, LoggingConfig, MetadataConfig};
pub use index::BruteForceIndex;
pub use metrics::ServiceMetrics;
pub use registry::{CollectionEntry, CollectionRegistry};
pub use telemetry::init_tracing;
