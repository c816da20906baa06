//! Hot/Warm/Cold Tiering Manager
//!
//! This module implements automatic tiering of vector collections based on access patterns:
//! - **Hot Tier** (RAM): Frequently accessed collections
//! - **Warm Tier** (Local Disk): Occasionally accessed collections
//! - **Cold Tier** (S3/MinIO): Rarely accessed collections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      CollectionService                          │
//! │                                                                 │
//! │  get()/insert() → AccessTracker.record_access(collection_id)    │
//! │                        ↓                                        │
//! │                  TieringManager ──► TierStateRepository         │
//! │                        ↓                                        │
//! │                  TierMaterializer                               │
//! │                        ↓                                        │
//! │     ┌──────────────────┼──────────────────┐                     │
//! │     │                  │                  │                     │
//! │  Hot Tier          Warm Tier          Cold Tier                 │
//! │  (RAM)             (local snapshot)   (object store snapshot)   │
//! │     │                  │                  │                     │
//! │     └──────────────────┴──────────────────┘                     │
//! │                        ↑                                        │
//! │               Background Worker                                 │
//! │               (runs every worker_interval_secs)                 │
//! │               - Flush access counts                             │
//! │               - Demote hot → warm → cold                        │
//! │               - Promote cold → warm → hot                       │
//! │               - Enforce max_hot_collections                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod manager;
mod policy;
mod tracker;

pub use manager::{CycleReport, TierMaterializer, TieringManager, TieringStats};
pub use policy::TieringPolicyConfig;
pub use tracker::{AccessStats, AccessTracker, PendingAccess};
