//! Core domain types and traits for the AkiDB tiered storage engine.

pub mod collection;
pub mod error;
pub mod ids;
pub mod tier;
pub mod traits;
pub mod vector;

pub use collection::{CollectionDescriptor, DistanceMetric};
pub use error::{CoreError, CoreResult};
pub use ids::{CollectionId, DocumentId, SnapshotId};
pub use tier::{Tier, TierState};
pub use traits::{TierStateRepository, VectorIndex};
pub use vector::{SearchResult, VectorDocument};
