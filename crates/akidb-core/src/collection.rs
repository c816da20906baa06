use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::CoreError;
use crate::ids::CollectionId;

/// Distance metric for vector similarity search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// Cosine similarity (1 - cosine distance)
    #[default]
    Cosine,
    /// Dot product (negative for minimization)
    Dot,
    /// Euclidean (L2) distance
    L2,
}

impl DistanceMetric {
    /// Returns the canonical lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::Dot => "dot",
            Self::L2 => "l2",
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(Self::Cosine),
            "dot" => Ok(Self::Dot),
            "l2" => Ok(Self::L2),
            other => Err(CoreError::ValidationError(format!(
                "unknown distance metric `{other}`"
            ))),
        }
    }
}

/// Configuration parameters for a vector collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    /// Stable collection identifier.
    pub collection_id: CollectionId,
    /// Human-readable name for the collection.
    pub name: String,
    /// Vector dimension.
    pub dimension: u32,
    /// Distance metric for similarity search.
    pub metric: DistanceMetric,
    /// Creation timestamp in UTC.
    pub created_at: DateTime<Utc>,
}

impl CollectionDescriptor {
    /// Minimum vector dimension.
    pub const MIN_DIMENSION: u32 = 1;
    /// Maximum vector dimension.
    pub const MAX_DIMENSION: u32 = 4096;

    /// Creates the descriptor of a brand-new collection, allocating its id.
    #[must_use]
    pub fn new(name: impl Into<String>, dimension: u32, metric: DistanceMetric) -> Self {
        Self {
            collection_id: CollectionId::allocate(),
            name: name.into(),
            dimension,
            metric,
            created_at: Utc::now(),
        }
    }

    /// Validates name and dimension bounds.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationError` if the name is empty or the
    /// dimension is outside [MIN_DIMENSION, MAX_DIMENSION].
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "collection name must not be empty".to_string(),
            ));
        }
        if self.dimension < Self::MIN_DIMENSION || self.dimension > Self::MAX_DIMENSION {
            return Err(CoreError::ValidationError(format!(
                "dimension {} is outside valid range [{}, {}]",
                self.dimension,
                Self::MIN_DIMENSION,
                Self::MAX_DIMENSION
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_dimension() {
        let descriptor = CollectionDescriptor::new("docs", 0, DistanceMetric::Cosine);
        assert!(descriptor.validate().is_err());

        let descriptor = CollectionDescriptor::new("docs", 8192, DistanceMetric::L2);
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn metric_parses_canonical_names() {
        for metric in [DistanceMetric::Cosine, DistanceMetric::Dot, DistanceMetric::L2] {
            assert_eq!(metric.as_str().parse::<DistanceMetric>().unwrap(), metric);
        }
        assert!("hamming".parse::<DistanceMetric>().is_err());
    }
}
