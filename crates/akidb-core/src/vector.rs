//! Vector document types shared by the storage engine and the index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::ids::DocumentId;

/// A vector document as written to the WAL, snapshots and the cold tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorDocument {
    /// Unique identifier within the collection
    pub doc_id: DocumentId,

    /// External identifier (user-provided, optional)
    pub external_id: Option<String>,

    /// Dense vector embedding
    pub vector: Vec<f32>,

    /// JSON metadata payload (user-defined)
    pub metadata: Option<JsonValue>,

    /// Timestamp when document was inserted
    pub inserted_at: DateTime<Utc>,
}

impl VectorDocument {
    /// Creates a new vector document with the given ID and vector.
    #[must_use]
    pub fn new(doc_id: DocumentId, vector: Vec<f32>) -> Self {
        Self {
            doc_id,
            external_id: None,
            vector,
            metadata: None,
            inserted_at: Utc::now(),
        }
    }

    /// Sets the external identifier (builder pattern).
    #[must_use]
    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    /// Sets the metadata (builder pattern).
    #[must_use]
    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Returns the dimension of the vector.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// Result of a vector search operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// Document identifier
    pub doc_id: DocumentId,

    /// Distance/similarity score (metric-dependent)
    pub score: f32,

    /// Document metadata (if requested)
    pub metadata: Option<JsonValue>,
}

impl SearchResult {
    /// Creates a new search result with the given document ID and score.
    #[must_use]
    pub fn new(doc_id: DocumentId, score: f32) -> Self {
        Self {
            doc_id,
            score,
            metadata: None,
        }
    }
}
