//! Linear-scan vector index over the Hot tier.
//!
//! Only vectors are held here; the documents themselves live in the storage
//! backend. Warm and Cold collections are searched with [`rank`] directly
//! over the documents their backend restores.

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use akidb_core::{
    CoreError, CoreResult, DistanceMetric, DocumentId, SearchResult, VectorDocument, VectorIndex,
};

/// Similarity (Cosine, Dot) or distance (L2) between two vectors of equal length.
pub fn score(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Dot => dot(a, b),
        DistanceMetric::Cosine => {
            let norm = dot(a, a).sqrt() * dot(b, b).sqrt();
            if norm == 0.0 {
                0.0
            } else {
                dot(a, b) / norm
            }
        }
        DistanceMetric::L2 => a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Top-k of `candidates` against `query`, best first.
pub fn rank<'a>(
    metric: DistanceMetric,
    query: &[f32],
    candidates: impl IntoIterator<Item = (DocumentId, &'a [f32])>,
    k: usize,
) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = candidates
        .into_iter()
        .map(|(doc_id, vector)| SearchResult::new(doc_id, score(metric, query, vector)))
        .collect();

    match metric {
        // Lower is closer
        DistanceMetric::L2 => {
            results.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal));
        }
        DistanceMetric::Cosine | DistanceMetric::Dot => {
            results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        }
    }

    results.truncate(k);
    results
}

/// Brute-force index: O(n·d) per search.
///
/// ```
/// use akidb_core::{DistanceMetric, DocumentId, VectorDocument, VectorIndex};
/// use akidb_service::BruteForceIndex;
///
/// # #[tokio::main]
/// # async fn main() -> akidb_core::CoreResult<()> {
/// let index = BruteForceIndex::new(4, DistanceMetric::Cosine);
/// index.insert(VectorDocument::new(DocumentId::new(), vec![0.1; 4])).await?;
///
/// let results = index.search(&[0.1; 4], 10).await?;
/// assert_eq!(results.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct BruteForceIndex {
    dim: usize,
    metric: DistanceMetric,
    vectors: RwLock<HashMap<DocumentId, Vec<f32>>>,
}

impl BruteForceIndex {
    #[must_use]
    pub fn new(dim: usize, metric: DistanceMetric) -> Self {
        Self {
            dim,
            metric,
            vectors: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dim
    }

    #[must_use]
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    fn check_dimension(&self, what: &str, len: usize) -> CoreResult<()> {
        if len != self.dim {
            return Err(CoreError::invalid_state(format!(
                "{what} dimension mismatch: expected {}, got {len}",
                self.dim
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for BruteForceIndex {
    async fn insert(&self, doc: VectorDocument) -> CoreResult<()> {
        self.check_dimension("Vector", doc.vector.len())?;
        self.vectors.write().insert(doc.doc_id, doc.vector);
        Ok(())
    }

    async fn insert_batch(&self, docs: Vec<VectorDocument>) -> CoreResult<()> {
        for doc in &docs {
            self.check_dimension("Vector", doc.vector.len())?;
        }
        let mut vectors = self.vectors.write();
        for doc in docs {
            vectors.insert(doc.doc_id, doc.vector);
        }
        Ok(())
    }

    async fn search(&self, query: &[f32], k: usize) -> CoreResult<Vec<SearchResult>> {
        self.check_dimension("Query", query.len())?;

        let vectors = self.vectors.read();
        Ok(rank(
            self.metric,
            query,
            vectors.iter().map(|(id, v)| (*id, v.as_slice())),
            k,
        ))
    }

    async fn delete(&self, doc_id: DocumentId) -> CoreResult<()> {
        self.vectors.write().remove(&doc_id);
        Ok(())
    }

    async fn count(&self) -> CoreResult<usize> {
        Ok(self.vectors.read().len())
    }

    async fn clear(&self) -> CoreResult<()> {
        self.vectors.write().clear();
        Ok(())
    }
}
