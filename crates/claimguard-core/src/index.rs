//! Vector index interface and the in-process implementation.
//!
//! The Embed stage upserts claim and evidence vectors keyed by claim id;
//! the Search stage queries for the nearest prior claim vectors. Writers
//! use upsert, so re-running Embed is idempotent.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

/// Errors raised by vector index operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IndexError {
    /// A vector had the wrong dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// The index's configured dimension.
        expected: usize,
        /// The submitted vector's dimension.
        actual: usize,
    },

    /// Backend failure.
    #[error("vector index error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },
}

/// Which vector a claim id maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VectorKind {
    /// Embedding of the redacted claim body.
    Claim,
    /// Embedding of the concatenated evidence.
    Evidence,
}

/// A search hit: a prior claim and its cosine score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredClaim {
    /// The prior claim's id.
    pub claim_id: String,

    /// Cosine similarity against the query vector.
    pub score: f64,
}

/// Shared vector index.
pub trait VectorIndex: Send + Sync {
    /// Inserts or replaces a vector for a claim.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::DimensionMismatch`] for wrong-sized vectors.
    fn upsert(&self, claim_id: &str, kind: VectorKind, vector: Vec<f32>)
        -> Result<(), IndexError>;

    /// Returns the top-`k` claim vectors nearest to `query`, excluding
    /// `exclude_claim`, best first.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::DimensionMismatch`] for wrong-sized queries.
    fn search(
        &self,
        query: &[f32],
        k: usize,
        exclude_claim: &str,
    ) -> Result<Vec<ScoredClaim>, IndexError>;

    /// Fetches a stored vector.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Backend`] on backend failure.
    fn get(&self, claim_id: &str, kind: VectorKind) -> Result<Option<Vec<f32>>, IndexError>;

    /// Liveness probe.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Backend`] if the index is unreachable.
    fn probe(&self) -> Result<(), IndexError> {
        Ok(())
    }
}

/// Cosine similarity between two vectors of equal length.
///
/// Returns 0.0 when either vector has zero magnitude.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// In-process vector index.
#[derive(Debug)]
pub struct MemoryVectorIndex {
    vectors: RwLock<HashMap<(String, u8), Vec<f32>>>,
    dimension: usize,
}

const fn kind_tag(kind: VectorKind) -> u8 {
    match kind {
        VectorKind::Claim => 0,
        VectorKind::Evidence => 1,
    }
}

impl MemoryVectorIndex {
    /// Creates an index for vectors of the given dimension.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            vectors: RwLock::new(HashMap::new()),
            dimension,
        }
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

impl VectorIndex for MemoryVectorIndex {
    fn upsert(
        &self,
        claim_id: &str,
        kind: VectorKind,
        vector: Vec<f32>,
    ) -> Result<(), IndexError> {
        self.check_dimension(&vector)?;
        let mut vectors = self.vectors.write().expect("lock poisoned");
        vectors.insert((claim_id.to_string(), kind_tag(kind)), vector);
        Ok(())
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        exclude_claim: &str,
    ) -> Result<Vec<ScoredClaim>, IndexError> {
        self.check_dimension(query)?;
        let vectors = self.vectors.read().expect("lock poisoned");
        let mut scored: Vec<ScoredClaim> = vectors
            .iter()
            .filter(|((claim_id, tag), _)| {
                *tag == kind_tag(VectorKind::Claim) && claim_id != exclude_claim
            })
            .map(|((claim_id, _), vector)| ScoredClaim {
                claim_id: claim_id.clone(),
                score: cosine_similarity(query, vector),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    fn get(&self, claim_id: &str, kind: VectorKind) -> Result<Option<Vec<f32>>, IndexError> {
        let vectors = self.vectors.read().expect("lock poisoned");
        Ok(vectors.get(&(claim_id.to_string(), kind_tag(kind))).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn test_cosine_basics() {
        let a = [1.0f32, 0.0, 0.0];
        let b = [1.0f32, 0.0, 0.0];
        let c = [0.0f32, 1.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&a, &c).abs() < 1e-9);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_upsert_replaces() {
        let index = MemoryVectorIndex::new(4);
        index.upsert("c1", VectorKind::Claim, unit(4, 0)).unwrap();
        index.upsert("c1", VectorKind::Claim, unit(4, 1)).unwrap();
        assert_eq!(
            index.get("c1", VectorKind::Claim).unwrap(),
            Some(unit(4, 1))
        );
    }

    #[test]
    fn test_dimension_enforced() {
        let index = MemoryVectorIndex::new(4);
        let result = index.upsert("c1", VectorKind::Claim, vec![1.0; 3]);
        assert!(matches!(
            result,
            Err(IndexError::DimensionMismatch {
                expected: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_search_excludes_self_and_evidence_vectors() {
        let index = MemoryVectorIndex::new(4);
        index.upsert("c1", VectorKind::Claim, unit(4, 0)).unwrap();
        index.upsert("c1", VectorKind::Evidence, unit(4, 0)).unwrap();
        index.upsert("c2", VectorKind::Claim, unit(4, 0)).unwrap();
        index.upsert("c3", VectorKind::Claim, unit(4, 1)).unwrap();

        let hits = index.search(&unit(4, 0), 5, "c1").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].claim_id, "c2");
        assert!((hits[0].score - 1.0).abs() < 1e-9);
        assert!(hits[1].score.abs() < 1e-9);
    }

    #[test]
    fn test_search_truncates_to_k() {
        let index = MemoryVectorIndex::new(4);
        for i in 0..10 {
            index
                .upsert(&format!("c{i}"), VectorKind::Claim, unit(4, i % 4))
                .unwrap();
        }
        let hits = index.search(&unit(4, 0), 3, "none").unwrap();
        assert_eq!(hits.len(), 3);
    }
}
