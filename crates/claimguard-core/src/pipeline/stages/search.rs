//! Search stage: similar prior claims.
//!
//! Queries the vector index for the nearest prior claim vectors, excluding
//! the claim's own just-inserted vector, and keeps neighbors above the
//! score floor as context for the verifier models.

use crate::config::SearchConfig;
use crate::index::{IndexError, VectorIndex, VectorKind};
use crate::pipeline::{SearchOutput, SimilarClaim, Stage, StageError};

fn map_index(error: IndexError) -> StageError {
    match error {
        IndexError::DimensionMismatch { .. } => StageError::Fatal {
            stage: Stage::Search,
            message: error.to_string(),
        },
        IndexError::Backend { .. } => StageError::Transient {
            stage: Stage::Search,
            message: error.to_string(),
        },
    }
}

/// Runs the Search stage.
///
/// # Errors
///
/// A missing claim vector is fatal (Embed must have completed); backend
/// failures are transient.
pub async fn run(
    claim_id: &str,
    index: &dyn VectorIndex,
    config: &SearchConfig,
) -> Result<SearchOutput, StageError> {
    let query = index
        .get(claim_id, VectorKind::Claim)
        .map_err(map_index)?
        .ok_or_else(|| StageError::Fatal {
            stage: Stage::Search,
            message: format!("no claim vector for {claim_id}; embed did not run"),
        })?;

    let hits = index
        .search(&query, config.top_k, claim_id)
        .map_err(map_index)?;

    Ok(SearchOutput {
        similar: hits
            .into_iter()
            .filter(|hit| hit.score > config.min_score)
            .map(|hit| SimilarClaim {
                claim_id: hit.claim_id,
                score: hit.score,
            })
            .collect(),
    })
}
