//! Embed stage: vectors for the claim and its evidence.
//!
//! Embeds the redacted claim body and the concatenated redacted evidence,
//! upserts both into the vector index keyed by claim id, and computes the
//! cosine similarity between them. Upserts make re-execution idempotent.

use crate::gateway::{GatewayError, ModelGateway};
use crate::index::{cosine_similarity, IndexError, VectorIndex, VectorKind};
use crate::pipeline::{EmbedOutput, SanitizeOutput, Stage, StageError};

fn map_gateway(error: GatewayError) -> StageError {
    StageError::Transient {
        stage: Stage::Embed,
        message: error.to_string(),
    }
}

fn map_index(error: IndexError) -> StageError {
    match error {
        IndexError::DimensionMismatch { .. } => StageError::Fatal {
            stage: Stage::Embed,
            message: error.to_string(),
        },
        IndexError::Backend { .. } => StageError::Transient {
            stage: Stage::Embed,
            message: error.to_string(),
        },
    }
}

/// Runs the Embed stage.
///
/// # Errors
///
/// Gateway and index backend failures are transient; a dimension mismatch
/// is fatal.
pub async fn run(
    claim_id: &str,
    sanitize: &SanitizeOutput,
    gateway: &dyn ModelGateway,
    index: &dyn VectorIndex,
    expected_dimension: usize,
) -> Result<EmbedOutput, StageError> {
    let claim_vector = gateway
        .embed(&sanitize.redacted_text)
        .await
        .map_err(map_gateway)?;
    if claim_vector.len() != expected_dimension {
        return Err(StageError::Fatal {
            stage: Stage::Embed,
            message: format!(
                "gateway returned {}-dim vector, expected {expected_dimension}",
                claim_vector.len()
            ),
        });
    }
    index
        .upsert(claim_id, VectorKind::Claim, claim_vector.clone())
        .map_err(map_index)?;

    if sanitize.redacted_evidence.is_empty() {
        return Ok(EmbedOutput {
            dimension: expected_dimension,
            claim_evidence_similarity: 1.0,
            has_evidence: false,
        });
    }

    let evidence_text = sanitize.redacted_evidence.join("\n");
    let evidence_vector = gateway.embed(&evidence_text).await.map_err(map_gateway)?;
    if evidence_vector.len() != expected_dimension {
        return Err(StageError::Fatal {
            stage: Stage::Embed,
            message: format!(
                "gateway returned {}-dim evidence vector, expected {expected_dimension}",
                evidence_vector.len()
            ),
        });
    }
    index
        .upsert(claim_id, VectorKind::Evidence, evidence_vector.clone())
        .map_err(map_index)?;

    Ok(EmbedOutput {
        dimension: expected_dimension,
        claim_evidence_similarity: cosine_similarity(&claim_vector, &evidence_vector),
        has_evidence: true,
    })
}
