//! Verify stage: model opinions and consensus.
//!
//! Opens the claim's voting session, fetches one structured opinion per
//! configured verifier model in parallel (bounded by the per-instance
//! concurrency cap), parses each response strictly into a vote, and reads
//! the final snapshot. Unparseable or failed responses become error votes:
//! recorded, but excluded from the consensus math.
//!
//! The session seals when collection finishes, so the checkpointed
//! snapshot stays the session's final word; external votes contribute only
//! while collection is in flight.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::claim::Claim;
use crate::config::ModelConfig;
use crate::consensus::{ConsensusEngine, ConsensusError, Verdict, Vote};
use crate::gateway::{parse_opinion, GatewayError, ModelGateway, OpinionRequest};
use crate::pipeline::{SanitizeOutput, SearchOutput, Stage, StageError, VerifyOutput};
use crate::trust::TrustRegistry;

fn map_consensus(error: ConsensusError) -> StageError {
    StageError::Fatal {
        stage: Stage::Verify,
        message: error.to_string(),
    }
}

/// Runs the Verify stage.
///
/// # Errors
///
/// Returns [`StageError::Transient`] when every model call failed at the
/// transport layer (the gateway itself is likely down) and
/// [`StageError::Fatal`] on consensus engine misuse.
pub async fn run(
    claim: &Claim,
    sanitize: &SanitizeOutput,
    search: &SearchOutput,
    engine: &ConsensusEngine,
    gateway: Arc<dyn ModelGateway>,
    trust: &TrustRegistry,
    config: &ModelConfig,
) -> Result<VerifyOutput, StageError> {
    let models_queried = config.verifiers.clone();

    // Crash recovery: a sealed session already holds the final snapshot.
    if let Some(session) = engine.session(&claim.id) {
        if session.sealed {
            return Ok(VerifyOutput {
                snapshot: session.snapshot,
                models_queried,
            });
        }
    }

    engine
        .open_session(&claim.id, claim.domain)
        .map_err(map_consensus)?;

    let request = Arc::new(OpinionRequest {
        claim_text: sanitize.redacted_text.clone(),
        evidence: sanitize.redacted_evidence.clone(),
        similar_claims: search
            .similar
            .iter()
            .map(|s| (s.claim_id.clone(), s.score))
            .collect(),
        domain: claim.domain,
    });

    let semaphore = Arc::new(Semaphore::new(config.concurrency_cap.max(1)));
    let mut calls: JoinSet<(String, Result<String, GatewayError>)> = JoinSet::new();
    for model_id in &config.verifiers {
        let model_id = model_id.clone();
        let gateway = Arc::clone(&gateway);
        let request = Arc::clone(&request);
        let semaphore = Arc::clone(&semaphore);
        let call_timeout = config.call_timeout;
        calls.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let outcome = match tokio::time::timeout(
                call_timeout,
                gateway.opine(&model_id, &request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout {
                    model_id: model_id.clone(),
                }),
            };
            (model_id, outcome)
        });
    }

    let mut transport_failures = 0usize;
    let mut responses = 0usize;
    while let Some(joined) = calls.join_next().await {
        let (model_id, outcome) = joined.map_err(|e| StageError::Fatal {
            stage: Stage::Verify,
            message: format!("model call task panicked: {e}"),
        })?;
        let weight = trust.weight_for(&model_id);

        let vote = match outcome {
            Ok(raw) => {
                responses += 1;
                match parse_opinion(&raw, config.max_reasoning_len) {
                    Ok(opinion) => Vote {
                        model_id: model_id.clone(),
                        verdict: opinion.verdict,
                        confidence: opinion.confidence,
                        coherence: opinion.coherence,
                        reasoning: opinion.reasoning,
                        weight,
                        received_at: chrono::Utc::now(),
                    },
                    Err(error) => {
                        warn!(model_id = %model_id, %error, "unparseable model opinion");
                        Vote::new(&model_id, Verdict::Error, 0.0, 0.0, weight)
                            .with_reasoning(error.to_string())
                    }
                }
            }
            Err(error) => {
                transport_failures += 1;
                debug!(model_id = %model_id, %error, "model call failed");
                Vote::new(&model_id, Verdict::Error, 0.0, 0.0, weight)
                    .with_reasoning(error.to_string())
            }
        };

        engine.submit_vote(&claim.id, vote).map_err(map_consensus)?;
    }

    // Every call died in transport: the gateway is down, retry the stage.
    if responses == 0 && transport_failures > 0 {
        return Err(StageError::Transient {
            stage: Stage::Verify,
            message: format!("all {transport_failures} model calls failed"),
        });
    }

    let snapshot = engine.seal(&claim.id).map_err(map_consensus)?;
    if let Some(session) = engine.session(&claim.id) {
        let votes: Vec<Vote> = session.votes.values().cloned().collect();
        trust.record_outcomes(&snapshot, &votes);
    }

    Ok(VerifyOutput {
        snapshot,
        models_queried,
    })
}
