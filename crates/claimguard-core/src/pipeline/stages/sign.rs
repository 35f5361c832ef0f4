//! Sign stage: compose, hash, chain, and persist the proof record.
//!
//! Builds the canonical proof bundle from the checkpointed stage outputs,
//! links it to the domain chain tip, and writes it with a compare-and-swap
//! on the tip. The bundle's timestamp and duration come from the
//! checkpoint, so a crash-recovery re-run reproduces byte-identical bundle
//! bytes; a re-run after a successful write finds the existing record and
//! returns it instead of writing twice.

use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::consensus::FinalVerdict;
use crate::evidence::{EvidenceError, EvidenceStore};
use crate::pipeline::{
    PipelineInstance, ReviewDecision, ReviewOutcome, Stage, StageError,
};
use crate::proof::{ProofBundle, ProofRecord, ProofSigner, StageBundle};

/// Chain tag for claims without a domain.
pub const GENERAL_DOMAIN: &str = "general";

fn missing(stage: Stage) -> StageError {
    StageError::Fatal {
        stage: Stage::Sign,
        message: format!("{stage} output missing from checkpoint"),
    }
}

/// Runs the Sign stage.
///
/// # Errors
///
/// Missing upstream outputs are fatal; evidence store failures and
/// exhausted chain-tip contention are transient.
pub async fn run(
    instance: &PipelineInstance,
    decision: &ReviewDecision,
    evidence: &dyn EvidenceStore,
    signer: &ProofSigner,
    pipeline_version: &str,
    cas_retry_limit: u32,
) -> Result<ProofRecord, StageError> {
    // Exactly-once: a crash after the evidence write but before the
    // checkpoint leaves the record in place; reuse it.
    if let Some(existing) = evidence
        .find_by_instance(&instance.instance_id)
        .map_err(map_evidence)?
    {
        debug!(
            instance_id = %instance.instance_id,
            proof_id = %existing.proof_id,
            "sign re-run found existing proof"
        );
        return Ok(existing);
    }

    let sanitize = instance.sanitize.clone().ok_or_else(|| missing(Stage::Sanitize))?;
    let embed = instance.embed.clone().ok_or_else(|| missing(Stage::Embed))?;
    let search = instance.search.clone().ok_or_else(|| missing(Stage::Search))?;
    let verify = instance.verify.clone().ok_or_else(|| missing(Stage::Verify))?;
    let detect = instance.detect.clone().ok_or_else(|| missing(Stage::Detect))?;

    // A human rejection (or expiry) forces a halt proof; an approval lets
    // the computed verdict stand, halts included.
    let verdict = match decision.outcome {
        ReviewOutcome::Rejected | ReviewOutcome::Expired => FinalVerdict::Halt,
        ReviewOutcome::Approved if detect.halt_required => FinalVerdict::Halt,
        ReviewOutcome::Approved => verify.snapshot.final_verdict,
    };

    // Bundle time is pinned to the Detect completion in the checkpoint so
    // re-runs produce identical bytes.
    let timestamp = instance
        .stage_log
        .iter()
        .find(|entry| entry.stage == Stage::Detect)
        .map_or(instance.updated_at, |entry| entry.completed_at);
    let duration_ms =
        u64::try_from((timestamp - instance.started_at).num_milliseconds().max(0))
            .unwrap_or(0);

    let domain = instance
        .claim
        .domain
        .map_or(GENERAL_DOMAIN, |d| d.as_str())
        .to_string();

    let mut attempt = 0u32;
    loop {
        let tip = evidence.chain_tip(&domain).map_err(map_evidence)?;

        let mut bundle = ProofBundle {
            claim_id: instance.claim.id.clone(),
            pipeline_version: pipeline_version.to_string(),
            stages: StageBundle {
                sanitize: sanitize.clone(),
                embed: embed.clone(),
                search: search.clone(),
                verify: verify.clone(),
                detect: detect.clone(),
            },
            verdict,
            final_confidence: verify.snapshot.weighted_confidence,
            trust_score: detect.trust_score,
            reviewer: decision.clone(),
            timestamp,
            duration_ms,
            previous_hash: tip.hash.clone(),
            proof_hash: String::new(),
        };
        let proof_hash = bundle.seal_hash().map_err(|e| StageError::Fatal {
            stage: Stage::Sign,
            message: e.to_string(),
        })?;

        let record = ProofRecord {
            proof_id: uuid::Uuid::new_v4().to_string(),
            claim_id: instance.claim.id.clone(),
            instance_id: instance.instance_id.clone(),
            domain: domain.clone(),
            bundle,
            signature: signer.sign_hash(&proof_hash),
            created_at: Utc::now(),
        };

        match evidence.append(&record, &tip.hash) {
            Ok(()) => return Ok(record),
            Err(EvidenceError::TipConflict { .. }) if attempt < cas_retry_limit => {
                attempt += 1;
                debug!(
                    domain = %domain,
                    attempt,
                    "chain tip raced, re-linking"
                );
                tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
            }
            Err(EvidenceError::TipConflict { .. }) => {
                return Err(StageError::Transient {
                    stage: Stage::Sign,
                    message: format!("chain tip contention exceeded {cas_retry_limit} retries"),
                });
            }
            Err(error) => return Err(map_evidence(error)),
        }
    }
}

fn map_evidence(error: EvidenceError) -> StageError {
    StageError::Transient {
        stage: Stage::Sign,
        message: error.to_string(),
    }
}
