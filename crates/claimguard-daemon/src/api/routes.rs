//! API handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use claimguard_core::cache::ArtifactCache;
use claimguard_core::claim::{Claim, Domain, Priority};
use claimguard_core::consensus::{ConsensusSnapshot, Verdict, Vote};
use claimguard_core::evidence::EvidenceStore;
use claimguard_core::health::HealthReport;
use claimguard_core::pipeline::{
    PipelineInstance, PipelineStatus, RunOutcome, Stage, StageLogEntry,
};
use claimguard_core::proof::ProofRecord;

use super::auth::{authenticate, require_role};
use super::error::ApiError;
use crate::state::{AppState, Role};

/// Body of `POST /v1/claims`.
#[derive(Debug, Deserialize)]
pub struct SubmitClaimRequest {
    /// Caller-supplied claim id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,

    /// Claim body.
    pub text: String,

    /// Ordered evidence fragments.
    #[serde(default)]
    pub evidence: Vec<String>,

    /// Domain tag from the closed vertical set.
    #[serde(default)]
    pub domain: Option<String>,

    /// Processing priority (`low`, `normal`, `high`).
    #[serde(default)]
    pub priority: Option<String>,
}

/// Response of `POST /v1/claims`.
#[derive(Debug, Serialize)]
pub struct SubmitClaimResponse {
    /// The pipeline instance id to poll.
    pub instance_id: String,

    /// The claim id (echoed or generated).
    pub claim_id: String,

    /// Initial status.
    pub status: PipelineStatus,
}

/// Response of `GET /v1/claims/{id}`.
#[derive(Debug, Serialize)]
pub struct ClaimStatusResponse {
    /// The instance id.
    pub instance_id: String,

    /// The claim id.
    pub claim_id: String,

    /// Current lifecycle state.
    pub status: PipelineStatus,

    /// The stage the instance is at.
    pub current_stage: Stage,

    /// Completed stages with attempt counts.
    pub stage_log: Vec<StageLogEntry>,

    /// Open ticket id while suspended.
    pub ticket_id: Option<String>,

    /// Proof id once signed.
    pub proof_id: Option<String>,

    /// Last stage error, if any.
    pub last_error: Option<String>,

    /// Consensus snapshot, once Verify completed.
    pub snapshot: Option<ConsensusSnapshot>,
}

impl From<PipelineInstance> for ClaimStatusResponse {
    fn from(instance: PipelineInstance) -> Self {
        Self {
            instance_id: instance.instance_id,
            claim_id: instance.claim.id,
            status: instance.status,
            current_stage: instance.current_stage,
            stage_log: instance.stage_log,
            ticket_id: instance.ticket_id,
            proof_id: instance.proof_id,
            last_error: instance.last_error,
            snapshot: instance.verify.map(|v| v.snapshot),
        }
    }
}

/// Body of the approve/reject endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ReviewRequest {
    /// Reviewer-supplied reason.
    #[serde(default)]
    pub reason: String,
}

/// Response of the approve/reject endpoints.
#[derive(Debug, Serialize)]
pub struct ReviewResponse {
    /// The resolved ticket id.
    pub ticket_id: String,

    /// The ticket's new status.
    pub status: claimguard_core::hitl::TicketStatus,
}

/// Body of `POST /v1/consensus/{session}/vote`.
#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    /// Voting model id; defaults to the key's identity.
    #[serde(default)]
    pub model_id: Option<String>,

    /// Verdict tag.
    pub verdict: String,

    /// Confidence in [0, 1].
    pub confidence: f64,

    /// Coherence in [0, 1].
    pub coherence: f64,

    /// Reasoning text.
    #[serde(default)]
    pub reasoning: String,

    /// Vote weight; defaults to 1.0.
    #[serde(default)]
    pub weight: Option<f64>,
}

fn load_instance(state: &AppState, id: &str) -> Result<PipelineInstance, ApiError> {
    // Accept either an instance id or a claim id.
    match state.db.load_instance(id) {
        Ok(instance) => Ok(instance),
        Err(_) => state
            .db
            .find_instance_by_claim(id)?
            .ok_or_else(|| ApiError::NotFound(format!("no instance for {id}"))),
    }
}

/// `POST /v1/claims`
pub async fn submit_claim(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SubmitClaimRequest>,
) -> Result<(StatusCode, Json<SubmitClaimResponse>), ApiError> {
    let principal = require_role(&state, &headers, Role::Submitter)?;
    state.quota.check_claim(&principal.key_id, principal.tier)?;

    let domain = body
        .domain
        .as_deref()
        .map(|tag| {
            Domain::parse(tag).ok_or_else(|| ApiError::InvalidInput(format!("unknown domain: {tag}")))
        })
        .transpose()?;
    let priority = match body.priority.as_deref() {
        None => Priority::Normal,
        Some("low") => Priority::Low,
        Some("normal") => Priority::Normal,
        Some("high") => Priority::High,
        Some(other) => {
            return Err(ApiError::InvalidInput(format!("unknown priority: {other}")))
        }
    };

    let mut claim = Claim::new(
        body.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        body.text,
    )
    .with_evidence(body.evidence)
    .with_priority(priority);
    claim.domain = domain;
    claim.submitter = Some(principal.key_id);

    let instance = state.orchestrator.submit(claim)?;
    state.metrics.claims_submitted.inc();

    let response = SubmitClaimResponse {
        instance_id: instance.instance_id.clone(),
        claim_id: instance.claim.id.clone(),
        status: instance.status,
    };

    let run_state = Arc::clone(&state);
    let instance_id = instance.instance_id;
    tokio::spawn(async move {
        run_state.metrics.pipelines_inflight.inc();
        let outcome = run_state.orchestrator.run(&instance_id).await;
        run_state.metrics.pipelines_inflight.dec();
        match outcome {
            Ok(RunOutcome::Completed(record)) => {
                run_state
                    .metrics
                    .proofs_signed
                    .with_label_values(&[record.bundle.verdict.as_str()])
                    .inc();
                if record.is_halt_proof() {
                    run_state.metrics.halt_proofs.inc();
                }
            }
            Ok(RunOutcome::Suspended { .. }) => {
                run_state.metrics.tickets_opened.inc();
            }
            Ok(RunOutcome::Failed { stage, .. }) => {
                run_state
                    .metrics
                    .runs_failed
                    .with_label_values(&[stage.as_str()])
                    .inc();
            }
            Ok(RunOutcome::Cancelled) => {}
            Err(err) => error!(instance_id = %instance_id, error = %err, "pipeline run errored"),
        }
    });

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// `GET /v1/claims/{id}`
pub async fn claim_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ClaimStatusResponse>, ApiError> {
    authenticate(&state, &headers)?;
    let instance = load_instance(&state, &id)?;
    Ok(Json(instance.into()))
}

/// `POST /v1/claims/{id}/approve`
pub async fn approve_claim(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<ReviewRequest>>,
) -> Result<Json<ReviewResponse>, ApiError> {
    resolve_review(&state, &headers, &id, body.map(|b| b.0), true)
}

/// `POST /v1/claims/{id}/reject`
pub async fn reject_claim(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<ReviewRequest>>,
) -> Result<Json<ReviewResponse>, ApiError> {
    resolve_review(&state, &headers, &id, body.map(|b| b.0), false)
}

fn resolve_review(
    state: &AppState,
    headers: &HeaderMap,
    id: &str,
    body: Option<ReviewRequest>,
    approved: bool,
) -> Result<Json<ReviewResponse>, ApiError> {
    let principal = require_role(state, headers, Role::Reviewer)?;
    let instance = load_instance(state, id)?;
    let ticket_id = instance
        .ticket_id
        .ok_or_else(|| ApiError::NotFound(format!("no review ticket for {id}")))?;

    let reason = body.map(|b| b.reason).unwrap_or_default();
    let ticket = state
        .gate
        .resolve(&ticket_id, approved, &principal.key_id, &reason)?;
    Ok(Json(ReviewResponse {
        ticket_id: ticket.ticket_id,
        status: ticket.status,
    }))
}

/// `GET /v1/claims/{id}/proof`
pub async fn claim_proof(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ProofRecord>, ApiError> {
    authenticate(&state, &headers)?;

    if let Some(record) = state.cache.get::<ProofRecord>(&ArtifactCache::proof_key(&id)) {
        return Ok(Json(record));
    }

    let record = match state.evidence.find_by_claim(&id)? {
        Some(record) => record,
        None => {
            // The id may be an instance id.
            state
                .evidence
                .find_by_instance(&id)?
                .ok_or_else(|| ApiError::NotFound(format!("no proof for {id}")))?
        }
    };
    state
        .cache
        .put(ArtifactCache::proof_key(&record.claim_id), &record);
    Ok(Json(record))
}

/// `POST /v1/consensus/{session}/vote`
pub async fn submit_vote(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session): Path<String>,
    Json(body): Json<VoteRequest>,
) -> Result<Json<ConsensusSnapshot>, ApiError> {
    let principal = require_role(&state, &headers, Role::Model)?;

    let verdict = Verdict::parse(&body.verdict)
        .ok_or_else(|| ApiError::InvalidInput(format!("unknown verdict: {}", body.verdict)))?;
    let vote = Vote::new(
        body.model_id.unwrap_or(principal.key_id),
        verdict,
        body.confidence,
        body.coherence,
        body.weight.unwrap_or(1.0),
    )
    .with_reasoning(body.reasoning);

    let snapshot = state.engine.submit_vote(&session, vote)?;
    state
        .cache
        .put(ArtifactCache::snapshot_key(&session), &snapshot);
    Ok(Json(snapshot))
}

/// `GET /v1/consensus/{session}`
pub async fn consensus_snapshot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session): Path<String>,
) -> Result<Json<ConsensusSnapshot>, ApiError> {
    authenticate(&state, &headers)?;

    if let Some(snapshot) = state
        .cache
        .get::<ConsensusSnapshot>(&ArtifactCache::snapshot_key(&session))
    {
        return Ok(Json(snapshot));
    }
    Ok(Json(state.engine.snapshot(&session)?))
}

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    Json(state.health.report())
}

/// `GET /metrics`
pub async fn metrics(State(state): State<Arc<AppState>>) -> Result<String, ApiError> {
    state
        .metrics
        .encode_text()
        .map_err(|e| ApiError::Internal(e.to_string()))
}
