//! Pipeline orchestrator.
//!
//! Drives a [`PipelineInstance`] through the fixed stage sequence with
//! durable checkpointing, per-stage retry policies, and exactly-once stage
//! completion: a stage's output commits in one transaction with its
//! `stage_complete` audit event, and completed stages are skipped on
//! re-entry. Suspension for human review persists everything into the
//! ticket plus the checkpoint; [`PipelineOrchestrator::resume`] picks the
//! instance back up at Sign.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use super::stages;
use super::{
    PipelineInstance, PipelineStatus, ReviewDecision, RiskLevel, Stage, StageError,
};
use crate::cache::ArtifactCache;
use crate::claim::{Claim, ClaimError};
use crate::config::Config;
use crate::consensus::ConsensusEngine;
use crate::evidence::EvidenceStore;
use crate::gateway::ModelGateway;
use crate::hitl::{HitlError, HitlGate};
use crate::index::VectorIndex;
use crate::ledger::{AuditDb, AuditEvent, AuditEventKind, LedgerError};
use crate::proof::{ProofRecord, ProofSigner};
use crate::trust::TrustRegistry;

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    /// The submitted claim failed validation.
    #[error(transparent)]
    Claim(#[from] ClaimError),

    /// Checkpoint or audit storage failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The HITL gate failed.
    #[error(transparent)]
    Gate(#[from] HitlError),

    /// The instance is not in a state that allows the operation.
    #[error("instance {instance_id} is {}", .status.as_str())]
    InvalidState {
        /// The instance id.
        instance_id: String,
        /// Its current status.
        status: PipelineStatus,
    },

    /// A completed instance has no proof record (storage inconsistency).
    #[error("completed instance {instance_id} has no proof record")]
    MissingProof {
        /// The instance id.
        instance_id: String,
    },
}

/// What a drive pass produced.
#[derive(Debug)]
pub enum RunOutcome {
    /// All stages completed; the proof is written.
    Completed(Box<ProofRecord>),

    /// The instance suspended behind a review ticket.
    Suspended {
        /// The open ticket's id.
        ticket_id: String,
    },

    /// A stage failed terminally.
    Failed {
        /// The failing stage.
        stage: Stage,
        /// The terminal error.
        error: String,
    },

    /// The caller cancelled the run.
    Cancelled,
}

/// The dependency seams every stage runs against.
pub struct Dependencies {
    /// Platform configuration.
    pub config: Arc<Config>,

    /// Model inference gateway.
    pub gateway: Arc<dyn ModelGateway>,

    /// Vector index.
    pub index: Arc<dyn VectorIndex>,

    /// Evidence store.
    pub evidence: Arc<dyn EvidenceStore>,

    /// Audit ledger and checkpoint storage.
    pub db: AuditDb,

    /// Consensus engine.
    pub engine: Arc<ConsensusEngine>,

    /// Model trust registry.
    pub trust: Arc<TrustRegistry>,

    /// Artifact cache.
    pub cache: Arc<ArtifactCache>,

    /// HITL gate.
    pub gate: Arc<HitlGate>,

    /// Proof signer.
    pub signer: Arc<ProofSigner>,
}

/// Drives pipeline instances through the stage sequence.
pub struct PipelineOrchestrator {
    deps: Dependencies,
}

impl PipelineOrchestrator {
    /// Creates an orchestrator over the given dependencies.
    #[must_use]
    pub const fn new(deps: Dependencies) -> Self {
        Self { deps }
    }

    /// The orchestrator's configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.deps.config
    }

    /// Validates and registers a claim, returning the fresh instance.
    ///
    /// The caller then spawns [`run`](Self::run) for the instance.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Claim`] for invalid claims and
    /// [`PipelineError::Ledger`] if the checkpoint cannot be created.
    pub fn submit(&self, claim: Claim) -> Result<PipelineInstance, PipelineError> {
        claim.validate()?;
        let instance = PipelineInstance::new(claim);
        self.deps.db.save_instance(&instance)?;
        self.deps.db.append_event_best_effort(&AuditEvent::new(
            AuditEventKind::Submit,
            instance.claim.id.clone(),
            serde_json::json!({
                "instance_id": instance.instance_id,
                "domain": instance.claim.domain.map(|d| d.as_str()),
                "priority": instance.claim.priority,
            }),
        ));
        info!(
            claim_id = %instance.claim.id,
            instance_id = %instance.instance_id,
            "claim submitted"
        );
        Ok(instance)
    }

    /// Runs (or resumes after a crash) an instance until it completes,
    /// suspends, fails, or is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] on storage failures; stage failures are a
    /// [`RunOutcome::Failed`], not an error.
    pub async fn run(&self, instance_id: &str) -> Result<RunOutcome, PipelineError> {
        let mut instance = self.deps.db.load_instance(instance_id)?;
        match instance.status {
            PipelineStatus::Running => self.drive(&mut instance).await,
            PipelineStatus::AwaitingReview => {
                // Crash recovery: the ticket may have resolved while we
                // were down.
                if let Some(ticket) = self.deps.gate.find_by_instance(instance_id)? {
                    if let Some(decision) = ticket.decision() {
                        return self.resume(instance_id, decision).await;
                    }
                }
                Ok(RunOutcome::Suspended {
                    ticket_id: instance.ticket_id.clone().unwrap_or_default(),
                })
            }
            PipelineStatus::Completed => self.completed_outcome(&instance),
            PipelineStatus::Cancelled => Ok(RunOutcome::Cancelled),
            PipelineStatus::Failed => Ok(RunOutcome::Failed {
                stage: instance.current_stage,
                error: instance.last_error.clone().unwrap_or_default(),
            }),
        }
    }

    /// Delivers a review decision to a suspended instance and finishes the
    /// run.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidState`] unless the instance is
    /// awaiting review (delivering to a completed instance idempotently
    /// returns its outcome).
    pub async fn resume(
        &self,
        instance_id: &str,
        decision: ReviewDecision,
    ) -> Result<RunOutcome, PipelineError> {
        let mut instance = self.deps.db.load_instance(instance_id)?;
        match instance.status {
            PipelineStatus::AwaitingReview => {}
            PipelineStatus::Completed => return self.completed_outcome(&instance),
            status => {
                return Err(PipelineError::InvalidState {
                    instance_id: instance_id.to_string(),
                    status,
                })
            }
        }

        let kind = match decision.outcome {
            super::ReviewOutcome::Expired => AuditEventKind::HitlExpired,
            _ => AuditEventKind::HitlResolved,
        };
        self.deps.db.append_event_best_effort(&AuditEvent::new(
            kind,
            instance.claim.id.clone(),
            serde_json::json!({
                "instance_id": instance.instance_id,
                "ticket_id": instance.ticket_id,
                "outcome": decision.outcome,
                "reviewer": decision.reviewer,
            }),
        ));

        instance.decision = Some(decision);
        instance.status = PipelineStatus::Running;
        self.deps.db.save_instance(&instance)?;
        self.drive(&mut instance).await
    }

    /// Marks an instance cancelled. The running stage, if any, aborts at
    /// its next retry boundary.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidState`] for already-terminal
    /// instances.
    pub fn cancel(&self, instance_id: &str) -> Result<(), PipelineError> {
        let mut instance = self.deps.db.load_instance(instance_id)?;
        if instance.status.is_terminal() {
            return Err(PipelineError::InvalidState {
                instance_id: instance_id.to_string(),
                status: instance.status,
            });
        }
        instance.status = PipelineStatus::Cancelled;
        self.deps.db.save_instance(&instance)?;
        self.deps.db.append_event_best_effort(&AuditEvent::new(
            AuditEventKind::Cancelled,
            instance.claim.id.clone(),
            serde_json::json!({ "instance_id": instance_id }),
        ));
        Ok(())
    }

    fn completed_outcome(&self, instance: &PipelineInstance) -> Result<RunOutcome, PipelineError> {
        let record = self
            .deps
            .evidence
            .find_by_instance(&instance.instance_id)
            .map_err(|e| {
                warn!(error = %e, "evidence lookup failed for completed instance");
                PipelineError::MissingProof {
                    instance_id: instance.instance_id.clone(),
                }
            })?
            .ok_or_else(|| PipelineError::MissingProof {
                instance_id: instance.instance_id.clone(),
            })?;
        Ok(RunOutcome::Completed(Box::new(record)))
    }

    fn persisted_cancelled(&self, instance_id: &str) -> Result<bool, PipelineError> {
        Ok(self.deps.db.load_instance(instance_id)?.status == PipelineStatus::Cancelled)
    }

    async fn drive(&self, instance: &mut PipelineInstance) -> Result<RunOutcome, PipelineError> {
        for stage in Stage::ORDER {
            if instance.stage_completed(stage) {
                continue;
            }
            if self.persisted_cancelled(&instance.instance_id)? {
                instance.status = PipelineStatus::Cancelled;
                return Ok(RunOutcome::Cancelled);
            }
            instance.current_stage = stage;

            // The gate sits between Detect and Sign. Checking here (rather
            // than after Detect completes) keeps a crash between the two
            // from slipping past review.
            if stage == Stage::Sign {
                if let Some(outcome) = self.maybe_suspend(instance)? {
                    return Ok(outcome);
                }
            }

            let attempts = match self.execute_with_retry(instance, stage).await {
                Ok(attempts) => attempts,
                Err(error) => return self.fail_instance(instance, stage, &error),
            };

            // Cancellation between execution and persistence leaves the
            // stage un-checkpointed; cancelled is terminal anyway.
            if self.persisted_cancelled(&instance.instance_id)? {
                instance.status = PipelineStatus::Cancelled;
                return Ok(RunOutcome::Cancelled);
            }

            instance.log_completion(stage, attempts);
            if let Some(next) = stage.next() {
                instance.current_stage = next;
            }
            self.deps.db.complete_stage(instance, stage)?;

            match stage {
                Stage::Verify => self.after_verify(instance),
                Stage::Sign => return self.finish(instance),
                _ => {}
            }
        }

        // Every stage already checkpointed: finish from the recovery path.
        self.finish(instance)
    }

    async fn execute_with_retry(
        &self,
        instance: &mut PipelineInstance,
        stage: Stage,
    ) -> Result<u32, StageError> {
        let pipeline_config = &self.deps.config.pipeline;
        let max_attempts = pipeline_config.attempts_for(stage);
        let backoff = pipeline_config.backoff_for(stage);
        let budget = pipeline_config.timeout_for(stage);

        let mut attempt = 1u32;
        loop {
            self.deps.db.append_event_best_effort(&AuditEvent::new(
                AuditEventKind::StageStart,
                instance.claim.id.clone(),
                serde_json::json!({
                    "instance_id": instance.instance_id,
                    "stage": stage.as_str(),
                    "attempt": attempt,
                }),
            ));

            let result = match tokio::time::timeout(budget, self.execute_stage(instance, stage))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(StageError::Timeout {
                    stage,
                    seconds: budget.as_secs(),
                }),
            };

            match result {
                Ok(()) => return Ok(attempt),
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    warn!(
                        claim_id = %instance.claim.id,
                        stage = stage.as_str(),
                        attempt,
                        %error,
                        "stage attempt failed, backing off"
                    );
                    instance.last_error = Some(error.to_string());
                    tokio::time::sleep(backoff.delay_for_retry(attempt)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn execute_stage(
        &self,
        instance: &mut PipelineInstance,
        stage: Stage,
    ) -> Result<(), StageError> {
        match stage {
            Stage::Sanitize => {
                instance.sanitize = Some(stages::sanitize::run(&instance.claim)?);
            }
            Stage::Embed => {
                let sanitize = instance.sanitize.as_ref().ok_or(StageError::Fatal {
                    stage,
                    message: "sanitize output missing".to_string(),
                })?;
                instance.embed = Some(
                    stages::embed::run(
                        &instance.claim.id,
                        sanitize,
                        self.deps.gateway.as_ref(),
                        self.deps.index.as_ref(),
                        self.deps.config.models.embedding_dim,
                    )
                    .await?,
                );
            }
            Stage::Search => {
                instance.search = Some(
                    stages::search::run(
                        &instance.claim.id,
                        self.deps.index.as_ref(),
                        &self.deps.config.search,
                    )
                    .await?,
                );
            }
            Stage::Verify => {
                let sanitize = instance.sanitize.as_ref().ok_or(StageError::Fatal {
                    stage,
                    message: "sanitize output missing".to_string(),
                })?;
                let search = instance.search.as_ref().ok_or(StageError::Fatal {
                    stage,
                    message: "search output missing".to_string(),
                })?;
                instance.verify = Some(
                    stages::verify::run(
                        &instance.claim,
                        sanitize,
                        search,
                        &self.deps.engine,
                        Arc::clone(&self.deps.gateway),
                        &self.deps.trust,
                        &self.deps.config.models,
                    )
                    .await?,
                );
            }
            Stage::Detect => {
                let verify = instance.verify.as_ref().ok_or(StageError::Fatal {
                    stage,
                    message: "verify output missing".to_string(),
                })?;
                let embed = instance.embed.as_ref().ok_or(StageError::Fatal {
                    stage,
                    message: "embed output missing".to_string(),
                })?;
                instance.detect = Some(stages::detect::run(verify, embed));
            }
            Stage::Sign => {
                let decision = instance
                    .decision
                    .clone()
                    .unwrap_or_else(ReviewDecision::auto_approved);
                instance.decision = Some(decision.clone());
                let record = stages::sign::run(
                    instance,
                    &decision,
                    self.deps.evidence.as_ref(),
                    &self.deps.signer,
                    &self.deps.config.pipeline.version,
                    self.deps.config.pipeline.cas_retry_limit,
                )
                .await?;
                instance.proof_id = Some(record.proof_id);
            }
        }
        Ok(())
    }

    fn after_verify(&self, instance: &PipelineInstance) {
        let Some(verify) = instance.verify.as_ref() else {
            return;
        };
        self.deps.cache.put(
            ArtifactCache::snapshot_key(&instance.claim.id),
            &verify.snapshot,
        );
        if verify.snapshot.halted() || !verify.snapshot.bft_reached {
            self.deps.db.append_event_best_effort(&AuditEvent::new(
                AuditEventKind::HaltTriggered,
                instance.claim.id.clone(),
                serde_json::json!({
                    "instance_id": instance.instance_id,
                    "variance_halt": verify.snapshot.variance_halt,
                    "constitutional_halt": verify.snapshot.constitutional_halt,
                    "bft_reached": verify.snapshot.bft_reached,
                }),
            ));
        }
    }

    /// Opens a review ticket if the claim needs one. Halt-bound claims
    /// skip the gate: a human cannot change a deterministic halt, so
    /// delaying the halt proof buys nothing. Everything else gates on
    /// elevated risk, a Constitutional Halt, caller priority, or domain
    /// policy.
    fn maybe_suspend(
        &self,
        instance: &mut PipelineInstance,
    ) -> Result<Option<RunOutcome>, PipelineError> {
        if instance.decision.is_some() {
            return Ok(None);
        }
        let Some(detect) = instance.detect.as_ref() else {
            return Ok(None);
        };
        let Some(verify) = instance.verify.as_ref() else {
            return Ok(None);
        };

        let domain_mandates = instance
            .claim
            .domain
            .is_some_and(crate::claim::Domain::mandates_review);
        let needs_review = !detect.halt_required
            && (detect.risk >= RiskLevel::High
                || verify.snapshot.constitutional_halt
                || instance.claim.priority == crate::claim::Priority::High
                || domain_mandates);
        if !needs_review {
            instance.decision = Some(ReviewDecision::auto_approved());
            return Ok(None);
        }

        let risk_summary = format!(
            "risk={}; flags={}; constitutional_halt={}; priority={:?}",
            detect.risk.as_str(),
            detect.flags.len(),
            verify.snapshot.constitutional_halt,
            instance.claim.priority,
        );
        let deadline = Utc::now()
            + chrono::Duration::from_std(self.deps.config.hitl.deadline)
                .unwrap_or_else(|_| chrono::Duration::days(7));
        let ticket = self.deps.gate.open_ticket(
            &instance.claim.id,
            &instance.instance_id,
            &risk_summary,
            deadline,
        )?;

        self.deps.db.append_event_best_effort(&AuditEvent::new(
            AuditEventKind::HitlOpen,
            instance.claim.id.clone(),
            serde_json::json!({
                "instance_id": instance.instance_id,
                "ticket_id": ticket.ticket_id,
                "risk_summary": risk_summary,
            }),
        ));

        instance.ticket_id = Some(ticket.ticket_id.clone());
        instance.status = PipelineStatus::AwaitingReview;
        self.deps.db.save_instance(instance)?;
        info!(
            claim_id = %instance.claim.id,
            ticket_id = %ticket.ticket_id,
            "instance suspended for review"
        );
        Ok(Some(RunOutcome::Suspended {
            ticket_id: ticket.ticket_id,
        }))
    }

    fn finish(&self, instance: &mut PipelineInstance) -> Result<RunOutcome, PipelineError> {
        let record = self
            .deps
            .evidence
            .find_by_instance(&instance.instance_id)
            .ok()
            .flatten()
            .ok_or_else(|| PipelineError::MissingProof {
                instance_id: instance.instance_id.clone(),
            })?;

        // proof_signed is required-for-success: it must be durable before
        // the caller sees a completed instance.
        self.deps.db.append_event(&AuditEvent::new(
            AuditEventKind::ProofSigned,
            instance.claim.id.clone(),
            serde_json::json!({
                "instance_id": instance.instance_id,
                "proof_id": record.proof_id,
                "proof_hash": record.bundle.proof_hash,
                "verdict": record.bundle.verdict,
            }),
        ))?;

        instance.status = PipelineStatus::Completed;
        instance.proof_id = Some(record.proof_id.clone());
        self.deps.db.save_instance(instance)?;

        self.deps
            .cache
            .put(ArtifactCache::proof_key(&instance.claim.id), &record);

        info!(
            claim_id = %instance.claim.id,
            proof_id = %record.proof_id,
            verdict = record.bundle.verdict.as_str(),
            "proof signed"
        );
        Ok(RunOutcome::Completed(Box::new(record)))
    }

    fn fail_instance(
        &self,
        instance: &mut PipelineInstance,
        stage: Stage,
        error: &StageError,
    ) -> Result<RunOutcome, PipelineError> {
        instance.status = PipelineStatus::Failed;
        instance.last_error = Some(error.to_string());
        self.deps.db.save_instance(instance)?;
        self.deps.db.append_event_best_effort(&AuditEvent::new(
            AuditEventKind::StageFail,
            instance.claim.id.clone(),
            serde_json::json!({
                "instance_id": instance.instance_id,
                "stage": stage.as_str(),
                "error": error.to_string(),
            }),
        ));
        warn!(
            claim_id = %instance.claim.id,
            stage = stage.as_str(),
            %error,
            "instance failed"
        );
        Ok(RunOutcome::Failed {
            stage,
            error: error.to_string(),
        })
    }
}
