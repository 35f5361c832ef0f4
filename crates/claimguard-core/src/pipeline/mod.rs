//! Durable verification pipeline.
//!
//! A [`PipelineInstance`] drives one claim through the fixed stage sequence
//! sanitize → embed → search → verify → detect → sign. Every stage persists
//! its output into the instance checkpoint atomically with its
//! stage-complete audit event, so any failure is recoverable and no stage
//! runs twice. Stages never move backward; terminal states are
//! completed, failed, and cancelled.

pub mod backoff;
mod orchestrator;
pub mod stages;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::claim::Claim;
use crate::consensus::ConsensusSnapshot;

pub use orchestrator::{Dependencies, PipelineError, PipelineOrchestrator, RunOutcome};

/// Ordered pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Redact personal information from the claim body and evidence.
    Sanitize,
    /// Produce embedding vectors and the claim-evidence similarity.
    Embed,
    /// Find similar prior claims in the vector index.
    Search,
    /// Collect model opinions and compute consensus.
    Verify,
    /// Derive trust flags and the halt-required signal.
    Detect,
    /// Compose, hash, chain, and persist the proof record.
    Sign,
}

impl Stage {
    /// All stages in execution order.
    pub const ORDER: [Self; 6] = [
        Self::Sanitize,
        Self::Embed,
        Self::Search,
        Self::Verify,
        Self::Detect,
        Self::Sign,
    ];

    /// Stable string tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sanitize => "sanitize",
            Self::Embed => "embed",
            Self::Search => "search",
            Self::Verify => "verify",
            Self::Detect => "detect",
            Self::Sign => "sign",
        }
    }

    /// The stage after this one, if any.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        let index = Self::ORDER.iter().position(|s| *s == self)?;
        Self::ORDER.get(index + 1).copied()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by a stage execution.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StageError {
    /// A dependency failed in a way worth retrying.
    #[error("transient failure in {stage}: {message}")]
    Transient {
        /// The failing stage.
        stage: Stage,
        /// Failure description.
        message: String,
    },

    /// A precondition or validation failed; retrying cannot help.
    #[error("fatal failure in {stage}: {message}")]
    Fatal {
        /// The failing stage.
        stage: Stage,
        /// Failure description.
        message: String,
    },

    /// The stage attempt exceeded its wall-clock budget.
    #[error("{stage} timed out after {seconds}s")]
    Timeout {
        /// The failing stage.
        stage: Stage,
        /// Configured budget in seconds.
        seconds: u64,
    },
}

impl StageError {
    /// Whether the retry policy applies to this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    /// The stage this error originated from.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        match self {
            Self::Transient { stage, .. }
            | Self::Fatal { stage, .. }
            | Self::Timeout { stage, .. } => *stage,
        }
    }
}

/// Pipeline instance lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Stages are executing.
    Running,
    /// Suspended in the HITL gate.
    AwaitingReview,
    /// All stages completed; a proof exists.
    Completed,
    /// A stage exhausted its retries or hit a fatal error.
    Failed,
    /// The caller cancelled the run.
    Cancelled,
}

impl PipelineStatus {
    /// Whether the instance can make further progress.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Stable string tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::AwaitingReview => "awaiting_review",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Output of the Sanitize stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizeOutput {
    /// Claim body with personal information redacted.
    pub redacted_text: String,

    /// Evidence fragments with personal information redacted.
    pub redacted_evidence: Vec<String>,

    /// Detected personal-information category tags, sorted.
    pub categories: Vec<String>,
}

/// Output of the Embed stage.
///
/// The vectors themselves live in the vector index; the checkpoint keeps
/// only what later stages and the proof bundle need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedOutput {
    /// Embedding dimension used.
    pub dimension: usize,

    /// Cosine similarity between the claim vector and the evidence vector.
    ///
    /// 1.0 when the claim carries no evidence, so the downstream
    /// low-similarity flag cannot fire spuriously.
    pub claim_evidence_similarity: f64,

    /// Whether an evidence vector was produced at all.
    pub has_evidence: bool,
}

/// One similar prior claim found by Search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarClaim {
    /// The prior claim's id.
    pub claim_id: String,

    /// Cosine score against the current claim vector.
    pub score: f64,
}

/// Output of the Search stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutput {
    /// Similar prior claims above the score floor, best first.
    pub similar: Vec<SimilarClaim>,
}

/// Output of the Verify stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyOutput {
    /// Final consensus snapshot after all opinions were collected.
    pub snapshot: ConsensusSnapshot,

    /// Models that were queried, in request order.
    pub models_queried: Vec<String>,
}

/// Trust flags the Detect stage may raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustFlag {
    /// Confidence stddev exceeded the Variance Halt bound.
    HighVariance,
    /// The BFT quorum was not reached.
    NoQuorum,
    /// Weighted confidence fell below 0.5.
    LowConfidence,
    /// Confidence stddev exceeded the hard 0.30 bound.
    ExtremeVariance,
    /// Claim and evidence embeddings diverged.
    EvidenceMismatch,
}

/// Output of the Detect stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectOutput {
    /// Raised flags, in declaration order.
    pub flags: Vec<TrustFlag>,

    /// Trust score: `max(0, 1 - 0.2 * flags)`.
    pub trust_score: f64,

    /// Whether the pipeline must emit a halt proof.
    pub halt_required: bool,

    /// Assessed risk level used for HITL routing.
    pub risk: RiskLevel,
}

/// Risk bands used for HITL routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Nothing flagged.
    Low,
    /// A single flag raised.
    Medium,
    /// Multiple flags raised or the quorum deferred to review.
    High,
    /// A halt is required.
    Critical,
}

impl RiskLevel {
    /// Stable string tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Outcome of a human (or synthetic) review decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewOutcome {
    /// The reviewer approved proceeding.
    Approved,
    /// The reviewer rejected the claim.
    Rejected,
    /// The ticket deadline passed without a decision.
    Expired,
}

/// A review decision recorded into the proof bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDecision {
    /// The decision outcome.
    pub outcome: ReviewOutcome,

    /// Reviewer identity; `"auto"` for synthetic decisions.
    pub reviewer: String,

    /// Free-text reason.
    pub reason: String,

    /// Whether the decision was produced without a human.
    pub auto: bool,

    /// When the decision was made.
    pub decided_at: DateTime<Utc>,
}

impl ReviewDecision {
    /// The synthetic decision for low-risk claims that bypass the gate.
    #[must_use]
    pub fn auto_approved() -> Self {
        Self {
            outcome: ReviewOutcome::Approved,
            reviewer: "auto".to_string(),
            reason: "low risk auto-approval".to_string(),
            auto: true,
            decided_at: Utc::now(),
        }
    }

    /// The synthetic rejection delivered when a ticket expires.
    #[must_use]
    pub fn expired() -> Self {
        Self {
            outcome: ReviewOutcome::Expired,
            reviewer: "auto".to_string(),
            reason: "review deadline expired".to_string(),
            auto: true,
            decided_at: Utc::now(),
        }
    }
}

/// One entry in the instance's monotonic stage log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLogEntry {
    /// The completed stage.
    pub stage: Stage,

    /// Attempts consumed (1 = first try succeeded).
    pub attempts: u32,

    /// Completion timestamp.
    pub completed_at: DateTime<Utc>,
}

/// Durable checkpoint for one pipeline instance.
///
/// The checkpoint plus the HITL ticket are the entire suspended state of an
/// instance; resumption loads this record and continues from
/// `current_stage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineInstance {
    /// Unique instance id.
    pub instance_id: String,

    /// The claim under verification.
    pub claim: Claim,

    /// Lifecycle state.
    pub status: PipelineStatus,

    /// The next stage to execute (or the stage that failed).
    pub current_stage: Stage,

    /// Monotonic log of completed stages.
    pub stage_log: Vec<StageLogEntry>,

    /// Last error message per failed attempt, if any.
    pub last_error: Option<String>,

    /// Sanitize output, once durable.
    pub sanitize: Option<SanitizeOutput>,

    /// Embed output, once durable.
    pub embed: Option<EmbedOutput>,

    /// Search output, once durable.
    pub search: Option<SearchOutput>,

    /// Verify output, once durable.
    pub verify: Option<VerifyOutput>,

    /// Detect output, once durable.
    pub detect: Option<DetectOutput>,

    /// The review decision feeding Sign, once known.
    pub decision: Option<ReviewDecision>,

    /// Open HITL ticket id while suspended.
    pub ticket_id: Option<String>,

    /// Proof id once Sign completed.
    pub proof_id: Option<String>,

    /// Run start timestamp.
    pub started_at: DateTime<Utc>,

    /// Last checkpoint timestamp.
    pub updated_at: DateTime<Utc>,
}

impl PipelineInstance {
    /// Creates a fresh instance for a claim.
    #[must_use]
    pub fn new(claim: Claim) -> Self {
        let now = Utc::now();
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            claim,
            status: PipelineStatus::Running,
            current_stage: Stage::Sanitize,
            stage_log: Vec::new(),
            last_error: None,
            sanitize: None,
            embed: None,
            search: None,
            verify: None,
            detect: None,
            decision: None,
            ticket_id: None,
            proof_id: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Whether a stage's output is already durable.
    #[must_use]
    pub fn stage_completed(&self, stage: Stage) -> bool {
        self.stage_log.iter().any(|entry| entry.stage == stage)
    }

    /// Records a stage completion in the monotonic log.
    pub fn log_completion(&mut self, stage: Stage, attempts: u32) {
        self.stage_log.push(StageLogEntry {
            stage,
            attempts,
            completed_at: Utc::now(),
        });
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_total() {
        let mut previous: Option<Stage> = None;
        for stage in Stage::ORDER {
            if let Some(p) = previous {
                assert!(p < stage, "{p} must precede {stage}");
                assert_eq!(p.next(), Some(stage));
            }
            previous = Some(stage);
        }
        assert_eq!(Stage::Sign.next(), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(PipelineStatus::Completed.is_terminal());
        assert!(PipelineStatus::Failed.is_terminal());
        assert!(PipelineStatus::Cancelled.is_terminal());
        assert!(!PipelineStatus::Running.is_terminal());
        assert!(!PipelineStatus::AwaitingReview.is_terminal());
    }

    #[test]
    fn test_stage_log_tracks_completion() {
        let mut instance = PipelineInstance::new(Claim::new("c1", "text"));
        assert!(!instance.stage_completed(Stage::Sanitize));
        instance.log_completion(Stage::Sanitize, 2);
        assert!(instance.stage_completed(Stage::Sanitize));
        assert_eq!(instance.stage_log[0].attempts, 2);
    }

    #[test]
    fn test_retryable_classification() {
        let transient = StageError::Transient {
            stage: Stage::Embed,
            message: "index 503".to_string(),
        };
        let fatal = StageError::Fatal {
            stage: Stage::Embed,
            message: "bad dimension".to_string(),
        };
        assert!(transient.is_retryable());
        assert!(!fatal.is_retryable());
        assert_eq!(transient.stage(), Stage::Embed);
    }
}
