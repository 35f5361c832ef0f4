//! Shield Consensus Engine.
//!
//! For a single voting session this module accepts weighted opinions from
//! independent verifier models, computes a Byzantine-tolerant quorum verdict,
//! and emits deterministic halt signals:
//!
//! - **BFT quorum**: the winning verdict's weight share must strictly exceed
//!   the 2/3 supermajority bound with at least three valid votes
//! - **Variance Halt**: refusal when the standard deviation of vote
//!   confidences exceeds the configured bound
//! - **Constitutional Halt**: refusal when weighted-mean confidence falls
//!   below the per-domain threshold
//!
//! Halts are not errors. A session that halts still produces a final
//! snapshot whose verdict is [`FinalVerdict::Halt`]; the pipeline records a
//! halt proof explaining why the system declined.
//!
//! # Determinism
//!
//! The snapshot is a pure function of the session's current vote set (one
//! vote per model, later arrivals overwrite). Verdict ties break by
//! lexicographic tag order, and threshold comparisons apply a single fixed
//! epsilon so that halts win ties.

mod session;
mod snapshot;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use session::{ConsensusEngine, VotingSession};
pub use snapshot::{compute_snapshot, ConsensusSnapshot, SnapshotParams};

/// Fixed epsilon margin applied on the halt-favoring side of every
/// threshold comparison.
pub const EPSILON: f64 = 1e-9;

/// Errors returned by consensus operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConsensusError {
    /// A vote field violated its range or enum constraint.
    #[error("invalid vote from {model_id}: {reason}")]
    InvalidVote {
        /// Originating model id.
        model_id: String,
        /// Which constraint was violated.
        reason: String,
    },

    /// The session has been sealed and refuses new votes.
    #[error("session sealed: {session_id}")]
    SessionSealed {
        /// The sealed session id.
        session_id: String,
    },

    /// No session exists with the given id.
    #[error("session not found: {session_id}")]
    SessionNotFound {
        /// The missing session id.
        session_id: String,
    },
}

/// Closed set of verdicts a model may return for a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The claim is supported by the evidence.
    Verified,
    /// The claim is contradicted or unsupported.
    Unverified,
    /// The evidence does not suffice either way.
    InsufficientEvidence,
    /// The model defers to human review.
    NeedsReview,
    /// The model produced no parseable opinion.
    Error,
}

impl Verdict {
    /// Stable string tag, used for lexicographic tie-breaking.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Unverified => "unverified",
            Self::InsufficientEvidence => "insufficient_evidence",
            Self::NeedsReview => "needs_review",
            Self::Error => "error",
        }
    }

    /// Parses a verdict tag.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "verified" => Some(Self::Verified),
            "unverified" => Some(Self::Unverified),
            "insufficient_evidence" => Some(Self::InsufficientEvidence),
            "needs_review" => Some(Self::NeedsReview),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The verdict a completed pipeline reports: either a model verdict that
/// survived consensus, or a halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalVerdict {
    /// The claim is supported by the evidence.
    Verified,
    /// The claim is contradicted or unsupported.
    Unverified,
    /// The evidence does not suffice either way.
    InsufficientEvidence,
    /// The quorum defers to human review.
    NeedsReview,
    /// The system declined to answer.
    Halt,
}

impl FinalVerdict {
    /// Stable string tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Unverified => "unverified",
            Self::InsufficientEvidence => "insufficient_evidence",
            Self::NeedsReview => "needs_review",
            Self::Halt => "halt",
        }
    }

    /// Whether this is a halt verdict.
    #[must_use]
    pub const fn is_halt(self) -> bool {
        matches!(self, Self::Halt)
    }
}

impl From<Verdict> for FinalVerdict {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Verified => Self::Verified,
            Verdict::Unverified => Self::Unverified,
            Verdict::InsufficientEvidence => Self::InsufficientEvidence,
            // An error-verdict quorum cannot win (errors are excluded from
            // the valid set), but map it defensibly anyway.
            Verdict::NeedsReview | Verdict::Error => Self::NeedsReview,
        }
    }
}

impl std::fmt::Display for FinalVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One model's opinion on a claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    /// Originating model id.
    pub model_id: String,

    /// The model's verdict.
    pub verdict: Verdict,

    /// Confidence in the verdict, in [0, 1].
    pub confidence: f64,

    /// Internal coherence of the model's reasoning, in [0, 1].
    pub coherence: f64,

    /// Free-text reasoning (bounded length).
    pub reasoning: String,

    /// Vote weight; must be strictly positive.
    pub weight: f64,

    /// When the vote was received.
    pub received_at: DateTime<Utc>,
}

impl Vote {
    /// Creates a vote with the current timestamp and empty reasoning.
    #[must_use]
    pub fn new(
        model_id: impl Into<String>,
        verdict: Verdict,
        confidence: f64,
        coherence: f64,
        weight: f64,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            verdict,
            confidence,
            coherence,
            reasoning: String::new(),
            weight,
            received_at: Utc::now(),
        }
    }

    /// Attaches reasoning text (builder pattern).
    #[must_use]
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    /// Whether this vote participates in consensus math.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.verdict != Verdict::Error
    }

    /// Validates range and enum constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConsensusError::InvalidVote`] naming the violated
    /// constraint.
    pub fn validate(&self) -> Result<(), ConsensusError> {
        let fail = |reason: &str| ConsensusError::InvalidVote {
            model_id: self.model_id.clone(),
            reason: reason.to_string(),
        };

        if self.model_id.trim().is_empty() {
            return Err(fail("model id is empty"));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(fail("confidence out of [0, 1]"));
        }
        if !self.coherence.is_finite() || !(0.0..=1.0).contains(&self.coherence) {
            return Err(fail("coherence out of [0, 1]"));
        }
        if !self.weight.is_finite() || self.weight <= 0.0 {
            return Err(fail("weight must be positive"));
        }
        Ok(())
    }
}
