//! Detect stage: trust flags and the halt-required signal.
//!
//! A pure transformation over the consensus snapshot and upstream signals.
//! Each raised flag costs 0.2 trust; the halt-required signal fires on a
//! trust collapse, a Variance Halt, or three or more flags.

use crate::consensus::Verdict;
use crate::pipeline::{DetectOutput, EmbedOutput, RiskLevel, TrustFlag, VerifyOutput};

/// Hard upper bound on confidence stddev, independent of the configured
/// Variance Halt threshold.
const EXTREME_STD_DEV: f64 = 0.30;

/// Weighted-confidence floor below which a flag is raised.
const LOW_CONFIDENCE: f64 = 0.5;

/// Claim-evidence similarity floor below which a flag is raised.
const MIN_EVIDENCE_SIMILARITY: f64 = 0.4;

/// Trust score floor below which a halt is required.
const TRUST_HALT: f64 = 0.5;

/// Trust penalty per raised flag.
const FLAG_PENALTY: f64 = 0.2;

/// Runs the Detect stage.
#[must_use]
pub fn run(verify: &VerifyOutput, embed: &EmbedOutput) -> DetectOutput {
    let snapshot = &verify.snapshot;
    let mut flags = Vec::new();

    if snapshot.variance_halt {
        flags.push(TrustFlag::HighVariance);
    }
    if !snapshot.bft_reached {
        flags.push(TrustFlag::NoQuorum);
    }
    if snapshot.weighted_confidence < LOW_CONFIDENCE {
        flags.push(TrustFlag::LowConfidence);
    }
    if snapshot.confidence_std_dev > EXTREME_STD_DEV {
        flags.push(TrustFlag::ExtremeVariance);
    }
    if embed.claim_evidence_similarity < MIN_EVIDENCE_SIMILARITY {
        flags.push(TrustFlag::EvidenceMismatch);
    }

    let trust_score = (1.0 - FLAG_PENALTY * flags.len() as f64).max(0.0);
    let halt_required =
        trust_score < TRUST_HALT || snapshot.variance_halt || flags.len() >= 3;

    let risk = if halt_required {
        RiskLevel::Critical
    } else if flags.len() >= 2 || snapshot.majority_verdict == Some(Verdict::NeedsReview) {
        RiskLevel::High
    } else if flags.len() == 1 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    DetectOutput {
        flags,
        trust_score,
        halt_required,
        risk,
    }
}
