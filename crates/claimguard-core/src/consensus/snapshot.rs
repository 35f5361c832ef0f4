//! Consensus snapshot computation.
//!
//! [`compute_snapshot`] is a pure function from the session's current vote
//! set to a [`ConsensusSnapshot`]; it is recomputed on every vote arrival
//! and cached on the session.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{FinalVerdict, Verdict, Vote, EPSILON};

/// Thresholds the snapshot computation depends on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SnapshotParams {
    /// Variance Halt threshold on the confidence stddev.
    pub sigma_var: f64,

    /// Minimum valid votes before a quorum can exist.
    pub min_votes: usize,

    /// Constitutional Halt threshold on the weighted-mean confidence.
    pub halt_threshold: f64,
}

impl Default for SnapshotParams {
    fn default() -> Self {
        Self {
            sigma_var: 0.25,
            min_votes: 3,
            halt_threshold: 0.70,
        }
    }
}

/// Derived consensus state for a voting session.
///
/// Reflects exactly the vote set it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusSnapshot {
    /// Weight-max verdict among valid votes, if any valid vote exists.
    pub majority_verdict: Option<Verdict>,

    /// Weighted-mean confidence over valid votes.
    pub weighted_confidence: f64,

    /// Standard deviation of the unweighted confidences of valid votes.
    ///
    /// Weighted confidence drives the Constitutional Halt while the
    /// deviation here stays unweighted; both sides of that asymmetry are
    /// load-bearing and pinned by tests.
    pub confidence_std_dev: f64,

    /// Winning verdict weight divided by total valid weight.
    pub agreement_ratio: f64,

    /// Whether the BFT supermajority bound was met with enough votes.
    pub bft_reached: bool,

    /// Whether the Variance Halt fired.
    pub variance_halt: bool,

    /// Whether the Constitutional Halt fired.
    pub constitutional_halt: bool,

    /// Fewer valid votes than the quorum minimum.
    pub no_quorum: bool,

    /// The verdict the session reports.
    pub final_verdict: FinalVerdict,

    /// Number of valid (non-error) votes observed.
    pub valid_votes: usize,

    /// Number of error votes recorded but excluded from the math.
    pub error_votes: usize,

    /// Total weight of valid votes.
    pub total_weight: f64,

    /// When this snapshot was computed.
    pub computed_at: DateTime<Utc>,
}

impl ConsensusSnapshot {
    /// Snapshot for a session with no votes yet.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            majority_verdict: None,
            weighted_confidence: 0.0,
            confidence_std_dev: 0.0,
            agreement_ratio: 0.0,
            bft_reached: false,
            variance_halt: false,
            constitutional_halt: false,
            no_quorum: true,
            final_verdict: FinalVerdict::Halt,
            valid_votes: 0,
            error_votes: 0,
            total_weight: 0.0,
            computed_at: Utc::now(),
        }
    }

    /// Whether either halt flag is set.
    #[must_use]
    pub const fn halted(&self) -> bool {
        self.variance_halt || self.constitutional_halt
    }
}

/// BFT supermajority bound for `n` valid votes: `(2n + 2) / (3n)`.
///
/// Strictly above 2/3 for every finite `n`, which is what makes an exact
/// two-thirds split fail the quorum.
#[must_use]
pub fn bft_threshold(valid_votes: usize) -> f64 {
    if valid_votes == 0 {
        return f64::INFINITY;
    }
    let n = valid_votes as f64;
    (2.0 * n + 2.0) / (3.0 * n)
}

/// Computes the consensus snapshot for the given vote set.
///
/// Votes with verdict `error` are counted but excluded from all weighted
/// and statistical quantities. Verdict ties break toward the
/// lexicographically smallest tag. Threshold comparisons resolve toward
/// halting within [`EPSILON`].
#[must_use]
pub fn compute_snapshot(votes: &BTreeMap<String, Vote>, params: &SnapshotParams) -> ConsensusSnapshot {
    let valid: Vec<&Vote> = votes.values().filter(|v| v.is_valid()).collect();
    let error_votes = votes.len() - valid.len();

    if valid.is_empty() {
        let mut snapshot = ConsensusSnapshot::empty();
        snapshot.error_votes = error_votes;
        return snapshot;
    }

    let total_weight: f64 = valid.iter().map(|v| v.weight).sum();

    // Weight per verdict tag; BTreeMap iteration order gives the
    // lexicographic tie-break for free.
    let mut verdict_weights: BTreeMap<&'static str, f64> = BTreeMap::new();
    for vote in &valid {
        *verdict_weights.entry(vote.verdict.as_str()).or_insert(0.0) += vote.weight;
    }
    let (winning_tag, winning_weight) = verdict_weights.iter().map(|(tag, w)| (*tag, *w)).fold(
        ("", f64::NEG_INFINITY),
        |(best_tag, best_w), (tag, w)| {
            if w > best_w {
                (tag, w)
            } else {
                (best_tag, best_w)
            }
        },
    );
    let majority_verdict = Verdict::parse(winning_tag);

    let agreement_ratio = winning_weight / total_weight;
    let weighted_confidence = valid
        .iter()
        .map(|v| v.weight * v.confidence)
        .sum::<f64>()
        / total_weight;

    // Unweighted population stddev; defined as 0 for a single vote.
    let confidence_std_dev = if valid.len() <= 1 {
        0.0
    } else {
        let n = valid.len() as f64;
        let mean = valid.iter().map(|v| v.confidence).sum::<f64>() / n;
        let variance = valid
            .iter()
            .map(|v| {
                let d = v.confidence - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        variance.sqrt()
    };

    let no_quorum = valid.len() < params.min_votes;
    let bft_reached =
        !no_quorum && agreement_ratio + EPSILON >= bft_threshold(valid.len());

    // Halts win ties: equality at either threshold triggers the halt.
    let variance_halt = confidence_std_dev > params.sigma_var - EPSILON;
    let constitutional_halt = weighted_confidence < params.halt_threshold + EPSILON;

    let final_verdict = if variance_halt || constitutional_halt || !bft_reached {
        FinalVerdict::Halt
    } else {
        majority_verdict.map_or(FinalVerdict::Halt, FinalVerdict::from)
    };

    ConsensusSnapshot {
        majority_verdict,
        weighted_confidence,
        confidence_std_dev,
        agreement_ratio,
        bft_reached,
        variance_halt,
        constitutional_halt,
        no_quorum,
        final_verdict,
        valid_votes: valid.len(),
        error_votes,
        total_weight,
        computed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(model: &str, verdict: Verdict, confidence: f64, weight: f64) -> Vote {
        Vote::new(model, verdict, confidence, 0.85, weight)
    }

    fn vote_set(votes: Vec<Vote>) -> BTreeMap<String, Vote> {
        votes
            .into_iter()
            .map(|v| (v.model_id.clone(), v))
            .collect()
    }

    fn params(halt_threshold: f64) -> SnapshotParams {
        SnapshotParams {
            sigma_var: 0.25,
            min_votes: 3,
            halt_threshold,
        }
    }

    #[test]
    fn test_clean_unanimous_quorum() {
        // Three verified votes with mixed weights: BFT reached, no halt.
        let votes = vote_set(vec![
            vote("m1", Verdict::Verified, 0.90, 1.0),
            vote("m2", Verdict::Verified, 0.88, 1.2),
            vote("m3", Verdict::Verified, 0.86, 1.0),
        ]);
        let snapshot = compute_snapshot(&votes, &params(0.67));

        assert_eq!(snapshot.majority_verdict, Some(Verdict::Verified));
        assert!((snapshot.agreement_ratio - 1.0).abs() < 1e-12);
        assert!((snapshot.weighted_confidence - 0.88).abs() < 0.005);
        assert!(snapshot.confidence_std_dev < 0.02);
        assert!(snapshot.bft_reached);
        assert!(!snapshot.variance_halt);
        assert!(!snapshot.constitutional_halt);
        assert_eq!(snapshot.final_verdict, FinalVerdict::Verified);
    }

    #[test]
    fn test_variance_halt_on_wide_disagreement() {
        let votes = vote_set(vec![
            vote("m1", Verdict::Verified, 0.95, 1.0),
            vote("m2", Verdict::Unverified, 0.30, 1.0),
            vote("m3", Verdict::Verified, 0.85, 1.0),
        ]);
        let snapshot = compute_snapshot(&votes, &params(0.67));

        assert!(snapshot.confidence_std_dev > 0.25);
        assert!((snapshot.confidence_std_dev - 0.287).abs() < 0.005);
        assert!(snapshot.variance_halt);
        assert_eq!(snapshot.final_verdict, FinalVerdict::Halt);
    }

    #[test]
    fn test_constitutional_halt_below_domain_threshold() {
        // All verified, tight agreement, but confidence below a health-grade
        // threshold.
        let votes = vote_set(vec![
            vote("m1", Verdict::Verified, 0.74, 1.0),
            vote("m2", Verdict::Verified, 0.71, 1.0),
            vote("m3", Verdict::Verified, 0.71, 1.0),
        ]);
        let snapshot = compute_snapshot(&votes, &params(0.80));

        assert!(snapshot.bft_reached);
        assert!(!snapshot.variance_halt);
        assert!(snapshot.constitutional_halt);
        assert_eq!(snapshot.final_verdict, FinalVerdict::Halt);
    }

    #[test]
    fn test_two_thirds_exactly_is_not_quorum() {
        // 2 of 3 equal-weight votes agree: alpha = 2/3 which must NOT reach
        // the supermajority bound.
        let votes = vote_set(vec![
            vote("m1", Verdict::Verified, 0.9, 1.0),
            vote("m2", Verdict::Verified, 0.9, 1.0),
            vote("m3", Verdict::Unverified, 0.9, 1.0),
        ]);
        let snapshot = compute_snapshot(&votes, &params(0.5));
        assert!(!snapshot.bft_reached);
        assert_eq!(snapshot.final_verdict, FinalVerdict::Halt);
    }

    #[test]
    fn test_sigma_exactly_at_bound_halts() {
        // {0.5, 1.0} has population stddev of exactly 0.25.
        let votes = vote_set(vec![
            vote("m1", Verdict::Verified, 0.50, 1.0),
            vote("m2", Verdict::Verified, 1.00, 1.0),
        ]);
        let snapshot = compute_snapshot(&votes, &params(0.1));
        assert!((snapshot.confidence_std_dev - 0.25).abs() < 1e-12);
        assert!(snapshot.variance_halt, "halts win ties at sigma == sigma_var");
    }

    #[test]
    fn test_confidence_exactly_at_threshold_halts() {
        let votes = vote_set(vec![
            vote("m1", Verdict::Verified, 0.80, 1.0),
            vote("m2", Verdict::Verified, 0.80, 1.0),
            vote("m3", Verdict::Verified, 0.80, 1.0),
        ]);
        let snapshot = compute_snapshot(&votes, &params(0.80));
        assert!(
            snapshot.constitutional_halt,
            "halts win ties at c-bar == theta"
        );
        assert_eq!(snapshot.final_verdict, FinalVerdict::Halt);
    }

    #[test]
    fn test_all_full_confidence_never_variance_halts() {
        let votes = vote_set(vec![
            vote("m1", Verdict::Verified, 1.0, 1.0),
            vote("m2", Verdict::Verified, 1.0, 2.0),
            vote("m3", Verdict::Verified, 1.0, 0.5),
            vote("m4", Verdict::Verified, 1.0, 1.3),
        ]);
        let snapshot = compute_snapshot(&votes, &params(0.67));
        assert_eq!(snapshot.confidence_std_dev, 0.0);
        assert!(!snapshot.variance_halt);
    }

    #[test]
    fn test_below_minimum_votes_is_no_quorum() {
        let votes = vote_set(vec![
            vote("m1", Verdict::Verified, 0.9, 1.0),
            vote("m2", Verdict::Verified, 0.9, 1.0),
        ]);
        let snapshot = compute_snapshot(&votes, &params(0.5));
        assert!(snapshot.no_quorum);
        assert!(!snapshot.bft_reached);
    }

    #[test]
    fn test_error_votes_excluded_from_math() {
        let votes = vote_set(vec![
            vote("m1", Verdict::Verified, 0.9, 1.0),
            vote("m2", Verdict::Verified, 0.9, 1.0),
            vote("m3", Verdict::Verified, 0.9, 1.0),
            vote("m4", Verdict::Error, 0.0, 1.0),
        ]);
        let snapshot = compute_snapshot(&votes, &params(0.67));
        assert_eq!(snapshot.valid_votes, 3);
        assert_eq!(snapshot.error_votes, 1);
        assert!((snapshot.weighted_confidence - 0.9).abs() < 1e-12);
        assert!(snapshot.bft_reached);
    }

    #[test]
    fn test_tie_breaks_lexicographically() {
        // Equal weight on "unverified" and "verified": the lexicographically
        // smaller tag wins deterministically.
        let votes = vote_set(vec![
            vote("m1", Verdict::Unverified, 0.9, 1.0),
            vote("m2", Verdict::Verified, 0.9, 1.0),
        ]);
        let snapshot = compute_snapshot(&votes, &params(0.5));
        assert_eq!(snapshot.majority_verdict, Some(Verdict::Unverified));
    }

    #[test]
    fn test_weights_drive_majority() {
        // One heavy dissenter outweighs two light supporters.
        let votes = vote_set(vec![
            vote("m1", Verdict::Verified, 0.9, 1.0),
            vote("m2", Verdict::Verified, 0.9, 1.0),
            vote("m3", Verdict::Unverified, 0.9, 5.0),
        ]);
        let snapshot = compute_snapshot(&votes, &params(0.5));
        assert_eq!(snapshot.majority_verdict, Some(Verdict::Unverified));
    }

    #[test]
    fn test_stddev_is_unweighted() {
        // Same confidences with wildly different weights must give the same
        // stddev.
        let balanced = vote_set(vec![
            vote("m1", Verdict::Verified, 0.9, 1.0),
            vote("m2", Verdict::Verified, 0.5, 1.0),
            vote("m3", Verdict::Verified, 0.7, 1.0),
        ]);
        let skewed = vote_set(vec![
            vote("m1", Verdict::Verified, 0.9, 10.0),
            vote("m2", Verdict::Verified, 0.5, 0.1),
            vote("m3", Verdict::Verified, 0.7, 3.0),
        ]);
        let a = compute_snapshot(&balanced, &params(0.5));
        let b = compute_snapshot(&skewed, &params(0.5));
        assert!((a.confidence_std_dev - b.confidence_std_dev).abs() < 1e-12);
        assert!((a.weighted_confidence - b.weighted_confidence).abs() > 0.01);
    }

    #[test]
    fn test_empty_set_snapshot() {
        let snapshot = compute_snapshot(&BTreeMap::new(), &SnapshotParams::default());
        assert!(snapshot.no_quorum);
        assert_eq!(snapshot.majority_verdict, None);
        assert_eq!(snapshot.final_verdict, FinalVerdict::Halt);
    }
}
