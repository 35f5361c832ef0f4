//! Per-model trust profiles.
//!
//! Trust is a bounded exponential moving average over agreement with the
//! quorum: models that disagree with a non-halt quorum verdict decay,
//! models that agree get boosted. The update is a convex combination, so a
//! trust score that starts in [0, 1] stays in [0, 1]. Trust supplies the
//! default vote weight for the Verify stage.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::consensus::{ConsensusSnapshot, Vote};

/// EMA smoothing factor for trust observations.
const TRUST_ALPHA: f64 = 0.2;

/// Initial trust for a model never seen before.
const INITIAL_TRUST: f64 = 0.5;

/// One model's trust state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustProfile {
    /// Current trust score in [0, 1].
    pub trust: f64,

    /// Total quorum outcomes observed.
    pub observations: u64,

    /// Outcomes where the model agreed with the quorum verdict.
    pub agreements: u64,
}

impl Default for TrustProfile {
    fn default() -> Self {
        Self {
            trust: INITIAL_TRUST,
            observations: 0,
            agreements: 0,
        }
    }
}

/// Registry of model trust profiles.
#[derive(Debug, Default)]
pub struct TrustRegistry {
    profiles: Mutex<HashMap<String, TrustProfile>>,
}

impl TrustRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default vote weight for a model: twice its trust, so a fresh model
    /// weighs 1.0.
    #[must_use]
    pub fn weight_for(&self, model_id: &str) -> f64 {
        let profiles = self.profiles.lock().expect("lock poisoned");
        let trust = profiles
            .get(model_id)
            .map_or(INITIAL_TRUST, |p| p.trust);
        (trust * 2.0).max(f64::MIN_POSITIVE)
    }

    /// Current trust score for a model.
    #[must_use]
    pub fn trust_for(&self, model_id: &str) -> f64 {
        let profiles = self.profiles.lock().expect("lock poisoned");
        profiles.get(model_id).map_or(INITIAL_TRUST, |p| p.trust)
    }

    /// Records quorum outcomes for every valid vote in a session.
    ///
    /// Halted sessions carry no reliable ground signal and are skipped.
    pub fn record_outcomes(&self, snapshot: &ConsensusSnapshot, votes: &[Vote]) {
        let Some(majority) = snapshot.majority_verdict else {
            return;
        };
        if snapshot.final_verdict.is_halt() {
            return;
        }

        let mut profiles = self.profiles.lock().expect("lock poisoned");
        for vote in votes.iter().filter(|v| v.is_valid()) {
            let profile = profiles.entry(vote.model_id.clone()).or_default();
            let agreed = vote.verdict == majority;
            let observation = if agreed { 1.0 } else { 0.0 };
            profile.trust = ema_update(profile.trust, observation, TRUST_ALPHA);
            profile.observations += 1;
            if agreed {
                profile.agreements += 1;
            }
        }
    }

    /// Snapshot of every profile, for the status surface.
    #[must_use]
    pub fn profiles(&self) -> HashMap<String, TrustProfile> {
        self.profiles.lock().expect("lock poisoned").clone()
    }
}

/// Bounded EMA update: `alpha * observation + (1 - alpha) * current`,
/// clamped to [0, 1].
#[must_use]
fn ema_update(current: f64, observation: f64, alpha: f64) -> f64 {
    (alpha * observation + (1.0 - alpha) * current).clamp(0.0, 1.0)
}
