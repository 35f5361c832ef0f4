//! Fleet health tracking.
//!
//! The daemon probes each dependency (model gateway, vector index,
//! evidence store, audit ledger) on an interval and records the outcomes
//! here. Status only flips after the configured number of consecutive
//! failures or successes, so a single flaky probe does not flap the
//! `/health` surface.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::HealthConfig;

/// Health status of one dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    /// Not yet probed enough times to decide.
    Unknown,
    /// The dependency answers probes.
    Healthy,
    /// The dependency crossed the failure threshold.
    Unhealthy,
}

/// Tracked state for one dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    /// Current status.
    pub status: ProbeStatus,

    /// Consecutive successful probes.
    pub consecutive_ok: u32,

    /// Consecutive failed probes.
    pub consecutive_fail: u32,

    /// Latency of the last successful probe, in milliseconds.
    pub last_latency_ms: Option<u64>,

    /// Error from the last failed probe.
    pub last_error: Option<String>,

    /// When the dependency was last probed.
    pub last_checked: Option<DateTime<Utc>>,
}

impl Default for DependencyHealth {
    fn default() -> Self {
        Self {
            status: ProbeStatus::Unknown,
            consecutive_ok: 0,
            consecutive_fail: 0,
            last_latency_ms: None,
            last_error: None,
            last_checked: None,
        }
    }
}

/// Snapshot served by `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Whether every known dependency is non-unhealthy.
    pub healthy: bool,

    /// Per-dependency detail, keyed by dependency name.
    pub dependencies: BTreeMap<String, DependencyHealth>,
}

/// Aggregated fleet health state.
#[derive(Debug)]
pub struct FleetHealth {
    config: HealthConfig,
    dependencies: Mutex<BTreeMap<String, DependencyHealth>>,
}

impl FleetHealth {
    /// Creates a tracker with the given thresholds.
    #[must_use]
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            dependencies: Mutex::new(BTreeMap::new()),
        }
    }

    /// Records one probe outcome for a dependency.
    pub fn record_probe(&self, name: &str, outcome: Result<Duration, String>) {
        let mut dependencies = self.dependencies.lock().expect("lock poisoned");
        let entry = dependencies.entry(name.to_string()).or_default();
        entry.last_checked = Some(Utc::now());

        match outcome {
            Ok(latency) => {
                entry.consecutive_ok += 1;
                entry.consecutive_fail = 0;
                entry.last_latency_ms = Some(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
                entry.last_error = None;
                if entry.consecutive_ok >= self.config.healthy_threshold {
                    entry.status = ProbeStatus::Healthy;
                }
            }
            Err(error) => {
                entry.consecutive_fail += 1;
                entry.consecutive_ok = 0;
                entry.last_error = Some(error);
                if entry.consecutive_fail >= self.config.unhealthy_threshold {
                    entry.status = ProbeStatus::Unhealthy;
                }
            }
        }
    }

    /// Current report across all probed dependencies.
    #[must_use]
    pub fn report(&self) -> HealthReport {
        let dependencies = self.dependencies.lock().expect("lock poisoned").clone();
        let healthy = !dependencies
            .values()
            .any(|d| d.status == ProbeStatus::Unhealthy);
        HealthReport {
            healthy,
            dependencies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> FleetHealth {
        FleetHealth::new(HealthConfig {
            probe_interval: Duration::from_secs(30),
            unhealthy_threshold: 2,
            healthy_threshold: 2,
        })
    }

    #[test]
    fn test_status_flips_after_threshold() {
        let health = tracker();

        health.record_probe("gateway", Ok(Duration::from_millis(10)));
        assert_eq!(
            health.report().dependencies["gateway"].status,
            ProbeStatus::Unknown
        );

        health.record_probe("gateway", Ok(Duration::from_millis(12)));
        assert_eq!(
            health.report().dependencies["gateway"].status,
            ProbeStatus::Healthy
        );

        health.record_probe("gateway", Err("503".to_string()));
        assert_eq!(
            health.report().dependencies["gateway"].status,
            ProbeStatus::Healthy
        );
        assert!(health.report().healthy);

        health.record_probe("gateway", Err("503".to_string()));
        assert_eq!(
            health.report().dependencies["gateway"].status,
            ProbeStatus::Unhealthy
        );
        assert!(!health.report().healthy);
    }

    #[test]
    fn test_recovery_resets_failure_streak() {
        let health = tracker();
        health.record_probe("index", Err("down".to_string()));
        health.record_probe("index", Ok(Duration::from_millis(5)));
        health.record_probe("index", Err("down".to_string()));
        // One failure after a success: streak restarted, not unhealthy yet.
        assert_ne!(
            health.report().dependencies["index"].status,
            ProbeStatus::Unhealthy
        );
    }

    #[test]
    fn test_report_with_no_probes_is_healthy() {
        let health = tracker();
        let report = health.report();
        assert!(report.healthy);
        assert!(report.dependencies.is_empty());
    }
}
