//! Prometheus metrics for daemon observability.
//!
//! Exposed at `GET /metrics` in the Prometheus text format.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `claimguard_claims_submitted_total` | Counter | |
//! | `claimguard_proofs_signed_total` | Counter | `verdict` |
//! | `claimguard_halt_proofs_total` | Counter | |
//! | `claimguard_runs_failed_total` | Counter | `stage` |
//! | `claimguard_tickets_opened_total` | Counter | |
//! | `claimguard_pipelines_inflight` | Gauge | |

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Daemon metrics, registered against one registry.
pub struct DaemonMetrics {
    registry: Registry,

    /// Claims accepted by `POST /v1/claims`.
    pub claims_submitted: IntCounter,

    /// Proof records written, by final verdict.
    pub proofs_signed: IntCounterVec,

    /// Halt proofs written.
    pub halt_proofs: IntCounter,

    /// Terminally failed runs, by failing stage.
    pub runs_failed: IntCounterVec,

    /// Review tickets opened.
    pub tickets_opened: IntCounter,

    /// Pipeline runs currently executing.
    pub pipelines_inflight: IntGauge,
}

impl DaemonMetrics {
    /// Creates and registers all metrics.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::RegistrationFailed`] on a name collision.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let claims_submitted = IntCounter::with_opts(Opts::new(
            "claimguard_claims_submitted_total",
            "Claims accepted for verification",
        ))?;
        let proofs_signed = IntCounterVec::new(
            Opts::new(
                "claimguard_proofs_signed_total",
                "Proof records written, by final verdict",
            ),
            &["verdict"],
        )?;
        let halt_proofs = IntCounter::with_opts(Opts::new(
            "claimguard_halt_proofs_total",
            "Halt proofs written",
        ))?;
        let runs_failed = IntCounterVec::new(
            Opts::new(
                "claimguard_runs_failed_total",
                "Terminally failed pipeline runs, by failing stage",
            ),
            &["stage"],
        )?;
        let tickets_opened = IntCounter::with_opts(Opts::new(
            "claimguard_tickets_opened_total",
            "Review tickets opened",
        ))?;
        let pipelines_inflight = IntGauge::with_opts(Opts::new(
            "claimguard_pipelines_inflight",
            "Pipeline runs currently executing",
        ))?;

        registry.register(Box::new(claims_submitted.clone()))?;
        registry.register(Box::new(proofs_signed.clone()))?;
        registry.register(Box::new(halt_proofs.clone()))?;
        registry.register(Box::new(runs_failed.clone()))?;
        registry.register(Box::new(tickets_opened.clone()))?;
        registry.register(Box::new(pipelines_inflight.clone()))?;

        Ok(Self {
            registry,
            claims_submitted,
            proofs_signed,
            halt_proofs,
            runs_failed,
            tickets_opened,
            pipelines_inflight,
        })
    }

    /// Encodes every registered metric in the Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::EncodingFailed`] if encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_encode() {
        let metrics = DaemonMetrics::new().unwrap();
        metrics.claims_submitted.inc();
        metrics.proofs_signed.with_label_values(&["verified"]).inc();
        metrics.pipelines_inflight.set(2);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("claimguard_claims_submitted_total 1"));
        assert!(text.contains("claimguard_pipelines_inflight 2"));
        assert!(text.contains(r#"verdict="verified""#));
    }
}
