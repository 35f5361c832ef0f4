//! Review resolution dispatcher.
//!
//! Owns the resolution stream from the [`HitlGate`](super::HitlGate) and
//! drives suspended instances forward: reviewer decisions arrive over the
//! channel, deadline expiries are found by the periodic scan, and each one
//! resumes a freshly loaded instance through the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{HitlGate, TicketResolution};
use crate::pipeline::PipelineOrchestrator;

/// Background loop delivering review decisions to suspended instances.
pub struct ReviewDispatcher {
    gate: Arc<HitlGate>,
    orchestrator: Arc<PipelineOrchestrator>,
    resolutions: mpsc::UnboundedReceiver<TicketResolution>,
    scan_interval: Duration,
}

impl ReviewDispatcher {
    /// Creates a dispatcher over the gate's resolution stream.
    #[must_use]
    pub fn new(
        gate: Arc<HitlGate>,
        orchestrator: Arc<PipelineOrchestrator>,
        resolutions: mpsc::UnboundedReceiver<TicketResolution>,
        scan_interval: Duration,
    ) -> Self {
        Self {
            gate,
            orchestrator,
            resolutions,
            scan_interval,
        }
    }

    /// Runs until the resolution stream closes.
    pub async fn run(mut self) {
        let mut scan = tokio::time::interval(self.scan_interval);
        scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                resolution = self.resolutions.recv() => {
                    match resolution {
                        Some(resolution) => self.deliver(resolution).await,
                        None => break,
                    }
                }
                _ = scan.tick() => {
                    // Expired tickets feed back through the resolution
                    // channel and are delivered on the next loop turn.
                    if let Err(error) = self.gate.expire_due(Utc::now()) {
                        warn!(%error, "ticket expiry scan failed");
                    }
                }
            }
        }
    }

    async fn deliver(&self, resolution: TicketResolution) {
        let instance_id = resolution.ticket.instance_id.clone();
        info!(
            ticket_id = %resolution.ticket.ticket_id,
            instance_id = %instance_id,
            outcome = ?resolution.decision.outcome,
            "delivering review decision"
        );
        if let Err(error) = self
            .orchestrator
            .resume(&instance_id, resolution.decision)
            .await
        {
            warn!(%error, instance_id = %instance_id, "resume after review failed");
        }
    }
}
