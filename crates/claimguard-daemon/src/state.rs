//! Shared daemon state.
//!
//! [`AppState`] owns every long-lived handle the API handlers and
//! background loops touch: the orchestrator and its dependency seams, the
//! HITL gate, quota and auth registries, fleet health, and metrics.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use claimguard_core::cache::ArtifactCache;
use claimguard_core::config::Config;
use claimguard_core::consensus::ConsensusEngine;
use claimguard_core::evidence::{EvidenceStore, MemoryEvidenceStore};
use claimguard_core::gateway::{ModelGateway, ScriptedGateway};
use claimguard_core::health::FleetHealth;
use claimguard_core::hitl::{HitlGate, TicketResolution};
use claimguard_core::index::{MemoryVectorIndex, VectorIndex};
use claimguard_core::ledger::AuditDb;
use claimguard_core::pipeline::{Dependencies, PipelineOrchestrator};
use claimguard_core::proof::ProofSigner;
use claimguard_core::quota::{QuotaRegistry, Tier};
use claimguard_core::trust::TrustRegistry;

use crate::gateway_http::HttpModelGateway;
use crate::metrics::DaemonMetrics;

/// Roles an API key may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// May submit claims and read statuses, proofs, and snapshots.
    Submitter,
    /// May approve or reject review tickets.
    Reviewer,
    /// May submit external votes.
    Model,
}

/// One configured API key.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyEntry {
    /// The secret key value presented in `x-api-key`.
    pub key: String,

    /// Stable identity recorded in audit events and votes.
    pub key_id: String,

    /// Quota tier.
    #[serde(default)]
    pub tier: Tier,

    /// Granted roles.
    pub roles: Vec<Role>,
}

/// The resolved identity behind a request.
#[derive(Debug, Clone)]
pub struct Principal {
    /// Stable key identity.
    pub key_id: String,

    /// Quota tier.
    pub tier: Tier,

    /// Granted roles.
    pub roles: Vec<Role>,
}

impl Principal {
    /// Whether the principal carries a role.
    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// API key lookup table.
#[derive(Debug, Default)]
pub struct ApiKeyRegistry {
    keys: HashMap<String, Principal>,
}

#[derive(Debug, Deserialize)]
struct KeysFile {
    keys: Vec<ApiKeyEntry>,
}

impl ApiKeyRegistry {
    /// Loads keys from a TOML file with a `keys` array.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let parsed: KeysFile = toml::from_str(&raw)?;
        Ok(Self::from_entries(parsed.keys))
    }

    /// Builds a registry from entries.
    #[must_use]
    pub fn from_entries(entries: Vec<ApiKeyEntry>) -> Self {
        let keys = entries
            .into_iter()
            .map(|entry| {
                (
                    entry.key,
                    Principal {
                        key_id: entry.key_id,
                        tier: entry.tier,
                        roles: entry.roles,
                    },
                )
            })
            .collect();
        Self { keys }
    }

    /// Generates a single ephemeral all-role key for development and logs
    /// it once.
    #[must_use]
    pub fn ephemeral() -> Self {
        let key = uuid::Uuid::new_v4().to_string();
        warn!(%key, "no keys file supplied; generated an ephemeral all-role API key");
        Self::from_entries(vec![ApiKeyEntry {
            key,
            key_id: "dev".to_string(),
            tier: Tier::Enterprise,
            roles: vec![Role::Submitter, Role::Reviewer, Role::Model],
        }])
    }

    /// Resolves a presented key.
    #[must_use]
    pub fn resolve(&self, key: &str) -> Option<&Principal> {
        self.keys.get(key)
    }
}

/// Everything the handlers and background loops share.
pub struct AppState {
    /// Platform configuration.
    pub config: Arc<Config>,

    /// The pipeline orchestrator.
    pub orchestrator: Arc<PipelineOrchestrator>,

    /// Consensus engine (external vote surface).
    pub engine: Arc<ConsensusEngine>,

    /// HITL gate (approve/reject surface).
    pub gate: Arc<HitlGate>,

    /// Audit and checkpoint storage.
    pub db: AuditDb,

    /// Evidence store (proof lookups).
    pub evidence: Arc<dyn EvidenceStore>,

    /// Vector index (probed by the fleet prober).
    pub index: Arc<dyn VectorIndex>,

    /// Model gateway (probed by the fleet prober).
    pub gateway: Arc<dyn ModelGateway>,

    /// Artifact cache.
    pub cache: Arc<ArtifactCache>,

    /// Fleet health tracker.
    pub health: Arc<FleetHealth>,

    /// Quota and rate limiting.
    pub quota: Arc<QuotaRegistry>,

    /// API key table.
    pub auth: Arc<ApiKeyRegistry>,

    /// Prometheus metrics.
    pub metrics: Arc<DaemonMetrics>,
}

impl AppState {
    /// Wires the full dependency graph.
    ///
    /// Returns the state plus the HITL resolution stream the dispatcher
    /// consumes.
    ///
    /// # Errors
    ///
    /// Returns an error if storage or metrics initialization fails.
    pub fn build(
        config: Config,
        db: AuditDb,
        auth: ApiKeyRegistry,
    ) -> anyhow::Result<(Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<TicketResolution>)> {
        Self::build_with_gateway(config, db, auth, None)
    }

    /// Wires the dependency graph with an explicit gateway.
    ///
    /// Used by tests and embedders that bring their own inference fleet.
    ///
    /// # Errors
    ///
    /// Returns an error if storage or metrics initialization fails.
    pub fn build_with_gateway(
        config: Config,
        db: AuditDb,
        auth: ApiKeyRegistry,
        gateway_override: Option<Arc<dyn ModelGateway>>,
    ) -> anyhow::Result<(Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<TicketResolution>)> {
        let config = Arc::new(config);

        let signer = match config.endpoints.signing_key.as_deref() {
            Some(seed) => Arc::new(ProofSigner::from_seed_hex(seed)?),
            None => {
                let signer = ProofSigner::generate();
                warn!(
                    verifying_key = %signer.verifying_key_hex(),
                    "no signing key configured; generated an ephemeral keypair"
                );
                Arc::new(signer)
            }
        };

        let gateway: Arc<dyn ModelGateway> = match (gateway_override, config.endpoints.model_gateway.as_deref()) {
            (Some(gateway), _) => gateway,
            (None, Some(endpoint)) => {
                info!(%endpoint, "using remote model gateway");
                Arc::new(HttpModelGateway::new(endpoint.to_string()))
            }
            (None, None) => {
                warn!("no model gateway configured; using the in-process gateway");
                let fallback = serde_json::json!({
                    "verdict": "needs_review",
                    "confidence": 0.5,
                    "coherence": 0.5,
                    "reasoning": "no inference fleet configured",
                })
                .to_string();
                Arc::new(ScriptedGateway::new(config.models.embedding_dim).with_fallback(fallback))
            }
        };

        let index: Arc<dyn VectorIndex> =
            Arc::new(MemoryVectorIndex::new(config.models.embedding_dim));
        let evidence: Arc<dyn EvidenceStore> = Arc::new(MemoryEvidenceStore::new());
        let engine = Arc::new(ConsensusEngine::new(config.consensus.clone()));
        let trust = Arc::new(TrustRegistry::new());
        let cache = Arc::new(ArtifactCache::new(config.cache.ttl));
        let (gate, resolutions) = HitlGate::new(&db);
        let gate = Arc::new(gate);

        let orchestrator = Arc::new(PipelineOrchestrator::new(Dependencies {
            config: Arc::clone(&config),
            gateway: Arc::clone(&gateway),
            index: Arc::clone(&index),
            evidence: Arc::clone(&evidence),
            db: db.clone(),
            engine: Arc::clone(&engine),
            trust,
            cache: Arc::clone(&cache),
            gate: Arc::clone(&gate),
            signer,
        }));

        let state = Arc::new(Self {
            health: Arc::new(FleetHealth::new(config.health.clone())),
            quota: Arc::new(QuotaRegistry::new(config.quota.clone())),
            metrics: Arc::new(DaemonMetrics::new()?),
            auth: Arc::new(auth),
            config,
            orchestrator,
            engine,
            gate,
            db,
            evidence,
            index,
            gateway,
            cache,
        });
        Ok((state, resolutions))
    }
}
