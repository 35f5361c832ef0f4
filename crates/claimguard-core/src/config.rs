//! Platform configuration.
//!
//! Every threshold, timeout, and endpoint the platform consumes is collected
//! here with the documented defaults. Values load from a TOML file and are
//! individually overridable; the daemon applies CLI flags on top.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::claim::Domain;
use crate::pipeline::backoff::BackoffPolicy;
use crate::pipeline::Stage;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The config file could not be parsed.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Consensus engine thresholds.
    pub consensus: ConsensusConfig,

    /// Pipeline stage policies.
    pub pipeline: PipelineConfig,

    /// Human-in-the-loop gate settings.
    pub hitl: HitlConfig,

    /// Verifier model fleet.
    pub models: ModelConfig,

    /// Similar-claim search settings.
    pub search: SearchConfig,

    /// Artifact cache settings.
    pub cache: CacheConfig,

    /// External dependency endpoints.
    pub endpoints: EndpointConfig,

    /// Fleet health probe settings.
    pub health: HealthConfig,

    /// Metering and quota tiers.
    pub quota: QuotaConfig,
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Constitutional Halt threshold for a domain, honoring overrides.
    #[must_use]
    pub fn halt_threshold(&self, domain: Option<Domain>) -> f64 {
        match domain {
            Some(d) => self
                .consensus
                .domain_thresholds
                .get(d.as_str())
                .copied()
                .unwrap_or_else(|| d.default_halt_threshold()),
            None => self.consensus.default_threshold,
        }
    }
}

/// Consensus engine thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Variance Halt threshold on the stddev of vote confidences.
    pub sigma_var: f64,

    /// Minimum valid votes before a quorum can exist.
    pub min_votes: usize,

    /// Constitutional Halt threshold for untagged claims.
    pub default_threshold: f64,

    /// Per-domain threshold overrides, keyed by domain tag.
    pub domain_thresholds: HashMap<String, f64>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            sigma_var: 0.25,
            min_votes: 3,
            default_threshold: 0.70,
            domain_thresholds: HashMap::new(),
        }
    }
}

/// Per-stage retry and timeout policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pipeline version recorded in every proof bundle.
    pub version: String,

    /// Maximum attempts per stage, keyed by stage tag.
    pub max_attempts: HashMap<String, u32>,

    /// Backoff policy per stage, keyed by stage tag.
    pub backoff: HashMap<String, BackoffPolicy>,

    /// Wall-clock timeout per stage attempt, keyed by stage tag.
    #[serde(with = "humantime_map")]
    pub timeouts: HashMap<String, Duration>,

    /// Retry budget for Evidence Store chain-tip CAS conflicts.
    pub cas_retry_limit: u32,
}

impl PipelineConfig {
    /// Maximum attempts for a stage.
    #[must_use]
    pub fn attempts_for(&self, stage: Stage) -> u32 {
        self.max_attempts
            .get(stage.as_str())
            .copied()
            .unwrap_or_else(|| default_attempts(stage))
    }

    /// Backoff policy for a stage.
    #[must_use]
    pub fn backoff_for(&self, stage: Stage) -> BackoffPolicy {
        self.backoff
            .get(stage.as_str())
            .cloned()
            .unwrap_or_else(|| default_backoff(stage))
    }

    /// Attempt timeout for a stage.
    #[must_use]
    pub fn timeout_for(&self, stage: Stage) -> Duration {
        self.timeouts
            .get(stage.as_str())
            .copied()
            .unwrap_or_else(|| default_timeout(stage))
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            max_attempts: HashMap::new(),
            backoff: HashMap::new(),
            timeouts: HashMap::new(),
            cas_retry_limit: 5,
        }
    }
}

const fn default_attempts(stage: Stage) -> u32 {
    match stage {
        Stage::Sanitize | Stage::Search | Stage::Detect | Stage::Sign => 2,
        Stage::Embed | Stage::Verify => 3,
    }
}

fn default_backoff(stage: Stage) -> BackoffPolicy {
    match stage {
        Stage::Sanitize => BackoffPolicy::exponential(Duration::from_secs(3)),
        Stage::Embed => BackoffPolicy::linear(Duration::from_secs(5)),
        Stage::Search => BackoffPolicy::linear(Duration::from_secs(3)),
        Stage::Verify => BackoffPolicy::exponential(Duration::from_secs(10)),
        Stage::Detect => BackoffPolicy::linear(Duration::from_secs(5)),
        Stage::Sign => BackoffPolicy::exponential(Duration::from_secs(5)),
    }
}

const fn default_timeout(stage: Stage) -> Duration {
    match stage {
        Stage::Sanitize | Stage::Search | Stage::Sign => Duration::from_secs(30),
        Stage::Embed | Stage::Detect => Duration::from_secs(60),
        Stage::Verify => Duration::from_secs(120),
    }
}

/// Human-in-the-loop gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HitlConfig {
    /// How long a ticket may wait before it expires.
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,

    /// How often the dispatcher scans for expired tickets.
    #[serde(with = "humantime_serde")]
    pub expiry_scan_interval: Duration,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(7 * 24 * 3600),
            expiry_scan_interval: Duration::from_secs(30),
        }
    }
}

/// Verifier model fleet settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model ids queried during the Verify stage.
    pub verifiers: Vec<String>,

    /// Per-request deadline for a single model call.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    /// Maximum concurrent model calls per pipeline instance.
    pub concurrency_cap: usize,

    /// Embedding vector dimension.
    pub embedding_dim: usize,

    /// Maximum reasoning text length retained per vote.
    pub max_reasoning_len: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            verifiers: vec![
                "shield-alpha".to_string(),
                "shield-beta".to_string(),
                "shield-gamma".to_string(),
            ],
            call_timeout: Duration::from_secs(30),
            concurrency_cap: 8,
            embedding_dim: 768,
            max_reasoning_len: 4096,
        }
    }
}

/// Similar-claim search settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Number of nearest neighbors requested from the index.
    pub top_k: usize,

    /// Minimum cosine score to retain a neighbor.
    pub min_score: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.7,
        }
    }
}

/// Artifact cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Time-to-live for cached snapshots and proofs.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
        }
    }
}

/// External dependency endpoints.
///
/// Empty values mean the in-process implementation is used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Model inference gateway base URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_gateway: Option<String>,

    /// Vector index base URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_index: Option<String>,

    /// Evidence store base URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_store: Option<String>,

    /// Hex-encoded 32-byte Ed25519 seed for proof signing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,
}

/// Fleet health probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between probes of each dependency.
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,

    /// Consecutive failures before a dependency flips unhealthy.
    pub unhealthy_threshold: u32,

    /// Consecutive successes before a dependency flips healthy.
    pub healthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            unhealthy_threshold: 3,
            healthy_threshold: 1,
        }
    }
}

/// Metering and quota tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Claims allowed per quota window, keyed by tier tag.
    pub claims_per_window: HashMap<String, u64>,

    /// Quota window length.
    #[serde(with = "humantime_serde")]
    pub quota_window: Duration,

    /// Requests allowed per rate window, per key.
    pub requests_per_window: u64,

    /// Rate window length.
    #[serde(with = "humantime_serde")]
    pub rate_window: Duration,

    /// USD price per additional claim once the quota is exhausted, keyed by
    /// tier tag. Tiers without a price receive a hard quota denial.
    pub overage_price_usd: HashMap<String, f64>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let mut claims = HashMap::new();
        claims.insert("free".to_string(), 50);
        claims.insert("pro".to_string(), 5_000);
        claims.insert("enterprise".to_string(), 100_000);

        let mut prices = HashMap::new();
        prices.insert("pro".to_string(), 0.05);

        Self {
            claims_per_window: claims,
            quota_window: Duration::from_secs(24 * 3600),
            requests_per_window: 120,
            rate_window: Duration::from_secs(60),
            overage_price_usd: prices,
        }
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

mod humantime_map {
    use std::collections::HashMap;
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(map: &HashMap<String, Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let formatted: HashMap<&str, String> = map
            .iter()
            .map(|(k, v)| (k.as_str(), humantime::format_duration(*v).to_string()))
            .collect();
        formatted.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = HashMap::<String, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(k, v)| {
                humantime::parse_duration(&v)
                    .map(|d| (k, d))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_defaults_match_policy_table() {
        let config = PipelineConfig::default();
        assert_eq!(config.attempts_for(Stage::Sanitize), 2);
        assert_eq!(config.attempts_for(Stage::Embed), 3);
        assert_eq!(config.attempts_for(Stage::Verify), 3);
        assert_eq!(config.timeout_for(Stage::Verify), Duration::from_secs(120));
        assert_eq!(config.timeout_for(Stage::Sign), Duration::from_secs(30));
    }

    #[test]
    fn test_domain_threshold_override() {
        let mut config = Config::default();
        assert_eq!(config.halt_threshold(Some(Domain::Health)), 0.80);

        config
            .consensus
            .domain_thresholds
            .insert("health".to_string(), 0.9);
        assert_eq!(config.halt_threshold(Some(Domain::Health)), 0.9);
        assert_eq!(config.halt_threshold(None), 0.70);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let raw = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.consensus.sigma_var, config.consensus.sigma_var);
        assert_eq!(parsed.hitl.deadline, config.hitl.deadline);
    }
}
