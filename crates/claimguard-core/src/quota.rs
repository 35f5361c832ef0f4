//! Metering and quota enforcement.
//!
//! Every API key belongs to a tier with a claims-per-window quota and a
//! shared request rate limit. Checks are fixed-window counters: cheap,
//! per-key, and checked before any work happens. Tiers with an overage
//! price surface quota exhaustion as a payment-required condition; tiers
//! without one get a hard denial.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::QuotaConfig;

/// API key tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Evaluation tier.
    #[default]
    Free,
    /// Paid tier with overage pricing.
    Pro,
    /// Contract tier.
    Enterprise,
}

impl Tier {
    /// Stable string tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }
}

/// Quota check outcomes that deny the request.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QuotaError {
    /// The key exceeded its claim quota and the tier has no overage price.
    #[error("quota exceeded: {tier} tier allows {limit} claims per window")]
    QuotaExceeded {
        /// The key's tier tag.
        tier: &'static str,
        /// The tier's claim limit.
        limit: u64,
    },

    /// The key exceeded its claim quota; more claims cost money.
    #[error("quota exhausted: additional claims cost {price_usd} {currency}")]
    PaymentRequired {
        /// Price per additional claim.
        price_usd: f64,
        /// Price currency.
        currency: &'static str,
    },

    /// The key exceeded the request rate limit.
    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the window resets.
        retry_after_secs: u64,
    },
}

#[derive(Debug)]
struct KeyUsage {
    rate_window_start: Instant,
    rate_count: u64,
    quota_window_start: Instant,
    claim_count: u64,
}

impl KeyUsage {
    fn new(now: Instant) -> Self {
        Self {
            rate_window_start: now,
            rate_count: 0,
            quota_window_start: now,
            claim_count: 0,
        }
    }
}

/// Fixed-window quota and rate limiter.
#[derive(Debug)]
pub struct QuotaRegistry {
    config: QuotaConfig,
    usage: Mutex<HashMap<String, KeyUsage>>,
}

impl QuotaRegistry {
    /// Creates a registry with the given tier configuration.
    #[must_use]
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            usage: Mutex::new(HashMap::new()),
        }
    }

    /// Checks and counts one API request against the rate limit.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::RateLimited`] when the window is full.
    pub fn check_request(&self, key: &str) -> Result<(), QuotaError> {
        let now = Instant::now();
        let mut usage = self.usage.lock().expect("lock poisoned");
        let entry = usage
            .entry(key.to_string())
            .or_insert_with(|| KeyUsage::new(now));

        if now.duration_since(entry.rate_window_start) >= self.config.rate_window {
            entry.rate_window_start = now;
            entry.rate_count = 0;
        }
        if entry.rate_count >= self.config.requests_per_window {
            let elapsed = now.duration_since(entry.rate_window_start);
            let remaining = self.config.rate_window.saturating_sub(elapsed);
            return Err(QuotaError::RateLimited {
                retry_after_secs: remaining.as_secs().max(1),
            });
        }
        entry.rate_count += 1;
        Ok(())
    }

    /// Checks and counts one claim submission against the tier quota.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::PaymentRequired`] for priced tiers and
    /// [`QuotaError::QuotaExceeded`] otherwise once the window is full.
    pub fn check_claim(&self, key: &str, tier: Tier) -> Result<(), QuotaError> {
        let limit = self
            .config
            .claims_per_window
            .get(tier.as_str())
            .copied()
            .unwrap_or(u64::MAX);

        let now = Instant::now();
        let mut usage = self.usage.lock().expect("lock poisoned");
        let entry = usage
            .entry(key.to_string())
            .or_insert_with(|| KeyUsage::new(now));

        if now.duration_since(entry.quota_window_start) >= self.config.quota_window {
            entry.quota_window_start = now;
            entry.claim_count = 0;
        }
        if entry.claim_count >= limit {
            return match self.config.overage_price_usd.get(tier.as_str()) {
                Some(price) => Err(QuotaError::PaymentRequired {
                    price_usd: *price,
                    currency: "USD",
                }),
                None => Err(QuotaError::QuotaExceeded {
                    tier: tier.as_str(),
                    limit,
                }),
            };
        }
        entry.claim_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tight_config() -> QuotaConfig {
        let mut config = QuotaConfig::default();
        config.claims_per_window.insert("free".to_string(), 2);
        config.claims_per_window.insert("pro".to_string(), 1);
        config.requests_per_window = 3;
        config.rate_window = Duration::from_secs(60);
        config
    }

    #[test]
    fn test_rate_limit_window() {
        let registry = QuotaRegistry::new(tight_config());
        for _ in 0..3 {
            registry.check_request("k1").unwrap();
        }
        assert!(matches!(
            registry.check_request("k1"),
            Err(QuotaError::RateLimited { .. })
        ));
        // Other keys are unaffected.
        registry.check_request("k2").unwrap();
    }

    #[test]
    fn test_free_tier_hard_denial() {
        let registry = QuotaRegistry::new(tight_config());
        registry.check_claim("k1", Tier::Free).unwrap();
        registry.check_claim("k1", Tier::Free).unwrap();
        assert!(matches!(
            registry.check_claim("k1", Tier::Free),
            Err(QuotaError::QuotaExceeded { tier: "free", limit: 2 })
        ));
    }

    #[test]
    fn test_priced_tier_gets_payment_required() {
        let registry = QuotaRegistry::new(tight_config());
        registry.check_claim("k1", Tier::Pro).unwrap();
        match registry.check_claim("k1", Tier::Pro) {
            Err(QuotaError::PaymentRequired {
                price_usd,
                currency,
            }) => {
                assert!((price_usd - 0.05).abs() < 1e-12);
                assert_eq!(currency, "USD");
            }
            other => panic!("expected payment required, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_tier_is_unlimited() {
        let mut config = tight_config();
        config.claims_per_window.remove("enterprise");
        let registry = QuotaRegistry::new(config);
        for _ in 0..100 {
            registry.check_claim("k1", Tier::Enterprise).unwrap();
        }
    }
}
