//! Retry backoff policies for pipeline stages.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay schedule applied between retry attempts of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// The same delay before every retry.
    Fixed {
        /// Delay duration.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Delay doubles with each retry, capped.
    Exponential {
        /// Delay before the first retry.
        #[serde(with = "humantime_serde")]
        base: Duration,

        /// Upper bound on any single delay.
        #[serde(with = "humantime_serde")]
        max: Duration,
    },

    /// Delay grows by the base amount with each retry, capped.
    Linear {
        /// Delay before the first retry and the per-retry increment.
        #[serde(with = "humantime_serde")]
        base: Duration,

        /// Upper bound on any single delay.
        #[serde(with = "humantime_serde")]
        max: Duration,
    },
}

/// Default cap on any single retry delay.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(120);

impl BackoffPolicy {
    /// Exponential policy with the default cap.
    #[must_use]
    pub const fn exponential(base: Duration) -> Self {
        Self::Exponential {
            base,
            max: DEFAULT_MAX_DELAY,
        }
    }

    /// Linear policy with the default cap.
    #[must_use]
    pub const fn linear(base: Duration) -> Self {
        Self::Linear {
            base,
            max: DEFAULT_MAX_DELAY,
        }
    }

    /// Delay to apply before retry number `retry` (1-based: the delay
    /// between the first failure and the second attempt is `retry == 1`).
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(retry - 1);
                base.saturating_mul(factor).min(*max)
            }
            Self::Linear { base, max } => base.saturating_mul(retry).min(*max),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_doubles() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(3));
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(3));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(6));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(12));
        // Caps at the default maximum.
        assert_eq!(policy.delay_for_retry(10), Duration::from_secs(120));
    }

    #[test]
    fn test_linear_increments() {
        let policy = BackoffPolicy::linear(Duration::from_secs(5));
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(15));
    }

    #[test]
    fn test_fixed_is_constant() {
        let policy = BackoffPolicy::Fixed {
            delay: Duration::from_secs(2),
        };
        assert_eq!(policy.delay_for_retry(1), policy.delay_for_retry(7));
    }

    #[test]
    fn test_serde_roundtrip() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(10));
        let raw = serde_json::to_string(&policy).unwrap();
        let parsed: BackoffPolicy = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, policy);
    }
}
