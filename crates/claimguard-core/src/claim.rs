//! Claim types and vertical domains.
//!
//! A [`Claim`] is the immutable unit of work submitted by a caller: the text
//! to verify, optional ordered evidence fragments, an optional vertical
//! [`Domain`], and an optional [`Priority`]. Claims are never mutated after
//! creation; everything derived from them lives in the pipeline checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum claim body length in bytes.
pub const MAX_CLAIM_LEN: usize = 32 * 1024;

/// Maximum number of evidence fragments per claim.
pub const MAX_EVIDENCE_FRAGMENTS: usize = 64;

/// Maximum length of a single evidence fragment in bytes.
pub const MAX_EVIDENCE_FRAGMENT_LEN: usize = 16 * 1024;

/// Errors raised while validating a submitted claim.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClaimError {
    /// The claim body is empty.
    #[error("claim text is empty")]
    EmptyText,

    /// The claim body exceeds the size limit.
    #[error("claim text too large: {len} bytes exceeds maximum of {max} bytes")]
    TextTooLarge {
        /// Actual length in bytes.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// Too many evidence fragments were supplied.
    #[error("too many evidence fragments: {count} exceeds maximum of {max}")]
    TooManyFragments {
        /// Number of fragments supplied.
        count: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// A single evidence fragment exceeds the size limit.
    #[error("evidence fragment {index} too large: {len} bytes exceeds maximum of {max} bytes")]
    FragmentTooLarge {
        /// Index of the offending fragment.
        index: usize,
        /// Actual length in bytes.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },
}

/// Closed set of verticals a claim may be tagged with.
///
/// Each domain carries its own Constitutional Halt threshold: the minimum
/// weighted-mean confidence below which the system refuses to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Veteran benefits claims.
    Vetproof,
    /// Legal assertions.
    Legal,
    /// Financial statements.
    Finance,
    /// Health and medical claims.
    Health,
    /// Educational content.
    Education,
    /// Aviation safety claims.
    Aviation,
}

impl Domain {
    /// All domains, in stable order.
    pub const ALL: [Self; 6] = [
        Self::Vetproof,
        Self::Legal,
        Self::Finance,
        Self::Health,
        Self::Education,
        Self::Aviation,
    ];

    /// Default Constitutional Halt threshold for this domain.
    #[must_use]
    pub const fn default_halt_threshold(self) -> f64 {
        match self {
            Self::Vetproof => 0.67,
            Self::Legal => 0.70,
            Self::Finance => 0.75,
            Self::Health => 0.80,
            Self::Education => 0.65,
            Self::Aviation => 0.85,
        }
    }

    /// Whether domain policy mandates human review regardless of risk.
    #[must_use]
    pub const fn mandates_review(self) -> bool {
        matches!(self, Self::Health | Self::Aviation)
    }

    /// The stable string tag for this domain.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Vetproof => "vetproof",
            Self::Legal => "legal",
            Self::Finance => "finance",
            Self::Health => "health",
            Self::Education => "education",
            Self::Aviation => "aviation",
        }
    }

    /// Parses a domain tag.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.as_str() == tag)
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied processing priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background verification.
    Low,
    /// Standard verification.
    #[default]
    Normal,
    /// High-priority verification; always routed through human review.
    High,
}

/// An immutable claim submitted for verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    /// Unique claim identifier (caller-supplied or generated on submit).
    pub id: String,

    /// The natural-language claim body.
    pub text: String,

    /// Ordered supporting evidence fragments.
    #[serde(default)]
    pub evidence: Vec<String>,

    /// Optional vertical domain tag.
    #[serde(default)]
    pub domain: Option<Domain>,

    /// Processing priority.
    #[serde(default)]
    pub priority: Priority,

    /// API key id of the submitter.
    #[serde(default)]
    pub submitter: Option<String>,

    /// Submission timestamp.
    pub submitted_at: DateTime<Utc>,
}

impl Claim {
    /// Creates a claim with the current timestamp.
    #[must_use]
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            evidence: Vec::new(),
            domain: None,
            priority: Priority::default(),
            submitter: None,
            submitted_at: Utc::now(),
        }
    }

    /// Sets the evidence fragments (builder pattern).
    #[must_use]
    pub fn with_evidence(mut self, evidence: Vec<String>) -> Self {
        self.evidence = evidence;
        self
    }

    /// Sets the domain tag (builder pattern).
    #[must_use]
    pub const fn with_domain(mut self, domain: Domain) -> Self {
        self.domain = Some(domain);
        self
    }

    /// Sets the priority (builder pattern).
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Validates size limits on the claim body and evidence.
    ///
    /// # Errors
    ///
    /// Returns a [`ClaimError`] describing the first violated limit.
    pub fn validate(&self) -> Result<(), ClaimError> {
        if self.text.trim().is_empty() {
            return Err(ClaimError::EmptyText);
        }
        if self.text.len() > MAX_CLAIM_LEN {
            return Err(ClaimError::TextTooLarge {
                len: self.text.len(),
                max: MAX_CLAIM_LEN,
            });
        }
        if self.evidence.len() > MAX_EVIDENCE_FRAGMENTS {
            return Err(ClaimError::TooManyFragments {
                count: self.evidence.len(),
                max: MAX_EVIDENCE_FRAGMENTS,
            });
        }
        for (index, fragment) in self.evidence.iter().enumerate() {
            if fragment.len() > MAX_EVIDENCE_FRAGMENT_LEN {
                return Err(ClaimError::FragmentTooLarge {
                    index,
                    len: fragment.len(),
                    max: MAX_EVIDENCE_FRAGMENT_LEN,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_thresholds() {
        assert_eq!(Domain::Vetproof.default_halt_threshold(), 0.67);
        assert_eq!(Domain::Aviation.default_halt_threshold(), 0.85);
    }

    #[test]
    fn test_domain_parse_roundtrip() {
        for domain in Domain::ALL {
            assert_eq!(Domain::parse(domain.as_str()), Some(domain));
        }
        assert_eq!(Domain::parse("marketing"), None);
    }

    #[test]
    fn test_mandated_review_domains() {
        assert!(Domain::Health.mandates_review());
        assert!(Domain::Aviation.mandates_review());
        assert!(!Domain::Vetproof.mandates_review());
    }

    #[test]
    fn test_claim_validation() {
        let claim = Claim::new("c1", "The sky is blue.");
        assert!(claim.validate().is_ok());

        let empty = Claim::new("c2", "   ");
        assert!(matches!(empty.validate(), Err(ClaimError::EmptyText)));

        let oversized = Claim::new("c3", "x".repeat(MAX_CLAIM_LEN + 1));
        assert!(matches!(
            oversized.validate(),
            Err(ClaimError::TextTooLarge { .. })
        ));
    }

    #[test]
    fn test_fragment_limits() {
        let claim = Claim::new("c4", "body").with_evidence(vec![
            "ok".to_string(),
            "y".repeat(MAX_EVIDENCE_FRAGMENT_LEN + 1),
        ]);
        assert!(matches!(
            claim.validate(),
            Err(ClaimError::FragmentTooLarge { index: 1, .. })
        ));
    }
}
