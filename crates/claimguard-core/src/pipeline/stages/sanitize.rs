//! Sanitize stage: personal-information scrubbing.
//!
//! Scans the claim body and evidence for personal-information patterns,
//! emits a redacted rendition plus the detected category tags. Detection is
//! non-fatal; the pipeline proceeds with the redacted text.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::claim::Claim;
use crate::pipeline::{SanitizeOutput, Stage, StageError};

/// One personal-information pattern.
struct PiiPattern {
    category: &'static str,
    regex: Regex,
}

/// Scrubs personal-information patterns from text.
pub struct PiiScanner {
    patterns: Vec<PiiPattern>,
}

impl PiiScanner {
    fn new() -> Result<Self, regex::Error> {
        let specs: &[(&str, &str)] = &[
            ("email", r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}"),
            ("ssn", r"\b\d{3}-\d{2}-\d{4}\b"),
            ("phone", r"(?:\+?1[\s.\-]?)?\(?\d{3}\)?[\s.\-]\d{3}[\s.\-]\d{4}\b"),
            ("credit_card", r"\b(?:\d[ \-]?){13,16}\b"),
            ("ip_address", r"\b(?:\d{1,3}\.){3}\d{1,3}\b"),
        ];
        let mut patterns = Vec::with_capacity(specs.len());
        for (category, pattern) in specs {
            patterns.push(PiiPattern {
                category,
                regex: Regex::new(pattern)?,
            });
        }
        Ok(Self { patterns })
    }

    /// The shared scanner instance.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError::Fatal`] if a pattern failed to compile,
    /// which only happens if the pattern table itself is broken.
    pub fn shared() -> Result<&'static Self, StageError> {
        static SCANNER: OnceLock<Result<PiiScanner, regex::Error>> = OnceLock::new();
        match SCANNER.get_or_init(Self::new) {
            Ok(scanner) => Ok(scanner),
            Err(error) => Err(StageError::Fatal {
                stage: Stage::Sanitize,
                message: format!("pattern table failed to compile: {error}"),
            }),
        }
    }

    /// Redacts all matches, returning the scrubbed text and the categories
    /// that fired.
    #[must_use]
    pub fn scrub(&self, text: &str) -> (String, BTreeSet<String>) {
        let mut result = text.to_string();
        let mut categories = BTreeSet::new();
        for pattern in &self.patterns {
            if pattern.regex.is_match(&result) {
                categories.insert(pattern.category.to_string());
                result = pattern
                    .regex
                    .replace_all(&result, format!("[REDACTED:{}]", pattern.category))
                    .into_owned();
            }
        }
        (result, categories)
    }
}

/// Runs the Sanitize stage over a claim.
///
/// # Errors
///
/// Returns [`StageError::Fatal`] only if the scanner itself is broken;
/// detections are not errors.
pub fn run(claim: &Claim) -> Result<SanitizeOutput, StageError> {
    let scanner = PiiScanner::shared()?;

    let (redacted_text, mut categories) = scanner.scrub(&claim.text);
    let mut redacted_evidence = Vec::with_capacity(claim.evidence.len());
    for fragment in &claim.evidence {
        let (redacted, found) = scanner.scrub(fragment);
        redacted_evidence.push(redacted);
        categories.extend(found);
    }

    Ok(SanitizeOutput {
        redacted_text,
        redacted_evidence,
        categories: categories.into_iter().collect(),
    })
}
