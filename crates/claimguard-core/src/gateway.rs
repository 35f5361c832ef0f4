//! Model inference gateway interface.
//!
//! The Verify stage requests one structured opinion per configured verifier
//! model and the Embed stage requests embedding vectors; both go through
//! the [`ModelGateway`] trait so stages stay pure transformations over a
//! dependency seam.
//!
//! # Async Pattern
//!
//! Trait methods return [`BoxFuture`] to stay object-safe, so the gateway
//! can live behind `Arc<dyn ModelGateway>`.
//!
//! # Strict Parsing
//!
//! Model responses are JSON documents parsed strictly by
//! [`parse_opinion`]: unknown fields, missing fields, or out-of-range
//! values reject the response, and the Verify stage records an error vote
//! for that model instead of guessing.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::claim::Domain;
use crate::consensus::Verdict;

/// A boxed future for object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors raised by gateway calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// The gateway or model did not answer in time.
    #[error("model call timed out: {model_id}")]
    Timeout {
        /// The model that timed out.
        model_id: String,
    },

    /// The gateway is unreachable or returned a server error.
    #[error("model gateway unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },

    /// The model rejected the request.
    #[error("model {model_id} rejected request: {message}")]
    Rejected {
        /// The rejecting model.
        model_id: String,
        /// Description of the rejection.
        message: String,
    },
}

/// Errors raised while parsing a model response into an opinion.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OpinionParseError {
    /// The response was not the expected JSON document.
    #[error("malformed opinion: {0}")]
    Malformed(String),

    /// The verdict tag was outside the closed set.
    #[error("unknown verdict tag: {tag}")]
    UnknownVerdict {
        /// The offending tag.
        tag: String,
    },

    /// A numeric field was outside [0, 1].
    #[error("{field} out of range: {value}")]
    OutOfRange {
        /// The offending field.
        field: &'static str,
        /// The offending value.
        value: f64,
    },
}

/// Context handed to each verifier model.
#[derive(Debug, Clone, Serialize)]
pub struct OpinionRequest {
    /// Sanitized claim body.
    pub claim_text: String,

    /// Sanitized evidence fragments.
    pub evidence: Vec<String>,

    /// Similar prior claims, as `(claim_id, cosine score)` pairs.
    pub similar_claims: Vec<(String, f64)>,

    /// Domain tag, if any.
    pub domain: Option<Domain>,
}

/// A strictly parsed model opinion, before weighting.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOpinion {
    /// The model's verdict.
    pub verdict: Verdict,

    /// Confidence in [0, 1].
    pub confidence: f64,

    /// Coherence in [0, 1].
    pub coherence: f64,

    /// Reasoning text, truncated to the configured bound.
    pub reasoning: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOpinion {
    verdict: String,
    confidence: f64,
    coherence: f64,
    #[serde(default)]
    reasoning: String,
}

/// Parses a raw model response strictly into an opinion.
///
/// # Errors
///
/// Returns an [`OpinionParseError`] naming the first violation.
pub fn parse_opinion(raw: &str, max_reasoning_len: usize) -> Result<ParsedOpinion, OpinionParseError> {
    let raw: RawOpinion =
        serde_json::from_str(raw).map_err(|e| OpinionParseError::Malformed(e.to_string()))?;

    let verdict = Verdict::parse(&raw.verdict).ok_or(OpinionParseError::UnknownVerdict {
        tag: raw.verdict.clone(),
    })?;
    if !raw.confidence.is_finite() || !(0.0..=1.0).contains(&raw.confidence) {
        return Err(OpinionParseError::OutOfRange {
            field: "confidence",
            value: raw.confidence,
        });
    }
    if !raw.coherence.is_finite() || !(0.0..=1.0).contains(&raw.coherence) {
        return Err(OpinionParseError::OutOfRange {
            field: "coherence",
            value: raw.coherence,
        });
    }

    let mut reasoning = raw.reasoning;
    if reasoning.len() > max_reasoning_len {
        let mut cut = max_reasoning_len;
        while !reasoning.is_char_boundary(cut) {
            cut -= 1;
        }
        reasoning.truncate(cut);
    }

    Ok(ParsedOpinion {
        verdict,
        confidence: raw.confidence,
        coherence: raw.coherence,
        reasoning,
    })
}

/// Model inference gateway.
pub trait ModelGateway: Send + Sync {
    /// Requests one model's raw opinion on a claim.
    fn opine<'a>(
        &'a self,
        model_id: &'a str,
        request: &'a OpinionRequest,
    ) -> BoxFuture<'a, Result<String, GatewayError>>;

    /// Embeds a text into a fixed-dimension vector.
    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, GatewayError>>;

    /// Liveness probe.
    fn probe(&self) -> BoxFuture<'_, Result<(), GatewayError>>;
}

/// Deterministic bag-of-tokens hash embedding.
///
/// Not a semantic model: each token hashes into a handful of dimensions,
/// so texts sharing vocabulary land near each other. Good enough for the
/// in-process gateway and for exercising the Search stage.
#[must_use]
pub fn hash_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimension];
    if dimension == 0 {
        return vector;
    }
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let token = token.to_lowercase();
        // FNV-1a over the token bytes.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in token.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        for spread in 0..3u64 {
            let slot = (hash.rotate_left(u32::try_from(spread * 17).unwrap_or(0))
                % dimension as u64) as usize;
            vector[slot] += 1.0;
        }
    }
    // L2-normalize so cosine scores are well-behaved.
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}

/// In-process gateway with scripted opinions and hash embeddings.
///
/// The default gateway for single-node deployments without a remote
/// inference fleet, and the failure-injection harness for tests.
pub struct ScriptedGateway {
    dimension: usize,
    opinions: Mutex<std::collections::HashMap<String, String>>,
    fallback: Option<String>,
    failing_embeds: AtomicU32,
    failing_opines: AtomicU32,
}

impl std::fmt::Debug for ScriptedGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedGateway")
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl ScriptedGateway {
    /// Creates a gateway producing embeddings of the given dimension.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            opinions: Mutex::new(std::collections::HashMap::new()),
            fallback: None,
            failing_embeds: AtomicU32::new(0),
            failing_opines: AtomicU32::new(0),
        }
    }

    /// Scripts the raw response for one model id.
    pub fn script_opinion(&self, model_id: impl Into<String>, raw: impl Into<String>) {
        self.opinions
            .lock()
            .expect("lock poisoned")
            .insert(model_id.into(), raw.into());
    }

    /// Scripts a structured opinion for one model id.
    pub fn script_vote(
        &self,
        model_id: impl Into<String>,
        verdict: Verdict,
        confidence: f64,
        coherence: f64,
    ) {
        let raw = serde_json::json!({
            "verdict": verdict.as_str(),
            "confidence": confidence,
            "coherence": coherence,
            "reasoning": "scripted opinion",
        });
        self.script_opinion(model_id, raw.to_string());
    }

    /// Sets the response for models without a script.
    #[must_use]
    pub fn with_fallback(mut self, raw: impl Into<String>) -> Self {
        self.fallback = Some(raw.into());
        self
    }

    /// Makes the next `n` embed calls fail with a transient error.
    pub fn fail_next_embeds(&self, n: u32) {
        self.failing_embeds.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` opine calls fail with a transient error.
    pub fn fail_next_opines(&self, n: u32) {
        self.failing_opines.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl ModelGateway for ScriptedGateway {
    fn opine<'a>(
        &'a self,
        model_id: &'a str,
        _request: &'a OpinionRequest,
    ) -> BoxFuture<'a, Result<String, GatewayError>> {
        Box::pin(async move {
            if Self::take_failure(&self.failing_opines) {
                return Err(GatewayError::Unavailable {
                    message: "injected opine failure".to_string(),
                });
            }
            let scripted = self
                .opinions
                .lock()
                .expect("lock poisoned")
                .get(model_id)
                .cloned();
            match scripted.or_else(|| self.fallback.clone()) {
                Some(raw) => Ok(raw),
                None => Err(GatewayError::Rejected {
                    model_id: model_id.to_string(),
                    message: "no scripted opinion".to_string(),
                }),
            }
        })
    }

    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, GatewayError>> {
        Box::pin(async move {
            if Self::take_failure(&self.failing_embeds) {
                return Err(GatewayError::Unavailable {
                    message: "injected embed failure".to_string(),
                });
            }
            Ok(hash_embedding(text, self.dimension))
        })
    }

    fn probe(&self) -> BoxFuture<'_, Result<(), GatewayError>> {
        Box::pin(async move { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_opinion() {
        let raw = r#"{"verdict":"verified","confidence":0.9,"coherence":0.85,"reasoning":"checks out"}"#;
        let opinion = parse_opinion(raw, 4096).unwrap();
        assert_eq!(opinion.verdict, Verdict::Verified);
        assert!((opinion.confidence - 0.9).abs() < 1e-12);
        assert_eq!(opinion.reasoning, "checks out");
    }

    #[test]
    fn test_parse_rejects_unknown_fields() {
        let raw = r#"{"verdict":"verified","confidence":0.9,"coherence":0.85,"extra":true}"#;
        assert!(matches!(
            parse_opinion(raw, 4096),
            Err(OpinionParseError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_verdict() {
        let raw = r#"{"verdict":"maybe","confidence":0.9,"coherence":0.85}"#;
        assert!(matches!(
            parse_opinion(raw, 4096),
            Err(OpinionParseError::UnknownVerdict { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_out_of_range() {
        let raw = r#"{"verdict":"verified","confidence":1.5,"coherence":0.85}"#;
        assert!(matches!(
            parse_opinion(raw, 4096),
            Err(OpinionParseError::OutOfRange {
                field: "confidence",
                ..
            })
        ));
    }

    #[test]
    fn test_reasoning_truncation() {
        let raw = format!(
            r#"{{"verdict":"verified","confidence":0.9,"coherence":0.85,"reasoning":"{}"}}"#,
            "x".repeat(100)
        );
        let opinion = parse_opinion(&raw, 10).unwrap();
        assert_eq!(opinion.reasoning.len(), 10);
    }

    #[test]
    fn test_hash_embedding_is_deterministic_and_normalized() {
        let a = hash_embedding("veteran tinnitus exposure", 768);
        let b = hash_embedding("veteran tinnitus exposure", 768);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_similar_texts_score_higher() {
        use crate::index::cosine_similarity;
        let base = hash_embedding("veteran noise exposure tinnitus diagnosis", 768);
        let close = hash_embedding("veteran tinnitus noise exposure documented", 768);
        let far = hash_embedding("quarterly revenue grew eight percent", 768);
        assert!(cosine_similarity(&base, &close) > cosine_similarity(&base, &far));
    }

    #[tokio::test]
    async fn test_scripted_gateway_failure_injection() {
        let gateway = ScriptedGateway::new(8);
        gateway.fail_next_embeds(1);
        assert!(gateway.embed("text").await.is_err());
        assert!(gateway.embed("text").await.is_ok());
    }

    #[tokio::test]
    async fn test_scripted_opinions() {
        let gateway = ScriptedGateway::new(8);
        gateway.script_vote("m1", Verdict::Verified, 0.9, 0.88);
        let request = OpinionRequest {
            claim_text: "text".to_string(),
            evidence: vec![],
            similar_claims: vec![],
            domain: None,
        };
        let raw = gateway.opine("m1", &request).await.unwrap();
        let opinion = parse_opinion(&raw, 4096).unwrap();
        assert_eq!(opinion.verdict, Verdict::Verified);

        assert!(gateway.opine("unknown", &request).await.is_err());
    }
}
