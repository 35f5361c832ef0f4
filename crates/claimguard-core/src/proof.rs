//! Proof bundles, canonical hashing, and proof signing.
//!
//! A completed pipeline instance produces exactly one [`ProofRecord`]. The
//! record's [`ProofBundle`] is serialized canonically (RFC 8785: sorted
//! keys, UTF-8, no whitespace) with the `proof_hash` field removed, hashed
//! with SHA-256, and linked to the previous proof in the domain's chain via
//! `previous_hash`. The hash is then signed with the platform's Ed25519
//! key so bundles remain verifiable outside the platform.
//!
//! Halts produce proof records too: a halt proof records *why* the system
//! declined, not the absence of a record.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::consensus::FinalVerdict;
use crate::pipeline::{
    DetectOutput, EmbedOutput, ReviewDecision, SanitizeOutput, SearchOutput, VerifyOutput,
};

/// Hash referenced by the first proof in every domain chain.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Errors raised while composing or signing proofs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProofError {
    /// The bundle could not be serialized canonically.
    #[error("canonical serialization failed: {0}")]
    Serialization(String),

    /// The signing key material was malformed.
    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    /// A signature failed verification.
    #[error("signature verification failed for proof {proof_hash}")]
    BadSignature {
        /// The proof hash whose signature did not verify.
        proof_hash: String,
    },
}

/// Per-stage outputs embedded in the proof bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageBundle {
    /// Sanitize output.
    pub sanitize: SanitizeOutput,
    /// Embed output.
    pub embed: EmbedOutput,
    /// Search output.
    pub search: SearchOutput,
    /// Verify output, including the final consensus snapshot.
    pub verify: VerifyOutput,
    /// Detect output, including halt flags.
    pub detect: DetectOutput,
}

/// The canonical proof bundle.
///
/// `proof_hash` is the hex SHA-256 of this bundle's canonical bytes with
/// the `proof_hash` field removed; everything else participates in the
/// hash, including the reviewer decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofBundle {
    /// The verified claim's id.
    pub claim_id: String,

    /// Pipeline version that produced this proof.
    pub pipeline_version: String,

    /// Per-stage outputs.
    pub stages: StageBundle,

    /// The verdict the pipeline reports.
    pub verdict: FinalVerdict,

    /// Weighted-mean confidence from the consensus snapshot.
    pub final_confidence: f64,

    /// Trust score from the Detect stage.
    pub trust_score: f64,

    /// The review decision feeding Sign.
    pub reviewer: ReviewDecision,

    /// Bundle timestamp (ISO-8601 UTC); fixed at Detect completion so
    /// re-running Sign reproduces identical bytes.
    pub timestamp: DateTime<Utc>,

    /// Pipeline duration in milliseconds, measured to Detect completion.
    pub duration_ms: u64,

    /// Hash of the previous proof in this domain's chain, or the genesis
    /// hash.
    pub previous_hash: String,

    /// Hex SHA-256 of this bundle with this field removed.
    pub proof_hash: String,
}

impl ProofBundle {
    /// Canonical bytes of the bundle with the `proof_hash` field removed.
    ///
    /// # Errors
    ///
    /// Returns [`ProofError::Serialization`] if the bundle cannot be
    /// represented as canonical JSON.
    pub fn canonical_bytes_for_hashing(&self) -> Result<Vec<u8>, ProofError> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| ProofError::Serialization(e.to_string()))?;
        if let serde_json::Value::Object(ref mut map) = value {
            map.remove("proof_hash");
        }
        serde_jcs::to_vec(&value).map_err(|e| ProofError::Serialization(e.to_string()))
    }

    /// Computes the hex SHA-256 proof hash of this bundle.
    ///
    /// # Errors
    ///
    /// Returns [`ProofError::Serialization`] if canonicalization fails.
    pub fn compute_hash(&self) -> Result<String, ProofError> {
        let bytes = self.canonical_bytes_for_hashing()?;
        Ok(hex_encode(&Sha256::digest(&bytes)))
    }

    /// Computes and stores the proof hash, returning it.
    ///
    /// # Errors
    ///
    /// Returns [`ProofError::Serialization`] if canonicalization fails.
    pub fn seal_hash(&mut self) -> Result<String, ProofError> {
        let hash = self.compute_hash()?;
        self.proof_hash = hash.clone();
        Ok(hash)
    }
}

/// An immutable proof record as stored in the Evidence Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofRecord {
    /// Unique proof id.
    pub proof_id: String,

    /// The claim this proof covers.
    pub claim_id: String,

    /// The pipeline instance that produced it.
    pub instance_id: String,

    /// Domain chain this proof belongs to (`"general"` for untagged
    /// claims).
    pub domain: String,

    /// The canonical bundle.
    pub bundle: ProofBundle,

    /// Hex Ed25519 signature over the proof hash.
    pub signature: String,

    /// Write timestamp.
    pub created_at: DateTime<Utc>,
}

impl ProofRecord {
    /// Storage key: `{domain}/{instance-id}/{proof-id}`.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{}/{}/{}", self.domain, self.instance_id, self.proof_id)
    }

    /// Whether this is a halt proof.
    #[must_use]
    pub const fn is_halt_proof(&self) -> bool {
        self.bundle.verdict.is_halt()
    }
}

/// Signs proof hashes with the platform's Ed25519 key.
pub struct ProofSigner {
    key: SigningKey,
}

impl std::fmt::Debug for ProofSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofSigner")
            .field("verifying_key", &self.verifying_key_hex())
            .finish()
    }
}

impl ProofSigner {
    /// Creates a signer from a hex-encoded 32-byte seed.
    ///
    /// # Errors
    ///
    /// Returns [`ProofError::InvalidKey`] if the seed is not 64 hex
    /// characters.
    pub fn from_seed_hex(seed: &str) -> Result<Self, ProofError> {
        let bytes = hex_decode(seed)
            .ok_or_else(|| ProofError::InvalidKey("seed is not valid hex".to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ProofError::InvalidKey("seed must be 32 bytes".to_string()))?;
        Ok(Self {
            key: SigningKey::from_bytes(&seed),
        })
    }

    /// Generates an ephemeral signer.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            key: SigningKey::generate(&mut rng),
        }
    }

    /// Signs a hex proof hash, returning the hex signature.
    #[must_use]
    pub fn sign_hash(&self, proof_hash: &str) -> String {
        let signature = self.key.sign(proof_hash.as_bytes());
        hex_encode(&signature.to_bytes())
    }

    /// Hex-encoded verifying key.
    #[must_use]
    pub fn verifying_key_hex(&self) -> String {
        hex_encode(self.key.verifying_key().as_bytes())
    }

    /// Verifies a hex signature over a hex proof hash.
    ///
    /// # Errors
    ///
    /// Returns [`ProofError::BadSignature`] if verification fails, or
    /// [`ProofError::InvalidKey`] if the signature bytes are malformed.
    pub fn verify_hash(&self, proof_hash: &str, signature_hex: &str) -> Result<(), ProofError> {
        verify_proof_signature(&self.key.verifying_key(), proof_hash, signature_hex)
    }
}

/// Verifies a hex signature over a hex proof hash against a verifying key.
///
/// # Errors
///
/// Returns [`ProofError::BadSignature`] if verification fails, or
/// [`ProofError::InvalidKey`] if the signature bytes are malformed.
pub fn verify_proof_signature(
    key: &VerifyingKey,
    proof_hash: &str,
    signature_hex: &str,
) -> Result<(), ProofError> {
    let bytes = hex_decode(signature_hex)
        .ok_or_else(|| ProofError::InvalidKey("signature is not valid hex".to_string()))?;
    let bytes: [u8; 64] = bytes
        .try_into()
        .map_err(|_| ProofError::InvalidKey("signature must be 64 bytes".to_string()))?;
    let signature = Signature::from_bytes(&bytes);
    key.verify(proof_hash.as_bytes(), &signature)
        .map_err(|_| ProofError::BadSignature {
            proof_hash: proof_hash.to_string(),
        })
}

/// Hex-encodes bytes.
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut acc: String, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        },
    )
}

/// Hex-decodes a string, returning `None` on malformed input.
#[must_use]
pub fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    s.as_bytes()
        .chunks(2)
        .map(|chunk| {
            let high = hex_nibble(chunk[0])?;
            let low = hex_nibble(chunk[1])?;
            Some((high << 4) | low)
        })
        .collect()
}

const fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}
