//! Evidence Store: the append-only proof archive and its chain tips.
//!
//! Proof records are addressed by `{domain}/{instance-id}/{proof-id}` and
//! are immutable once written. Each domain carries a single small chain-tip
//! record; writers read the tip, link the new proof's `previous_hash` to
//! it, and advance the tip with a compare-and-swap. A raced writer loses
//! the swap and retries with the fresh tip. Readers are wait-free lookups.
//!
//! The store is a trait to allow different backends; [`MemoryEvidenceStore`]
//! is the in-process implementation used by tests and single-node
//! deployments.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proof::{ProofRecord, GENESIS_HASH};

/// Errors raised by evidence store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EvidenceError {
    /// No record exists under the given key.
    #[error("proof not found: {key}")]
    NotFound {
        /// The missing storage key.
        key: String,
    },

    /// A record already exists under the key (append-only violation).
    #[error("proof already exists: {key}")]
    AlreadyExists {
        /// The conflicting storage key.
        key: String,
    },

    /// The chain tip moved between read and swap.
    #[error("chain tip conflict for domain {domain}: expected {expected}")]
    TipConflict {
        /// Domain whose tip raced.
        domain: String,
        /// The tip hash the writer expected.
        expected: String,
    },

    /// Backend failure.
    #[error("evidence store error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },
}

/// The chain tip for one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    /// Hash of the latest proof in the chain, or [`GENESIS_HASH`].
    pub hash: String,

    /// Proof id of the latest proof, if any.
    pub proof_id: Option<String>,

    /// When the tip last advanced.
    pub advanced_at: DateTime<Utc>,
}

impl ChainTip {
    /// The tip of an empty chain.
    #[must_use]
    pub fn genesis() -> Self {
        Self {
            hash: GENESIS_HASH.to_string(),
            proof_id: None,
            advanced_at: Utc::now(),
        }
    }
}

/// Append-only proof archive with per-domain hash chains.
///
/// Implementations must ensure:
/// 1. Records are immutable once appended
/// 2. The tip swap is atomic with the record insert
/// 3. Lookups never observe a half-written record
pub trait EvidenceStore: Send + Sync {
    /// Reads the current chain tip for a domain.
    ///
    /// Returns the genesis tip for a domain with no proofs yet.
    ///
    /// # Errors
    ///
    /// Returns [`EvidenceError::Backend`] on backend failure.
    fn chain_tip(&self, domain: &str) -> Result<ChainTip, EvidenceError>;

    /// Appends a record and advances the domain tip, atomically, if and
    /// only if the tip still matches `expected_tip_hash`.
    ///
    /// # Errors
    ///
    /// - [`EvidenceError::TipConflict`] if the tip moved; the caller
    ///   re-reads the tip, re-links, and retries
    /// - [`EvidenceError::AlreadyExists`] if the key is already taken
    fn append(
        &self,
        record: &ProofRecord,
        expected_tip_hash: &str,
    ) -> Result<(), EvidenceError>;

    /// Looks up a record by its full storage key.
    ///
    /// # Errors
    ///
    /// Returns [`EvidenceError::NotFound`] if no record exists.
    fn get(&self, key: &str) -> Result<ProofRecord, EvidenceError>;

    /// Looks up the proof for a pipeline instance, if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`EvidenceError::Backend`] on backend failure.
    fn find_by_instance(&self, instance_id: &str) -> Result<Option<ProofRecord>, EvidenceError>;

    /// Looks up the latest proof for a claim, if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`EvidenceError::Backend`] on backend failure.
    fn find_by_claim(&self, claim_id: &str) -> Result<Option<ProofRecord>, EvidenceError>;

    /// Range-scans a domain's records whose creation date starts with
    /// `date_prefix` (e.g. `"2026-08"`), newest first.
    ///
    /// # Errors
    ///
    /// Returns [`EvidenceError::Backend`] on backend failure.
    fn scan_domain(
        &self,
        domain: &str,
        date_prefix: &str,
    ) -> Result<Vec<ProofRecord>, EvidenceError>;

    /// Liveness probe.
    ///
    /// # Errors
    ///
    /// Returns [`EvidenceError::Backend`] if the store is unreachable.
    fn probe(&self) -> Result<(), EvidenceError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    records: HashMap<String, ProofRecord>,
    tips: HashMap<String, ChainTip>,
}

/// In-process evidence store.
#[derive(Debug, Default)]
pub struct MemoryEvidenceStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryEvidenceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (indicates a thread panic).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().expect("lock poisoned").records.len()
    }

    /// Whether the store is empty.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (indicates a thread panic).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().expect("lock poisoned").records.is_empty()
    }
}

impl EvidenceStore for MemoryEvidenceStore {
    fn chain_tip(&self, domain: &str) -> Result<ChainTip, EvidenceError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner
            .tips
            .get(domain)
            .cloned()
            .unwrap_or_else(ChainTip::genesis))
    }

    fn append(&self, record: &ProofRecord, expected_tip_hash: &str) -> Result<(), EvidenceError> {
        let key = record.storage_key();
        let mut inner = self.inner.write().expect("lock poisoned");

        let current = inner
            .tips
            .get(&record.domain)
            .map_or_else(|| GENESIS_HASH.to_string(), |tip| tip.hash.clone());
        if current != expected_tip_hash {
            return Err(EvidenceError::TipConflict {
                domain: record.domain.clone(),
                expected: expected_tip_hash.to_string(),
            });
        }
        if inner.records.contains_key(&key) {
            return Err(EvidenceError::AlreadyExists { key });
        }

        inner.records.insert(key, record.clone());
        inner.tips.insert(
            record.domain.clone(),
            ChainTip {
                hash: record.bundle.proof_hash.clone(),
                proof_id: Some(record.proof_id.clone()),
                advanced_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<ProofRecord, EvidenceError> {
        let inner = self.inner.read().expect("lock poisoned");
        inner
            .records
            .get(key)
            .cloned()
            .ok_or_else(|| EvidenceError::NotFound {
                key: key.to_string(),
            })
    }

    fn find_by_instance(&self, instance_id: &str) -> Result<Option<ProofRecord>, EvidenceError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner
            .records
            .values()
            .find(|r| r.instance_id == instance_id)
            .cloned())
    }

    fn find_by_claim(&self, claim_id: &str) -> Result<Option<ProofRecord>, EvidenceError> {
        let inner = self.inner.read().expect("lock poisoned");
        let mut matches: Vec<&ProofRecord> = inner
            .records
            .values()
            .filter(|r| r.claim_id == claim_id)
            .collect();
        matches.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        Ok(matches.first().map(|r| (*r).clone()))
    }

    fn scan_domain(
        &self,
        domain: &str,
        date_prefix: &str,
    ) -> Result<Vec<ProofRecord>, EvidenceError> {
        let inner = self.inner.read().expect("lock poisoned");
        let mut matches: Vec<ProofRecord> = inner
            .records
            .values()
            .filter(|r| {
                r.domain == domain
                    && r.created_at
                        .format("%Y-%m-%d")
                        .to_string()
                        .starts_with(date_prefix)
            })
            .cloned()
            .collect();
        matches.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        Ok(matches)
    }
}
