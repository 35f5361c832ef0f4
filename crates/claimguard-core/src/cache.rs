//! Short-TTL artifact cache.
//!
//! Fingerprint-to-artifact fast path for consensus snapshots and final
//! proofs. Writes are best-effort and reads that miss never affect
//! correctness; the TTL bounds staleness under last-write-wins.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;

struct Entry {
    expires_at: Instant,
    value: serde_json::Value,
}

/// Typed TTL cache keyed by claim id or fingerprint.
pub struct ArtifactCache {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache").field("ttl", &self.ttl).finish()
    }
}

impl ArtifactCache {
    /// Creates a cache with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Stores an artifact under a key. Serialization failures are dropped;
    /// the cache is best-effort by contract.
    pub fn put<T: Serialize>(&self, key: impl Into<String>, value: &T) {
        let Ok(value) = serde_json::to_value(value) else {
            return;
        };
        let mut entries = self.entries.lock().expect("lock poisoned");
        entries.insert(
            key.into(),
            Entry {
                expires_at: Instant::now() + self.ttl,
                value,
            },
        );
    }

    /// Fetches an artifact, evicting it if expired.
    #[must_use]
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                serde_json::from_value(entry.value.clone()).ok()
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Drops every expired entry.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("lock poisoned");
        entries.retain(|_, entry| entry.expires_at > now);
    }

    /// Number of live entries (including not-yet-swept expired ones).
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (indicates a thread panic).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }

    /// Whether the cache holds no entries.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (indicates a thread panic).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().expect("lock poisoned").is_empty()
    }

    /// Cache key for a claim's consensus snapshot.
    #[must_use]
    pub fn snapshot_key(claim_id: &str) -> String {
        format!("snapshot/{claim_id}")
    }

    /// Cache key for a claim's final proof.
    #[must_use]
    pub fn proof_key(claim_id: &str) -> String {
        format!("proof/{claim_id}")
    }
}
