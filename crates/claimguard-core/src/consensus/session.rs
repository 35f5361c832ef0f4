//! Voting sessions and the session registry.
//!
//! A [`VotingSession`] holds at most one vote per model (later arrivals
//! overwrite) plus the cached snapshot derived from the current vote set.
//! The [`ConsensusEngine`] is the registry: sessions are serialized by id
//! under one lock, so concurrent external vote submissions for the same
//! session observe a total order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::snapshot::{compute_snapshot, ConsensusSnapshot, SnapshotParams};
use super::{ConsensusError, Vote};
use crate::claim::Domain;
use crate::config::ConsensusConfig;

/// Per-claim container of votes and the derived consensus snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotingSession {
    /// Session id; equal to the claim id.
    pub session_id: String,

    /// Domain the session's halt threshold was resolved from.
    pub domain: Option<Domain>,

    /// Votes keyed by model id.
    pub votes: BTreeMap<String, Vote>,

    /// Snapshot of the current vote set.
    pub snapshot: ConsensusSnapshot,

    /// Whether the session refuses further votes.
    pub sealed: bool,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last vote or seal timestamp.
    pub updated_at: DateTime<Utc>,
}

impl VotingSession {
    fn new(session_id: String, domain: Option<Domain>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            domain,
            votes: BTreeMap::new(),
            snapshot: ConsensusSnapshot::empty(),
            sealed: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The Shield Consensus Engine: a registry of voting sessions.
#[derive(Debug)]
pub struct ConsensusEngine {
    sessions: Mutex<HashMap<String, VotingSession>>,
    config: ConsensusConfig,
}

impl Default for ConsensusEngine {
    fn default() -> Self {
        Self::new(ConsensusConfig::default())
    }
}

impl ConsensusEngine {
    /// Creates an engine with the given thresholds.
    #[must_use]
    pub fn new(config: ConsensusConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn params_for(&self, domain: Option<Domain>) -> SnapshotParams {
        let halt_threshold = match domain {
            Some(d) => self
                .config
                .domain_thresholds
                .get(d.as_str())
                .copied()
                .unwrap_or_else(|| d.default_halt_threshold()),
            None => self.config.default_threshold,
        };
        SnapshotParams {
            sigma_var: self.config.sigma_var,
            min_votes: self.config.min_votes,
            halt_threshold,
        }
    }

    /// Opens a session for a claim, or reuses the open one.
    ///
    /// Re-opening an existing open session is a no-op so that a retried
    /// Verify stage resumes collecting into the same vote set.
    ///
    /// # Errors
    ///
    /// Returns [`ConsensusError::SessionSealed`] if the session was already
    /// finalized.
    pub fn open_session(
        &self,
        session_id: &str,
        domain: Option<Domain>,
    ) -> Result<(), ConsensusError> {
        let mut sessions = self.sessions.lock().expect("lock poisoned");
        if let Some(session) = sessions.get(session_id) {
            if session.sealed {
                return Err(ConsensusError::SessionSealed {
                    session_id: session_id.to_string(),
                });
            }
            return Ok(());
        }
        sessions.insert(
            session_id.to_string(),
            VotingSession::new(session_id.to_string(), domain),
        );
        Ok(())
    }

    /// Validates and upserts a vote, recomputes the snapshot, and returns
    /// it.
    ///
    /// At most one vote per model is kept; a later vote from the same model
    /// overwrites the earlier one with a monotonically advanced timestamp.
    ///
    /// # Errors
    ///
    /// - [`ConsensusError::InvalidVote`] on range or enum violations
    /// - [`ConsensusError::SessionNotFound`] for an unknown session
    /// - [`ConsensusError::SessionSealed`] once the session is finalized
    pub fn submit_vote(
        &self,
        session_id: &str,
        mut vote: Vote,
    ) -> Result<ConsensusSnapshot, ConsensusError> {
        vote.validate()?;

        let mut sessions = self.sessions.lock().expect("lock poisoned");
        let session =
            sessions
                .get_mut(session_id)
                .ok_or_else(|| ConsensusError::SessionNotFound {
                    session_id: session_id.to_string(),
                })?;
        if session.sealed {
            return Err(ConsensusError::SessionSealed {
                session_id: session_id.to_string(),
            });
        }

        // Overwrites never move time backwards.
        if let Some(previous) = session.votes.get(&vote.model_id) {
            if vote.received_at < previous.received_at {
                vote.received_at = previous.received_at;
            }
        }

        let params = self.params_for(session.domain);
        session.votes.insert(vote.model_id.clone(), vote);
        session.snapshot = compute_snapshot(&session.votes, &params);
        session.updated_at = Utc::now();
        Ok(session.snapshot.clone())
    }

    /// Returns the current snapshot for a session.
    ///
    /// # Errors
    ///
    /// Returns [`ConsensusError::SessionNotFound`] for an unknown session.
    pub fn snapshot(&self, session_id: &str) -> Result<ConsensusSnapshot, ConsensusError> {
        let sessions = self.sessions.lock().expect("lock poisoned");
        sessions
            .get(session_id)
            .map(|s| s.snapshot.clone())
            .ok_or_else(|| ConsensusError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Marks the session immutable and returns the final snapshot.
    ///
    /// Sealing an already-sealed session returns the final snapshot
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ConsensusError::SessionNotFound`] for an unknown session.
    pub fn seal(&self, session_id: &str) -> Result<ConsensusSnapshot, ConsensusError> {
        let mut sessions = self.sessions.lock().expect("lock poisoned");
        let session =
            sessions
                .get_mut(session_id)
                .ok_or_else(|| ConsensusError::SessionNotFound {
                    session_id: session_id.to_string(),
                })?;
        if !session.sealed {
            session.sealed = true;
            session.updated_at = Utc::now();
        }
        Ok(session.snapshot.clone())
    }

    /// Returns a full session copy, if present.
    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<VotingSession> {
        let sessions = self.sessions.lock().expect("lock poisoned");
        sessions.get(session_id).cloned()
    }
}
