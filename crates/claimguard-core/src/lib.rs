//! # claimguard-core
//!
//! Core library for claimguard - a distributed AI-claim verification
//! platform.
//!
//! This crate provides the building blocks for verifying natural-language
//! claims through Byzantine-fault-tolerant agreement among independent model
//! opinions, with a confidence-based halt discipline and a cryptographically
//! linked proof record for every accepted verdict.
//!
//! ## Features
//!
//! - **Shield Consensus**: Per-claim voting sessions with weighted BFT quorum
//!   math, Variance Halts, and Constitutional Halts
//! - **Durable Pipeline**: Checkpointed stage sequencing (sanitize, embed,
//!   search, verify, detect, sign) with per-stage retry policies
//! - **HITL Gate**: Suspendable review tickets with exactly-once decision
//!   delivery and deadline expiry
//! - **Proof Chain**: Hash-linked, Ed25519-signed proof records per domain
//! - **Audit Ledger**: Append-only SQLite event log
//!
//! ## Example
//!
//! ```rust
//! use claimguard_core::consensus::{ConsensusEngine, Vote, Verdict};
//! use claimguard_core::claim::Domain;
//!
//! let engine = ConsensusEngine::default();
//! engine.open_session("claim-1", Some(Domain::Vetproof)).unwrap();
//! let snapshot = engine
//!     .submit_vote("claim-1", Vote::new("model-a", Verdict::Verified, 0.9, 0.88, 1.0))
//!     .unwrap();
//! assert!(snapshot.no_quorum);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod claim;
pub mod config;
pub mod consensus;
pub mod evidence;
pub mod gateway;
pub mod health;
pub mod hitl;
pub mod index;
pub mod ledger;
pub mod pipeline;
pub mod proof;
pub mod quota;
pub mod trust;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::claim::{Claim, Domain, Priority};
    pub use crate::config::Config;
    pub use crate::consensus::{ConsensusEngine, ConsensusSnapshot, Verdict, Vote};
    pub use crate::pipeline::{PipelineOrchestrator, PipelineStatus, Stage};
    pub use crate::proof::{ProofBundle, ProofRecord};
}

pub use claim::{Claim, Domain, Priority};
pub use config::Config;
pub use consensus::{ConsensusEngine, ConsensusSnapshot};
pub use pipeline::PipelineOrchestrator;
