//! Stage implementations.
//!
//! Each stage is a transformation parameterized by the dependency seams it
//! needs (gateway, index, evidence store, consensus engine), so every
//! stage is independently testable. The orchestrator owns retries,
//! timeouts, checkpointing, and audit events; stages only compute.

pub mod detect;
pub mod embed;
pub mod sanitize;
pub mod search;
pub mod sign;
pub mod verify;
