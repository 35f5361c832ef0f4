//! HTTP API surface.
//!
//! | Method | Path | Purpose | Auth |
//! |--------|------|---------|------|
//! | POST | `/v1/claims` | submit claim | submitter key |
//! | GET | `/v1/claims/{id}` | instance status | any key |
//! | POST | `/v1/claims/{id}/approve` | deliver approval | reviewer key |
//! | POST | `/v1/claims/{id}/reject` | deliver rejection | reviewer key |
//! | GET | `/v1/claims/{id}/proof` | signed proof bundle | any key |
//! | POST | `/v1/consensus/{session}/vote` | external vote | model key |
//! | GET | `/v1/consensus/{session}` | snapshot | any key |
//! | GET | `/health` | liveness summary | none |
//! | GET | `/metrics` | Prometheus metrics | none |

pub mod auth;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub use error::ApiError;

/// Maximum request body size (256 KB). Claims are text; anything larger is
/// a mistake or an attack.
const MAX_BODY_SIZE: usize = 256 * 1024;

/// Builds the daemon's router.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/claims", post(routes::submit_claim))
        .route("/v1/claims/{id}", get(routes::claim_status))
        .route("/v1/claims/{id}/approve", post(routes::approve_claim))
        .route("/v1/claims/{id}/reject", post(routes::reject_claim))
        .route("/v1/claims/{id}/proof", get(routes::claim_proof))
        .route("/v1/consensus/{session}/vote", post(routes::submit_vote))
        .route("/v1/consensus/{session}", get(routes::consensus_snapshot))
        .route("/health", get(routes::health))
        .route("/metrics", get(routes::metrics))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}
