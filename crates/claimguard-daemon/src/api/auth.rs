//! API key authentication.

use axum::http::HeaderMap;

use super::error::ApiError;
use crate::state::{AppState, Principal, Role};

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Resolves the caller's principal from the request headers and counts the
/// request against the rate limit.
///
/// # Errors
///
/// - [`ApiError::Unauthenticated`] for a missing or unknown key
/// - [`ApiError::RateLimited`] when the key's request window is full
pub fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Principal, ApiError> {
    let key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthenticated)?;
    let principal = state
        .auth
        .resolve(key)
        .cloned()
        .ok_or(ApiError::Unauthenticated)?;
    state.quota.check_request(&principal.key_id)?;
    Ok(principal)
}

/// Authenticates and additionally requires a role.
///
/// # Errors
///
/// Returns [`ApiError::Forbidden`] when the key lacks the role, in
/// addition to the [`authenticate`] failures.
pub fn require_role(
    state: &AppState,
    headers: &HeaderMap,
    role: Role,
) -> Result<Principal, ApiError> {
    let principal = authenticate(state, headers)?;
    if !principal.has_role(role) {
        return Err(ApiError::Forbidden(format!(
            "key {} lacks the {role:?} role",
            principal.key_id
        )));
    }
    Ok(principal)
}
