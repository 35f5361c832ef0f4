//! API error type and status-code mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use claimguard_core::consensus::ConsensusError;
use claimguard_core::evidence::EvidenceError;
use claimguard_core::hitl::HitlError;
use claimguard_core::ledger::LedgerError;
use claimguard_core::pipeline::PipelineError;
use claimguard_core::quota::QuotaError;

/// Errors surfaced to API callers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// 400: malformed request.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// 401: missing or unknown API key.
    #[error("unauthenticated")]
    Unauthenticated,

    /// 402: quota exhausted on a priced tier.
    #[error("payment required")]
    PaymentRequired {
        /// Price per additional claim, decimal USD.
        price_usd: f64,
        /// Price currency.
        currency: &'static str,
    },

    /// 403: key lacks the required role.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// 403: quota exhausted on an unpriced tier.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// 404: no such claim, instance, session, or proof.
    #[error("not found: {0}")]
    NotFound(String),

    /// 409: already-resolved ticket or sealed session.
    #[error("conflict: {0}")]
    Conflict(String),

    /// 429: request rate exceeded.
    #[error("rate limited")]
    RateLimited {
        /// Seconds until the window resets.
        retry_after_secs: u64,
    },

    /// 500: internal failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// 503: a required dependency is unavailable.
    #[error("dependency unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    const fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid-input",
            Self::Unauthenticated => "unauthenticated",
            Self::PaymentRequired { .. } => "payment-required",
            Self::Forbidden(_) => "forbidden",
            Self::QuotaExceeded(_) => "quota-exceeded",
            Self::NotFound(_) => "not-found",
            Self::Conflict(_) => "conflict",
            Self::RateLimited { .. } => "rate-limited",
            Self::Internal(_) => "internal",
            Self::Unavailable(_) => "dependency-unavailable",
        }
    }

    const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::PaymentRequired { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::Forbidden(_) | Self::QuotaExceeded(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        match self {
            Self::PaymentRequired {
                price_usd,
                currency,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                [
                    ("X-Price", format!("{price_usd:.2}")),
                    ("X-Currency", currency.to_string()),
                ],
                body,
            )
                .into_response(),
            Self::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after_secs.to_string())],
                body,
            )
                .into_response(),
            ref other => (other.status(), body).into_response(),
        }
    }
}

impl From<QuotaError> for ApiError {
    fn from(error: QuotaError) -> Self {
        match error {
            QuotaError::PaymentRequired {
                price_usd,
                currency,
            } => Self::PaymentRequired {
                price_usd,
                currency,
            },
            QuotaError::QuotaExceeded { .. } => Self::QuotaExceeded(error.to_string()),
            QuotaError::RateLimited { retry_after_secs } => {
                Self::RateLimited { retry_after_secs }
            }
            _ => Self::Internal(error.to_string()),
        }
    }
}

impl From<ConsensusError> for ApiError {
    fn from(error: ConsensusError) -> Self {
        match error {
            ConsensusError::InvalidVote { .. } => Self::InvalidInput(error.to_string()),
            ConsensusError::SessionSealed { .. } => Self::Conflict(error.to_string()),
            ConsensusError::SessionNotFound { .. } => Self::NotFound(error.to_string()),
            _ => Self::Internal(error.to_string()),
        }
    }
}

impl From<HitlError> for ApiError {
    fn from(error: HitlError) -> Self {
        match error {
            HitlError::AlreadyResolved { .. } => Self::Conflict(error.to_string()),
            HitlError::NotFound { .. } => Self::NotFound(error.to_string()),
            HitlError::Storage(inner) => Self::Internal(inner.to_string()),
            _ => Self::Internal(error.to_string()),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::InstanceNotFound { .. } => Self::NotFound(error.to_string()),
            _ => Self::Internal(error.to_string()),
        }
    }
}

impl From<EvidenceError> for ApiError {
    fn from(error: EvidenceError) -> Self {
        match error {
            EvidenceError::NotFound { .. } => Self::NotFound(error.to_string()),
            _ => Self::Internal(error.to_string()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(error: PipelineError) -> Self {
        match error {
            PipelineError::Claim(inner) => Self::InvalidInput(inner.to_string()),
            PipelineError::Ledger(inner) => inner.into(),
            PipelineError::Gate(inner) => inner.into(),
            PipelineError::InvalidState { .. } => Self::Conflict(error.to_string()),
            _ => Self::Internal(error.to_string()),
        }
    }
}
