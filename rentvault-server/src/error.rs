//! Error-to-status mapping for the escrow API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use rentvault::error::{ChainError, EscrowError};

/// Wraps engine errors for axum handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Escrow engine failure.
    #[error(transparent)]
    Escrow(#[from] EscrowError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let Self::Escrow(err) = self;
        let status = match &err {
            EscrowError::NotFound(_) => StatusCode::NOT_FOUND,
            EscrowError::InvalidTransition { .. }
            | EscrowError::ReleaseInProgress(_)
            | EscrowError::NoBreakdown(_) => StatusCode::CONFLICT,
            EscrowError::InvalidAmounts { .. }
            | EscrowError::InvalidPeriod
            | EscrowError::FundsConservation { .. }
            | EscrowError::NoArbitrator => StatusCode::UNPROCESSABLE_ENTITY,
            EscrowError::FundingMismatch { .. } | EscrowError::FundingPending(_) => {
                StatusCode::PAYMENT_REQUIRED
            }
            EscrowError::Chain(ChainError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            EscrowError::Chain(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": err.to_string(),
            "retryable": err.is_retryable(),
        });
        (status, axum::Json(body)).into_response()
    }
}
