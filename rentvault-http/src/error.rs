//! Gate-level errors.

use rentvault::error::ChainError;

/// Failures the gate cannot express as a 402 challenge.
///
/// Verification outcomes (mismatch, expired reference, pending transaction)
/// stay inside the gate and become 402 responses. What surfaces here is
/// infrastructure failure: the chain backend being unreachable must never be
/// laundered into "payment required".
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The chain client failed while verifying or minting a reference.
    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl GateError {
    /// HTTP status this error maps to: 503 for a transiently unreachable
    /// backend, 500 otherwise.
    #[must_use]
    pub const fn status(&self) -> http::StatusCode {
        match self {
            Self::Chain(ChainError::Unavailable(_)) => http::StatusCode::SERVICE_UNAVAILABLE,
            Self::Chain(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
