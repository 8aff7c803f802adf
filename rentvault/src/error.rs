//! Error types for the payment ledger, escrow state machine, and chain client.
//!
//! Each concern gets its own `thiserror` enum so the HTTP layer can map every
//! variant to the correct status code. A replayed payment is deliberately *not*
//! an error: the ledger reports it as a successful, idempotent verification.

use uuid::Uuid;

use crate::escrow::EscrowStatus;

/// Errors surfaced by a [`ChainClient`](crate::chain::ChainClient) implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainError {
    /// The chain backend could not be reached or timed out. Transient; callers
    /// should retry with backoff. Never conflated with a payment mismatch.
    #[error("chain client unavailable: {0}")]
    Unavailable(String),

    /// The supplied address cannot be turned into a locking script.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The chain rejected a broadcast transaction.
    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),
}

/// Errors from payment reference creation and verification.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// No payment reference exists under the given id.
    #[error("payment reference {0} not found")]
    ReferenceNotFound(String),

    /// The reference exists but its expiry has passed; the caller must request
    /// a fresh 402 challenge.
    #[error("payment reference {0} expired")]
    ReferenceExpired(String),

    /// The reference was already consumed by a different transaction.
    #[error("payment reference {0} already consumed")]
    ReferenceConsumed(String),

    /// On-chain evidence does not satisfy the expected amount and recipient.
    #[error("payment mismatch: {0}")]
    Mismatch(String),

    /// The transaction is not yet visible on chain. Distinct from a mismatch:
    /// the caller should retry with the same reference once confirmed.
    #[error("transaction {0} not yet visible on chain")]
    TransactionPending(String),

    /// Underlying chain client failure.
    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl PaymentError {
    /// Whether the caller can retry the same request unchanged and expect it
    /// to eventually succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransactionPending(_) | Self::Chain(ChainError::Unavailable(_))
        )
    }
}

/// Errors from escrow state transitions and release finalization.
#[derive(Debug, thiserror::Error)]
pub enum EscrowError {
    /// No escrow contract exists under the given id.
    #[error("escrow {0} not found")]
    NotFound(Uuid),

    /// The operation is not permitted from the contract's current status.
    #[error("operation '{operation}' not permitted in state '{from}'")]
    InvalidTransition {
        /// Status the contract was in when the operation was attempted.
        from: EscrowStatus,
        /// Name of the rejected operation.
        operation: &'static str,
    },

    /// A release breakdown does not sum to the contract's total amount.
    /// Rejected before any state mutation.
    #[error("release breakdown sums to {actual}, expected {expected}")]
    FundsConservation {
        /// The contract's total amount.
        expected: u64,
        /// What the proposed breakdown actually sums to.
        actual: u64,
    },

    /// At creation, `total_amount` must equal `deposit_amount + rental_fee`.
    #[error("total {total} does not equal deposit {deposit} + fee {fee}")]
    InvalidAmounts {
        /// Declared total.
        total: u64,
        /// Declared deposit.
        deposit: u64,
        /// Declared rental fee.
        fee: u64,
    },

    /// The rental period end does not come after its start.
    #[error("rental period end must be after start")]
    InvalidPeriod,

    /// The funding transaction does not pay the full total to the escrow address.
    #[error("funding transaction {tx_id} pays {paid} of required {required}")]
    FundingMismatch {
        /// The offered funding transaction.
        tx_id: String,
        /// Amount actually paid to the escrow address.
        paid: u64,
        /// The contract's total amount.
        required: u64,
    },

    /// The funding transaction is not yet visible on chain; retryable.
    #[error("funding transaction {0} not yet visible on chain")]
    FundingPending(String),

    /// A breakdown routes funds to an arbitrator but none is assigned.
    #[error("breakdown pays an arbitrator but none is assigned")]
    NoArbitrator,

    /// The contract reached a terminal state without a release breakdown
    /// (pre-funding cancellation holds no funds).
    #[error("escrow {0} has no release breakdown")]
    NoBreakdown(Uuid),

    /// Another caller is currently broadcasting the release transaction.
    /// Retry shortly; the recorded transaction id will be returned.
    #[error("release already in flight for escrow {0}")]
    ReleaseInProgress(Uuid),

    /// Underlying chain client failure.
    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl EscrowError {
    /// Whether the caller can retry the same request unchanged.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FundingPending(_) | Self::ReleaseInProgress(_) | Self::Chain(ChainError::Unavailable(_))
        )
    }
}
