//! Chain client abstraction for address derivation, script construction,
//! transaction lookup, and broadcast.
//!
//! The engine never talks to a blockchain directly. Everything on-chain goes
//! through the [`ChainClient`] trait, injected at construction time into the
//! payment ledger, escrow service, and release coordinator. Production
//! deployments supply a real client; tests and sandbox mode supply
//! [`SandboxChain`]. No simulation logic lives anywhere else.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::ChainError;

/// An output locking script, opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockingScript(Vec<u8>);

impl LockingScript {
    /// Wraps raw script bytes.
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the raw script bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A single transaction output: an amount locked under a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    /// Amount in the smallest currency unit.
    pub amount: u64,
    /// The locking script the amount is paid to.
    pub script: LockingScript,
}

/// Result of a transaction lookup.
///
/// Chain confirmation is eventual: a transaction the client has broadcast may
/// not be visible yet. That state is reported explicitly so callers can treat
/// it as retryable instead of conflating it with an invalid payment.
#[derive(Debug, Clone)]
pub enum TxLookup {
    /// The transaction is confirmed with these outputs.
    Confirmed(Vec<TxOutput>),
    /// The transaction is not (yet) known to the chain backend.
    NotYetVisible,
}

/// An unsigned release transaction handed to the chain client for signing
/// and broadcast.
#[derive(Debug, Clone)]
pub struct ReleaseDraft {
    /// The escrow funding transaction being spent.
    pub funding_tx_id: String,
    /// Payout outputs, one per non-zero breakdown leg.
    pub outputs: Vec<TxOutput>,
}

/// Black-box interface to the on-chain transaction library.
///
/// Key management, multisig aggregation, and wire formats are the
/// implementation's concern; the engine only consumes these four semantics.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Derives a fresh receive address.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Unavailable`] if the backend cannot be reached.
    async fn derive_address(&self) -> Result<String, ChainError>;

    /// Builds the locking script paying `amount` to `address`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::InvalidAddress`] if the address is malformed.
    fn build_pay_to_script(&self, address: &str, amount: u64) -> Result<LockingScript, ChainError>;

    /// Fetches a transaction's outputs by id.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Unavailable`] on backend failure. An unknown
    /// transaction is *not* an error: it is [`TxLookup::NotYetVisible`].
    async fn fetch_transaction_outputs(&self, tx_id: &str) -> Result<TxLookup, ChainError>;

    /// Signs and broadcasts a release draft, returning the transaction id.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::BroadcastRejected`] if the chain refuses the
    /// transaction, or [`ChainError::Unavailable`] on backend failure.
    async fn sign_and_broadcast(&self, draft: ReleaseDraft) -> Result<String, ChainError>;
}

#[async_trait]
impl<T: ChainClient + ?Sized> ChainClient for Arc<T> {
    async fn derive_address(&self) -> Result<String, ChainError> {
        (**self).derive_address().await
    }

    fn build_pay_to_script(&self, address: &str, amount: u64) -> Result<LockingScript, ChainError> {
        (**self).build_pay_to_script(address, amount)
    }

    async fn fetch_transaction_outputs(&self, tx_id: &str) -> Result<TxLookup, ChainError> {
        (**self).fetch_transaction_outputs(tx_id).await
    }

    async fn sign_and_broadcast(&self, draft: ReleaseDraft) -> Result<String, ChainError> {
        (**self).sign_and_broadcast(draft).await
    }
}

/// In-memory [`ChainClient`] for tests and sandbox deployments.
///
/// Transactions exist only in this process. [`SandboxChain::confirm_payment`]
/// plays the role of an external payer: it records a confirmed transaction
/// paying `amount` to `address` and returns its id.
#[derive(Debug, Default)]
pub struct SandboxChain {
    transactions: DashMap<String, Vec<TxOutput>>,
    counter: AtomicU64,
}

impl SandboxChain {
    /// Creates an empty sandbox chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a confirmed transaction paying `amount` to `address`,
    /// returning its transaction id. Stand-in for an external wallet payment.
    pub fn confirm_payment(&self, address: &str, amount: u64) -> String {
        let tx_id = self.next_id("tx");
        let output = TxOutput {
            amount,
            script: sandbox_script(address),
        };
        self.transactions.insert(tx_id.clone(), vec![output]);
        tx_id
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{n:08x}")
    }
}

/// Sandbox locking scripts are just a tagged copy of the address bytes.
fn sandbox_script(address: &str) -> LockingScript {
    let mut bytes = b"p2a:".to_vec();
    bytes.extend_from_slice(address.as_bytes());
    LockingScript::new(bytes)
}

#[async_trait]
impl ChainClient for SandboxChain {
    async fn derive_address(&self) -> Result<String, ChainError> {
        Ok(self.next_id("sbx"))
    }

    fn build_pay_to_script(&self, address: &str, _amount: u64) -> Result<LockingScript, ChainError> {
        if address.is_empty() {
            return Err(ChainError::InvalidAddress("empty address".into()));
        }
        Ok(sandbox_script(address))
    }

    async fn fetch_transaction_outputs(&self, tx_id: &str) -> Result<TxLookup, ChainError> {
        Ok(self
            .transactions
            .get(tx_id)
            .map_or(TxLookup::NotYetVisible, |outputs| {
                TxLookup::Confirmed(outputs.clone())
            }))
    }

    async fn sign_and_broadcast(&self, draft: ReleaseDraft) -> Result<String, ChainError> {
        if draft.outputs.is_empty() {
            return Err(ChainError::BroadcastRejected("no outputs".into()));
        }
        let tx_id = self.next_id("tx");
        self.transactions.insert(tx_id.clone(), draft.outputs);
        Ok(tx_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_transaction_is_not_yet_visible() {
        let chain = SandboxChain::new();
        let lookup = chain.fetch_transaction_outputs("tx-missing").await.unwrap();
        assert!(matches!(lookup, TxLookup::NotYetVisible));
    }

    #[tokio::test]
    async fn confirmed_payment_is_visible_with_matching_script() {
        let chain = SandboxChain::new();
        let address = chain.derive_address().await.unwrap();
        let tx_id = chain.confirm_payment(&address, 10_000);

        let TxLookup::Confirmed(outputs) = chain.fetch_transaction_outputs(&tx_id).await.unwrap()
        else {
            panic!("expected confirmed transaction");
        };
        let expected = chain.build_pay_to_script(&address, 10_000).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].amount, 10_000);
        assert_eq!(outputs[0].script, expected);
    }

    #[tokio::test]
    async fn broadcast_rejects_empty_drafts() {
        let chain = SandboxChain::new();
        let draft = ReleaseDraft {
            funding_tx_id: "tx-0".into(),
            outputs: vec![],
        };
        assert!(matches!(
            chain.sign_and_broadcast(draft).await,
            Err(ChainError::BroadcastRejected(_))
        ));
    }

    #[tokio::test]
    async fn broadcast_makes_outputs_fetchable() {
        let chain = SandboxChain::new();
        let script = chain.build_pay_to_script("sbx-owner", 50).unwrap();
        let draft = ReleaseDraft {
            funding_tx_id: "tx-0".into(),
            outputs: vec![TxOutput { amount: 50, script }],
        };
        let tx_id = chain.sign_and_broadcast(draft).await.unwrap();
        let lookup = chain.fetch_transaction_outputs(&tx_id).await.unwrap();
        assert!(matches!(lookup, TxLookup::Confirmed(o) if o.len() == 1));
    }
}
