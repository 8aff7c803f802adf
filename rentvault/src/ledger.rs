//! Payment ledger: one-time payment references and replay-safe verification.
//!
//! The ledger owns two maps. References bind an expected payment (amount,
//! pay-to address, expiry) to a protected resource. Verification records are
//! the anti-replay bookkeeping: one record per on-chain transaction id, ever.
//! A transaction id that already has a record re-verifies successfully but is
//! flagged `replayed` so the caller knows not to grant anything new.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::chain::{ChainClient, TxLookup};
use crate::error::PaymentError;
use crate::timestamp::UnixTimestamp;

/// A single payable obligation: pay `expected_amount` to `pay_to_address`
/// before `expires_at` to unlock `resource_id`.
#[derive(Debug, Clone)]
pub struct PaymentReference {
    /// Opaque, globally unique reference id.
    pub id: String,
    /// The protected resource this payment unlocks.
    pub resource_id: String,
    /// Expected amount in the smallest currency unit.
    pub expected_amount: u64,
    /// Address the payment must be made to.
    pub pay_to_address: String,
    /// Creation time.
    pub created_at: UnixTimestamp,
    /// After this instant the reference is unusable.
    pub expires_at: UnixTimestamp,
    /// Set on first successful verification; a consumed reference never
    /// verifies a second, different transaction.
    pub consumed: bool,
}

/// Idempotency guard keyed by on-chain transaction id.
///
/// Presence of a record proves the transaction already granted access once.
#[derive(Debug, Clone)]
pub struct PaymentVerificationRecord {
    /// The on-chain transaction id. Unique across the ledger.
    pub transaction_id: String,
    /// The reference the payment was originally verified against.
    pub reference_id: String,
    /// The resource the payment originally unlocked.
    pub resource_id: String,
    /// When the first successful verification happened.
    pub verified_at: UnixTimestamp,
}

/// Outcome of a successful verification.
///
/// `replayed` distinguishes the first verification of a transaction from an
/// idempotent re-verification. On replay, `reference_id` and `resource_id`
/// describe the *original* grant, not whatever the caller passed in — the
/// gate uses this to refuse cross-resource token minting.
#[derive(Debug, Clone)]
pub struct Verification {
    /// The verified on-chain transaction id.
    pub transaction_id: String,
    /// Reference the payment was (originally) verified against.
    pub reference_id: String,
    /// Resource the payment (originally) unlocked.
    pub resource_id: String,
    /// True if a verification record already existed for this transaction.
    pub replayed: bool,
    /// Time of the first successful verification.
    pub verified_at: UnixTimestamp,
}

/// Tracks payment references and their verification / replay state.
pub struct PaymentLedger {
    chain: Arc<dyn ChainClient>,
    references: DashMap<String, PaymentReference>,
    verifications: DashMap<String, PaymentVerificationRecord>,
}

impl std::fmt::Debug for PaymentLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentLedger")
            .field("references", &self.references.len())
            .field("verifications", &self.verifications.len())
            .finish()
    }
}

impl PaymentLedger {
    /// Creates a ledger backed by the given chain client.
    #[must_use]
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self {
            chain,
            references: DashMap::new(),
            verifications: DashMap::new(),
        }
    }

    /// Allocates a fresh payment reference for `resource_id`.
    ///
    /// Expired unconsumed references are purged on each call, so repeated 402
    /// challenges do not leak unbounded storage.
    ///
    /// # Errors
    ///
    /// Returns [`PaymentError::Chain`] if address derivation fails.
    pub async fn create_reference(
        &self,
        resource_id: &str,
        amount: u64,
        ttl_secs: u64,
    ) -> Result<PaymentReference, PaymentError> {
        let now = UnixTimestamp::now();
        self.purge_expired(now);

        let pay_to_address = self.chain.derive_address().await?;
        let reference = PaymentReference {
            id: Uuid::new_v4().to_string(),
            resource_id: resource_id.to_owned(),
            expected_amount: amount,
            pay_to_address,
            created_at: now,
            expires_at: now + ttl_secs,
            consumed: false,
        };
        tracing::debug!(
            reference = %reference.id,
            resource = %resource_id,
            amount,
            "created payment reference"
        );
        self.references.insert(reference.id.clone(), reference.clone());
        Ok(reference)
    }

    /// Drops expired, unconsumed references.
    pub fn purge_expired(&self, now: UnixTimestamp) {
        self.references
            .retain(|_, r| r.consumed || !r.expires_at.is_past(now));
    }

    /// Looks up a reference by id.
    #[must_use]
    pub fn reference(&self, id: &str) -> Option<PaymentReference> {
        self.references.get(id).map(|r| r.clone())
    }

    /// Looks up the verification record for a transaction id.
    #[must_use]
    pub fn verification(&self, transaction_id: &str) -> Option<PaymentVerificationRecord> {
        self.verifications.get(transaction_id).map(|r| r.clone())
    }

    /// Verifies that `transaction_id` pays `expected_amount` to the address of
    /// reference `reference_id`.
    ///
    /// Linearizable per transaction id: the first successful verifier inserts
    /// the record; every later caller — concurrent or not, and regardless of
    /// which reference it names — observes the same granted outcome with
    /// `replayed = true`. The chain lookup runs before the insert so no map
    /// lock is held across an await.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::ReferenceNotFound`] / [`PaymentError::ReferenceExpired`] /
    ///   [`PaymentError::ReferenceConsumed`] — the reference is unusable.
    /// - [`PaymentError::Mismatch`] — no output pays at least the expected
    ///   amount to the reference's address.
    /// - [`PaymentError::TransactionPending`] — not yet visible; retryable.
    /// - [`PaymentError::Chain`] — backend failure; retryable.
    pub async fn verify_payment(
        &self,
        transaction_id: &str,
        reference_id: &str,
        expected_amount: u64,
    ) -> Result<Verification, PaymentError> {
        // Fast path: this transaction already granted access.
        if let Some(record) = self.verification(transaction_id) {
            return Ok(replayed(record));
        }

        let reference = self
            .reference(reference_id)
            .ok_or_else(|| PaymentError::ReferenceNotFound(reference_id.to_owned()))?;
        let now = UnixTimestamp::now();
        if reference.expires_at <= now {
            return Err(PaymentError::ReferenceExpired(reference_id.to_owned()));
        }
        if reference.consumed {
            return Err(PaymentError::ReferenceConsumed(reference_id.to_owned()));
        }

        let expected_script = self
            .chain
            .build_pay_to_script(&reference.pay_to_address, expected_amount)?;
        let outputs = match self.chain.fetch_transaction_outputs(transaction_id).await? {
            TxLookup::NotYetVisible => {
                return Err(PaymentError::TransactionPending(transaction_id.to_owned()));
            }
            TxLookup::Confirmed(outputs) => outputs,
        };

        // Exact-or-greater, never "close enough".
        let paid = outputs
            .iter()
            .any(|o| o.script == expected_script && o.amount >= expected_amount);
        if !paid {
            return Err(PaymentError::Mismatch(format!(
                "transaction {transaction_id} does not pay {expected_amount} to {}",
                reference.pay_to_address
            )));
        }

        // The chain lookup ran with no lock held, so a concurrent
        // verification with a *different* transaction may have consumed the
        // reference since the pre-check. Re-take the entry guard and decide
        // consumption under it.
        let mut reference_entry = self
            .references
            .get_mut(reference_id)
            .ok_or_else(|| PaymentError::ReferenceNotFound(reference_id.to_owned()))?;
        if reference_entry.consumed {
            // A racing call with the same transaction id is a replay, not a
            // consumption conflict.
            if let Some(record) = self.verification(transaction_id) {
                return Ok(replayed(record));
            }
            return Err(PaymentError::ReferenceConsumed(reference_id.to_owned()));
        }

        // Insert-if-absent on the transaction id decides the winner under
        // concurrent retries; a read-then-write pair would double-grant.
        let record = PaymentVerificationRecord {
            transaction_id: transaction_id.to_owned(),
            reference_id: reference_id.to_owned(),
            resource_id: reference.resource_id.clone(),
            verified_at: now,
        };
        let prior = match self.verifications.entry(transaction_id.to_owned()) {
            Entry::Occupied(existing) => Some(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                None
            }
        };
        if let Some(existing) = prior {
            return Ok(replayed(existing));
        }
        reference_entry.consumed = true;
        drop(reference_entry);

        tracing::info!(
            transaction = %transaction_id,
            reference = %reference_id,
            resource = %record.resource_id,
            "payment verified"
        );
        Ok(Verification {
            transaction_id: record.transaction_id,
            reference_id: record.reference_id,
            resource_id: record.resource_id,
            replayed: false,
            verified_at: record.verified_at,
        })
    }
}

fn replayed(record: PaymentVerificationRecord) -> Verification {
    Verification {
        transaction_id: record.transaction_id,
        reference_id: record.reference_id,
        resource_id: record.resource_id,
        replayed: true,
        verified_at: record.verified_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::chain::{LockingScript, ReleaseDraft, SandboxChain};
    use crate::error::ChainError;

    fn ledger() -> (Arc<SandboxChain>, PaymentLedger) {
        let chain = Arc::new(SandboxChain::new());
        let ledger = PaymentLedger::new(Arc::clone(&chain) as Arc<dyn ChainClient>);
        (chain, ledger)
    }

    #[tokio::test]
    async fn verifies_a_matching_payment_and_consumes_the_reference() {
        let (chain, ledger) = ledger();
        let reference = ledger.create_reference("asset-42", 10_000, 600).await.unwrap();
        let tx_id = chain.confirm_payment(&reference.pay_to_address, 10_000);

        let v = ledger
            .verify_payment(&tx_id, &reference.id, 10_000)
            .await
            .unwrap();
        assert!(!v.replayed);
        assert_eq!(v.resource_id, "asset-42");
        assert!(ledger.reference(&reference.id).unwrap().consumed);
    }

    #[tokio::test]
    async fn second_verification_is_idempotent_even_across_references() {
        let (chain, ledger) = ledger();
        let reference = ledger.create_reference("asset-42", 10_000, 600).await.unwrap();
        let other = ledger.create_reference("asset-99", 10_000, 600).await.unwrap();
        let tx_id = chain.confirm_payment(&reference.pay_to_address, 10_000);

        let first = ledger
            .verify_payment(&tx_id, &reference.id, 10_000)
            .await
            .unwrap();
        let second = ledger
            .verify_payment(&tx_id, &other.id, 10_000)
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        // The replay reports the original grant, not the second reference.
        assert_eq!(second.resource_id, "asset-42");
        assert_eq!(second.reference_id, reference.id);
        assert_eq!(
            ledger.verification(&tx_id).unwrap().reference_id,
            reference.id
        );
    }

    #[tokio::test]
    async fn concurrent_verification_grants_all_but_records_once() {
        let (chain, ledger) = ledger();
        let ledger = Arc::new(ledger);
        let reference = ledger.create_reference("asset-1", 5_000, 600).await.unwrap();
        let tx_id = chain.confirm_payment(&reference.pay_to_address, 5_000);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            let tx_id = tx_id.clone();
            let reference_id = reference.id.clone();
            handles.push(tokio::spawn(async move {
                ledger.verify_payment(&tx_id, &reference_id, 5_000).await
            }));
        }

        let mut first_grants = 0;
        for handle in handles {
            let v = handle.await.unwrap().unwrap();
            if !v.replayed {
                first_grants += 1;
            }
        }
        assert_eq!(first_grants, 1);
        assert!(ledger.verification(&tx_id).is_some());
    }

    /// Holds every transaction lookup at a barrier so two verifications are
    /// forced to interleave across the chain await.
    struct HeldLookupChain {
        inner: SandboxChain,
        barrier: tokio::sync::Barrier,
    }

    #[async_trait]
    impl ChainClient for HeldLookupChain {
        async fn derive_address(&self) -> Result<String, ChainError> {
            self.inner.derive_address().await
        }

        fn build_pay_to_script(
            &self,
            address: &str,
            amount: u64,
        ) -> Result<LockingScript, ChainError> {
            self.inner.build_pay_to_script(address, amount)
        }

        async fn fetch_transaction_outputs(&self, tx_id: &str) -> Result<TxLookup, ChainError> {
            self.barrier.wait().await;
            self.inner.fetch_transaction_outputs(tx_id).await
        }

        async fn sign_and_broadcast(&self, draft: ReleaseDraft) -> Result<String, ChainError> {
            self.inner.sign_and_broadcast(draft).await
        }
    }

    #[tokio::test]
    async fn concurrent_distinct_transactions_consume_the_reference_once() {
        let chain = Arc::new(HeldLookupChain {
            inner: SandboxChain::new(),
            barrier: tokio::sync::Barrier::new(2),
        });
        let ledger = Arc::new(PaymentLedger::new(
            Arc::clone(&chain) as Arc<dyn ChainClient>
        ));
        let reference = ledger.create_reference("asset-1", 1_000, 600).await.unwrap();
        let tx_a = chain.inner.confirm_payment(&reference.pay_to_address, 1_000);
        let tx_b = chain.inner.confirm_payment(&reference.pay_to_address, 1_000);

        // Both verifications pass the unconsumed pre-check and the chain
        // lookup before either records anything.
        let mut tasks = Vec::new();
        for tx in [tx_a, tx_b] {
            let ledger = Arc::clone(&ledger);
            let reference_id = reference.id.clone();
            tasks.push(tokio::spawn(async move {
                ledger.verify_payment(&tx, &reference_id, 1_000).await
            }));
        }

        let mut grants = 0;
        let mut consumed = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(v) => {
                    assert!(!v.replayed);
                    grants += 1;
                }
                Err(PaymentError::ReferenceConsumed(_)) => consumed += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(grants, 1);
        assert_eq!(consumed, 1);
        assert!(ledger.reference(&reference.id).unwrap().consumed);
    }

    #[tokio::test]
    async fn underpayment_is_a_mismatch() {
        let (chain, ledger) = ledger();
        let reference = ledger.create_reference("asset-42", 10_000, 600).await.unwrap();
        let tx_id = chain.confirm_payment(&reference.pay_to_address, 9_999);

        let err = ledger
            .verify_payment(&tx_id, &reference.id, 10_000)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Mismatch(_)));
        assert!(ledger.verification(&tx_id).is_none());
    }

    #[tokio::test]
    async fn overpayment_is_accepted() {
        let (chain, ledger) = ledger();
        let reference = ledger.create_reference("asset-42", 10_000, 600).await.unwrap();
        let tx_id = chain.confirm_payment(&reference.pay_to_address, 12_000);

        let v = ledger
            .verify_payment(&tx_id, &reference.id, 10_000)
            .await
            .unwrap();
        assert!(!v.replayed);
    }

    #[tokio::test]
    async fn invisible_transaction_is_pending_not_mismatched() {
        let (_, ledger) = ledger();
        let reference = ledger.create_reference("asset-42", 10_000, 600).await.unwrap();

        let err = ledger
            .verify_payment("tx-unbroadcast", &reference.id, 10_000)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::TransactionPending(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn unknown_reference_is_rejected() {
        let (chain, ledger) = ledger();
        let tx_id = chain.confirm_payment("sbx-nobody", 100);
        let err = ledger
            .verify_payment(&tx_id, "ref-missing", 100)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::ReferenceNotFound(_)));
    }

    #[tokio::test]
    async fn consumed_reference_rejects_a_different_transaction() {
        let (chain, ledger) = ledger();
        let reference = ledger.create_reference("asset-42", 1_000, 600).await.unwrap();
        let tx_a = chain.confirm_payment(&reference.pay_to_address, 1_000);
        let tx_b = chain.confirm_payment(&reference.pay_to_address, 1_000);

        ledger.verify_payment(&tx_a, &reference.id, 1_000).await.unwrap();
        let err = ledger
            .verify_payment(&tx_b, &reference.id, 1_000)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::ReferenceConsumed(_)));
    }

    #[tokio::test]
    async fn purge_drops_expired_unconsumed_references() {
        let (_, ledger) = ledger();
        let reference = ledger.create_reference("asset-42", 1_000, 0).await.unwrap();
        ledger.purge_expired(UnixTimestamp::now() + 5);
        assert!(ledger.reference(&reference.id).is_none());
    }
}
