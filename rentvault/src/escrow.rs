//! Two-party escrow state machine for rental deposits and fees.
//!
//! Lifecycle: `created → funded → {completed | disputed | expired | cancelled}`,
//! with `disputed → arbitrated`. Completed, arbitrated, expired, and cancelled
//! are terminal: no signature or dispute mutation is accepted afterwards.
//!
//! Signatures are collected independently and out of order — the owner confirms
//! return of the item, the renter confirms receipt of the deposit, and neither
//! waits on the other. The transition to `completed` is decided under the same
//! per-contract lock that records the second signature, so two concurrent
//! "second signer" requests cannot both complete the contract.
//!
//! Expiry is time-triggered, not request-triggered: the `now > end + grace`
//! guard is re-evaluated lazily under the lock whenever a contract is read or
//! acted upon, and [`EscrowService::sweep_expired`] exists for a periodic pass.
//! Terminal transitions are published on a broadcast channel that consumers
//! (notification, indexing) subscribe to explicitly.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::chain::{ChainClient, TxLookup};
use crate::error::EscrowError;
use crate::timestamp::UnixTimestamp;

/// Status of an escrow contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    /// Created, awaiting the funding transaction.
    Created,
    /// Funding confirmed; deposit and fee are held.
    Funded,
    /// Both parties signed; standard breakdown applies. Terminal.
    Completed,
    /// A party raised a dispute; awaiting arbitration.
    Disputed,
    /// An arbitrator resolved the dispute. Terminal.
    Arbitrated,
    /// Rental period plus grace elapsed without completion or dispute. Terminal.
    Expired,
    /// Cancelled before funding. Terminal.
    Cancelled,
}

impl EscrowStatus {
    /// Whether this status admits no further mutation.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Arbitrated | Self::Expired | Self::Cancelled
        )
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Funded => "funded",
            Self::Completed => "completed",
            Self::Disputed => "disputed",
            Self::Arbitrated => "arbitrated",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One of the two escrow parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    /// The asset owner.
    Owner,
    /// The renter.
    Renter,
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Owner => "owner",
            Self::Renter => "renter",
        })
    }
}

/// The agreed rental window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RentalPeriod {
    /// Rental start.
    pub start: UnixTimestamp,
    /// Rental end; expiry is measured from here.
    pub end: UnixTimestamp,
}

/// Release signatures collected so far. Owned by the contract; no external
/// mutation path exists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Signatures {
    /// The owner's release signature, once supplied.
    pub owner: Option<String>,
    /// The renter's release signature, once supplied.
    pub renter: Option<String>,
}

impl Signatures {
    /// Whether the given party has already signed.
    #[must_use]
    pub const fn signed_by(&self, party: Party) -> bool {
        match party {
            Party::Owner => self.owner.is_some(),
            Party::Renter => self.renter.is_some(),
        }
    }

    /// Whether both parties have signed.
    #[must_use]
    pub const fn complete(&self) -> bool {
        self.owner.is_some() && self.renter.is_some()
    }
}

/// A piece of dispute evidence. Closed set of shapes so resolution logic
/// cannot misinterpret untyped metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    /// A hosted photo.
    Photo {
        /// Where the photo can be fetched.
        url: String,
    },
    /// A hosted document.
    Document {
        /// Where the document can be fetched.
        url: String,
    },
    /// A free-text statement from the raising party.
    Message {
        /// The statement.
        body: String,
    },
    /// A reference to an on-chain transaction.
    TransactionRef {
        /// The transaction id.
        tx_id: String,
    },
}

/// Dispute metadata recorded when a party contests the rental outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    /// Which party raised the dispute.
    pub raised_by: Party,
    /// Why.
    pub reason: String,
    /// Supporting evidence.
    pub evidence: Vec<Evidence>,
    /// When the dispute was raised.
    pub raised_at: UnixTimestamp,
    /// Filled in by arbitration.
    pub resolution: Option<Resolution>,
}

/// Outcome of arbitration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    /// Identity of the resolving arbitrator.
    pub resolved_by: String,
    /// Human-readable resolution summary.
    pub summary: String,
    /// When the dispute was resolved.
    pub resolved_at: UnixTimestamp,
}

/// How the held total is paid out at release. Must conserve the contract's
/// `total_amount`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseBreakdown {
    /// Amount paid to the owner.
    pub to_owner: u64,
    /// Amount paid to the renter.
    pub to_renter: u64,
    /// Amount paid to the arbitrator, if any.
    pub to_arbitrator: u64,
}

impl ReleaseBreakdown {
    /// The standard no-dispute split: the fee to the owner, the deposit back
    /// to the renter.
    #[must_use]
    pub const fn standard(deposit: u64, fee: u64) -> Self {
        Self {
            to_owner: fee,
            to_renter: deposit,
            to_arbitrator: 0,
        }
    }

    /// Sum of all legs, or `None` if the sum overflows `u64`.
    ///
    /// Amounts arrive from API callers; a wrapping sum would let legs far
    /// exceeding the held total pass the conservation check.
    #[must_use]
    pub const fn total(self) -> Option<u64> {
        match self.to_owner.checked_add(self.to_renter) {
            Some(sum) => sum.checked_add(self.to_arbitrator),
            None => None,
        }
    }

    /// Whether the breakdown sums exactly to `total_amount`. An overflowing
    /// breakdown conserves nothing.
    #[must_use]
    pub const fn conserves(self, total_amount: u64) -> bool {
        match self.total() {
            Some(sum) => sum == total_amount,
            None => false,
        }
    }
}

/// Default payout applied when a funded escrow expires unresolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryPolicy {
    /// Return the full amount to the renter. The conservative default: the
    /// owner never confirmed completion.
    #[default]
    RefundRenter,
    /// Treat silence as completion: fee to the owner, deposit to the renter.
    StandardSplit,
}

impl ExpiryPolicy {
    /// The breakdown this policy produces for the given amounts.
    #[must_use]
    pub const fn breakdown(self, deposit: u64, fee: u64) -> ReleaseBreakdown {
        match self {
            Self::RefundRenter => ReleaseBreakdown {
                to_owner: 0,
                to_renter: deposit.saturating_add(fee),
                to_arbitrator: 0,
            },
            Self::StandardSplit => ReleaseBreakdown::standard(deposit, fee),
        }
    }
}

/// Escrow service configuration.
#[derive(Debug, Clone, Copy)]
pub struct EscrowConfig {
    /// Seconds past `period.end` before a funded contract may expire.
    pub grace_secs: u64,
    /// Payout policy applied on expiry.
    pub expiry_policy: ExpiryPolicy,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            grace_secs: 86_400,
            expiry_policy: ExpiryPolicy::default(),
        }
    }
}

/// The two-party fund-holding agreement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowContract {
    /// Unique contract id.
    pub escrow_id: Uuid,
    /// The rented asset.
    pub asset_id: String,
    /// Owner payout key.
    pub owner_key: String,
    /// Renter payout key.
    pub renter_key: String,
    /// Optional third-party arbitrator payout key.
    pub arbitrator_key: Option<String>,
    /// The rental window.
    pub period: RentalPeriod,
    /// Deposit held for the renter.
    pub deposit_amount: u64,
    /// Fee owed to the owner.
    pub rental_fee: u64,
    /// Always `deposit_amount + rental_fee`.
    pub total_amount: u64,
    /// Address the funding transaction must pay.
    pub escrow_address: String,
    /// The confirmed funding transaction, once funded.
    pub funding_tx_id: Option<String>,
    /// The broadcast release transaction, once finalized.
    pub release_tx_id: Option<String>,
    /// Current lifecycle status.
    pub status: EscrowStatus,
    /// Release signatures collected so far.
    pub signatures: Signatures,
    /// Dispute metadata, if one was raised.
    pub dispute: Option<Dispute>,
    /// Payout split, set when the contract reaches a fund-holding terminal state.
    pub release_breakdown: Option<ReleaseBreakdown>,
    /// Creation time.
    pub created_at: UnixTimestamp,
    /// Last mutation time.
    pub updated_at: UnixTimestamp,
}

/// Request to open a new escrow contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEscrow {
    /// The rented asset.
    pub asset_id: String,
    /// Owner payout key.
    pub owner_key: String,
    /// Renter payout key.
    pub renter_key: String,
    /// Optional arbitrator payout key.
    pub arbitrator_key: Option<String>,
    /// The rental window.
    pub period: RentalPeriod,
    /// Deposit amount.
    pub deposit_amount: u64,
    /// Rental fee.
    pub rental_fee: u64,
    /// Declared total; must equal deposit + fee.
    pub total_amount: u64,
}

/// Published whenever a contract reaches a terminal status.
#[derive(Debug, Clone)]
pub struct EscrowEvent {
    /// The contract that transitioned.
    pub escrow_id: Uuid,
    /// The terminal status it reached.
    pub status: EscrowStatus,
    /// The payout split, if the terminal state holds funds.
    pub breakdown: Option<ReleaseBreakdown>,
}

/// Owns all escrow contracts and enforces their state machine.
pub struct EscrowService {
    chain: Arc<dyn ChainClient>,
    config: EscrowConfig,
    contracts: DashMap<Uuid, EscrowContract>,
    events: broadcast::Sender<EscrowEvent>,
}

impl fmt::Debug for EscrowService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscrowService")
            .field("config", &self.config)
            .field("contracts", &self.contracts.len())
            .finish()
    }
}

impl EscrowService {
    /// Creates a service backed by the given chain client.
    #[must_use]
    pub fn new(chain: Arc<dyn ChainClient>, config: EscrowConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            chain,
            config,
            contracts: DashMap::new(),
            events,
        }
    }

    /// Subscribes to terminal-state transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EscrowEvent> {
        self.events.subscribe()
    }

    /// Reads a contract, applying lazy expiry first.
    #[must_use]
    pub fn contract(&self, escrow_id: Uuid) -> Option<EscrowContract> {
        let mut entry = self.contracts.get_mut(&escrow_id)?;
        self.maybe_expire(&mut entry, UnixTimestamp::now());
        Some(entry.clone())
    }

    /// Opens a new contract in `created` status.
    ///
    /// # Errors
    ///
    /// [`EscrowError::InvalidAmounts`] if `total != deposit + fee`,
    /// [`EscrowError::InvalidPeriod`] if the period is inverted or empty,
    /// [`EscrowError::Chain`] if escrow address derivation fails.
    pub async fn create(&self, req: CreateEscrow) -> Result<EscrowContract, EscrowError> {
        if req.deposit_amount.checked_add(req.rental_fee) != Some(req.total_amount) {
            return Err(EscrowError::InvalidAmounts {
                total: req.total_amount,
                deposit: req.deposit_amount,
                fee: req.rental_fee,
            });
        }
        if req.period.end <= req.period.start {
            return Err(EscrowError::InvalidPeriod);
        }

        let escrow_address = self.chain.derive_address().await?;
        let now = UnixTimestamp::now();
        let contract = EscrowContract {
            escrow_id: Uuid::new_v4(),
            asset_id: req.asset_id,
            owner_key: req.owner_key,
            renter_key: req.renter_key,
            arbitrator_key: req.arbitrator_key,
            period: req.period,
            deposit_amount: req.deposit_amount,
            rental_fee: req.rental_fee,
            total_amount: req.total_amount,
            escrow_address,
            funding_tx_id: None,
            release_tx_id: None,
            status: EscrowStatus::Created,
            signatures: Signatures::default(),
            dispute: None,
            release_breakdown: None,
            created_at: now,
            updated_at: now,
        };
        tracing::info!(
            escrow = %contract.escrow_id,
            asset = %contract.asset_id,
            total = contract.total_amount,
            "escrow created"
        );
        self.contracts
            .insert(contract.escrow_id, contract.clone());
        Ok(contract)
    }

    /// Confirms the funding transaction and moves `created → funded`.
    ///
    /// The chain lookup happens with no lock held; the status guard is
    /// re-checked under the lock before the transition is applied.
    ///
    /// # Errors
    ///
    /// [`EscrowError::FundingPending`] if the transaction is not yet visible
    /// (retryable), [`EscrowError::FundingMismatch`] if it does not pay the
    /// full total to the escrow address, [`EscrowError::InvalidTransition`]
    /// from any status but `created`.
    pub async fn fund(
        &self,
        escrow_id: Uuid,
        funding_tx_id: &str,
    ) -> Result<EscrowContract, EscrowError> {
        let (escrow_address, total_amount) = {
            let entry = self
                .contracts
                .get(&escrow_id)
                .ok_or(EscrowError::NotFound(escrow_id))?;
            if entry.status != EscrowStatus::Created {
                return Err(EscrowError::InvalidTransition {
                    from: entry.status,
                    operation: "fund",
                });
            }
            (entry.escrow_address.clone(), entry.total_amount)
        };

        let expected_script = self
            .chain
            .build_pay_to_script(&escrow_address, total_amount)?;
        let outputs = match self.chain.fetch_transaction_outputs(funding_tx_id).await? {
            TxLookup::NotYetVisible => {
                return Err(EscrowError::FundingPending(funding_tx_id.to_owned()));
            }
            TxLookup::Confirmed(outputs) => outputs,
        };
        let paid: u64 = outputs
            .iter()
            .filter(|o| o.script == expected_script)
            .map(|o| o.amount)
            .sum();
        if paid < total_amount {
            return Err(EscrowError::FundingMismatch {
                tx_id: funding_tx_id.to_owned(),
                paid,
                required: total_amount,
            });
        }

        let mut entry = self
            .contracts
            .get_mut(&escrow_id)
            .ok_or(EscrowError::NotFound(escrow_id))?;
        if entry.status != EscrowStatus::Created {
            return Err(EscrowError::InvalidTransition {
                from: entry.status,
                operation: "fund",
            });
        }
        entry.status = EscrowStatus::Funded;
        entry.funding_tx_id = Some(funding_tx_id.to_owned());
        entry.updated_at = UnixTimestamp::now();
        tracing::info!(escrow = %escrow_id, tx = %funding_tx_id, paid, "escrow funded");
        Ok(entry.clone())
    }

    /// Cancels an unfunded contract. Terminal; holds no funds, so no
    /// breakdown is produced.
    ///
    /// # Errors
    ///
    /// [`EscrowError::InvalidTransition`] from any status but `created`.
    pub fn cancel(&self, escrow_id: Uuid) -> Result<EscrowContract, EscrowError> {
        let mut entry = self
            .contracts
            .get_mut(&escrow_id)
            .ok_or(EscrowError::NotFound(escrow_id))?;
        if entry.status != EscrowStatus::Created {
            return Err(EscrowError::InvalidTransition {
                from: entry.status,
                operation: "cancel",
            });
        }
        entry.status = EscrowStatus::Cancelled;
        entry.updated_at = UnixTimestamp::now();
        tracing::info!(escrow = %escrow_id, "escrow cancelled");
        self.publish(&entry);
        Ok(entry.clone())
    }

    /// Records a party's release signature. Idempotent per party: re-signing
    /// is a no-op, not an error. When both signatures are present the contract
    /// auto-transitions to `completed` with the standard breakdown, decided
    /// under the same lock that recorded the signature.
    ///
    /// # Errors
    ///
    /// [`EscrowError::InvalidTransition`] from any status but `funded`
    /// (a dispute also blocks standard signing).
    pub fn sign_release(
        &self,
        escrow_id: Uuid,
        party: Party,
        signature: &str,
    ) -> Result<EscrowContract, EscrowError> {
        let now = UnixTimestamp::now();
        let mut entry = self
            .contracts
            .get_mut(&escrow_id)
            .ok_or(EscrowError::NotFound(escrow_id))?;
        self.maybe_expire(&mut entry, now);
        if entry.status != EscrowStatus::Funded {
            return Err(EscrowError::InvalidTransition {
                from: entry.status,
                operation: "sign_release",
            });
        }
        if entry.signatures.signed_by(party) {
            return Ok(entry.clone());
        }
        match party {
            Party::Owner => entry.signatures.owner = Some(signature.to_owned()),
            Party::Renter => entry.signatures.renter = Some(signature.to_owned()),
        }
        entry.updated_at = now;
        tracing::info!(escrow = %escrow_id, %party, "release signed");

        if entry.signatures.complete() {
            entry.status = EscrowStatus::Completed;
            entry.release_breakdown = Some(ReleaseBreakdown::standard(
                entry.deposit_amount,
                entry.rental_fee,
            ));
            tracing::info!(escrow = %escrow_id, "escrow completed");
            self.publish(&entry);
        }
        Ok(entry.clone())
    }

    /// Raises a dispute on a funded contract. Standard release signing is no
    /// longer accepted afterwards.
    ///
    /// # Errors
    ///
    /// [`EscrowError::InvalidTransition`] from any status but `funded`.
    pub fn raise_dispute(
        &self,
        escrow_id: Uuid,
        raised_by: Party,
        reason: String,
        evidence: Vec<Evidence>,
    ) -> Result<EscrowContract, EscrowError> {
        let now = UnixTimestamp::now();
        let mut entry = self
            .contracts
            .get_mut(&escrow_id)
            .ok_or(EscrowError::NotFound(escrow_id))?;
        self.maybe_expire(&mut entry, now);
        if entry.status != EscrowStatus::Funded {
            return Err(EscrowError::InvalidTransition {
                from: entry.status,
                operation: "raise_dispute",
            });
        }
        entry.dispute = Some(Dispute {
            raised_by,
            reason,
            evidence,
            raised_at: now,
            resolution: None,
        });
        entry.status = EscrowStatus::Disputed;
        entry.updated_at = now;
        tracing::warn!(escrow = %escrow_id, party = %raised_by, "dispute raised");
        Ok(entry.clone())
    }

    /// Resolves a dispute with an arbitrator-chosen breakdown. The breakdown
    /// is validated for conservation *before* any state is touched.
    ///
    /// # Errors
    ///
    /// [`EscrowError::FundsConservation`] if the breakdown does not sum to the
    /// total, [`EscrowError::NoArbitrator`] if it pays an unassigned
    /// arbitrator, [`EscrowError::InvalidTransition`] from any status but
    /// `disputed`.
    pub fn resolve_dispute(
        &self,
        escrow_id: Uuid,
        resolved_by: &str,
        summary: String,
        breakdown: ReleaseBreakdown,
    ) -> Result<EscrowContract, EscrowError> {
        let now = UnixTimestamp::now();
        let mut entry = self
            .contracts
            .get_mut(&escrow_id)
            .ok_or(EscrowError::NotFound(escrow_id))?;
        if entry.status != EscrowStatus::Disputed {
            return Err(EscrowError::InvalidTransition {
                from: entry.status,
                operation: "resolve_dispute",
            });
        }
        if !breakdown.conserves(entry.total_amount) {
            let actual = breakdown
                .to_owner
                .saturating_add(breakdown.to_renter)
                .saturating_add(breakdown.to_arbitrator);
            return Err(EscrowError::FundsConservation {
                expected: entry.total_amount,
                actual,
            });
        }
        if breakdown.to_arbitrator > 0 && entry.arbitrator_key.is_none() {
            return Err(EscrowError::NoArbitrator);
        }

        if let Some(dispute) = entry.dispute.as_mut() {
            dispute.resolution = Some(Resolution {
                resolved_by: resolved_by.to_owned(),
                summary,
                resolved_at: now,
            });
        }
        entry.status = EscrowStatus::Arbitrated;
        entry.release_breakdown = Some(breakdown);
        entry.updated_at = now;
        tracing::info!(escrow = %escrow_id, arbitrator = %resolved_by, "dispute resolved");
        self.publish(&entry);
        Ok(entry.clone())
    }

    /// Applies lazy expiry to every funded contract. Returns how many expired.
    pub fn sweep_expired(&self) -> usize {
        let now = UnixTimestamp::now();
        let mut expired = 0;
        for mut entry in self.contracts.iter_mut() {
            let before = entry.status;
            self.maybe_expire(&mut entry, now);
            if before != entry.status {
                expired += 1;
            }
        }
        expired
    }

    /// Records the broadcast release transaction id. First write wins.
    pub(crate) fn record_release(&self, escrow_id: Uuid, tx_id: &str) {
        if let Some(mut entry) = self.contracts.get_mut(&escrow_id) {
            if entry.release_tx_id.is_none() {
                entry.release_tx_id = Some(tx_id.to_owned());
                entry.updated_at = UnixTimestamp::now();
            }
        }
    }

    /// The `now > end + grace` guard, evaluated at transition time under the
    /// caller's lock. Only funded contracts expire.
    fn maybe_expire(&self, contract: &mut EscrowContract, now: UnixTimestamp) {
        if contract.status != EscrowStatus::Funded {
            return;
        }
        let deadline = contract.period.end + self.config.grace_secs;
        if !deadline.is_past(now) {
            return;
        }
        contract.status = EscrowStatus::Expired;
        contract.release_breakdown = Some(
            self.config
                .expiry_policy
                .breakdown(contract.deposit_amount, contract.rental_fee),
        );
        contract.updated_at = now;
        tracing::info!(
            escrow = %contract.escrow_id,
            policy = ?self.config.expiry_policy,
            "escrow expired"
        );
        self.publish(contract);
    }

    /// Broadcast is best-effort: no subscribers is fine.
    fn publish(&self, contract: &EscrowContract) {
        let _ = self.events.send(EscrowEvent {
            escrow_id: contract.escrow_id,
            status: contract.status,
            breakdown: contract.release_breakdown,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SandboxChain;

    fn service() -> (Arc<SandboxChain>, EscrowService) {
        service_with(EscrowConfig::default())
    }

    fn service_with(config: EscrowConfig) -> (Arc<SandboxChain>, EscrowService) {
        let chain = Arc::new(SandboxChain::new());
        let service = EscrowService::new(Arc::clone(&chain) as Arc<dyn ChainClient>, config);
        (chain, service)
    }

    fn request() -> CreateEscrow {
        let now = UnixTimestamp::now();
        CreateEscrow {
            asset_id: "asset-42".into(),
            owner_key: "key-owner".into(),
            renter_key: "key-renter".into(),
            arbitrator_key: Some("key-arbitrator".into()),
            period: RentalPeriod {
                start: now,
                end: now + 3_600,
            },
            deposit_amount: 500,
            rental_fee: 50,
            total_amount: 550,
        }
    }

    async fn funded(chain: &SandboxChain, service: &EscrowService) -> EscrowContract {
        let contract = service.create(request()).await.unwrap();
        let tx = chain.confirm_payment(&contract.escrow_address, contract.total_amount);
        service.fund(contract.escrow_id, &tx).await.unwrap()
    }

    #[test]
    fn wrapped_breakdowns_conserve_nothing() {
        let wrapped = ReleaseBreakdown {
            to_owner: u64::MAX,
            to_renter: 551,
            to_arbitrator: 0,
        };
        assert!(wrapped.total().is_none());
        assert!(!wrapped.conserves(550));
    }

    #[tokio::test]
    async fn create_rejects_overflowing_totals() {
        let (_, service) = service();
        let mut req = request();
        req.deposit_amount = u64::MAX;
        req.rental_fee = 1;
        // deposit + fee wraps modulo 2^64 to exactly this declared total.
        req.total_amount = 0;
        let err = service.create(req).await.unwrap_err();
        assert!(matches!(err, EscrowError::InvalidAmounts { .. }));
    }

    #[tokio::test]
    async fn create_rejects_non_conserving_totals() {
        let (_, service) = service();
        let mut req = request();
        req.total_amount = 500;
        let err = service.create(req).await.unwrap_err();
        assert!(matches!(err, EscrowError::InvalidAmounts { .. }));
    }

    #[tokio::test]
    async fn funding_requires_full_payment_to_escrow_address() {
        let (chain, service) = service();
        let contract = service.create(request()).await.unwrap();
        let tx = chain.confirm_payment(&contract.escrow_address, 549);

        let err = service.fund(contract.escrow_id, &tx).await.unwrap_err();
        assert!(matches!(
            err,
            EscrowError::FundingMismatch { paid: 549, required: 550, .. }
        ));
        assert_eq!(
            service.contract(contract.escrow_id).unwrap().status,
            EscrowStatus::Created
        );
    }

    #[tokio::test]
    async fn funding_with_invisible_transaction_is_retryable() {
        let (_, service) = service();
        let contract = service.create(request()).await.unwrap();
        let err = service
            .fund(contract.escrow_id, "tx-unbroadcast")
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::FundingPending(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn both_signatures_complete_with_standard_breakdown() {
        let (chain, service) = service();
        let contract = funded(&chain, &service).await;

        service
            .sign_release(contract.escrow_id, Party::Owner, "sig-o")
            .unwrap();
        let done = service
            .sign_release(contract.escrow_id, Party::Renter, "sig-r")
            .unwrap();

        assert_eq!(done.status, EscrowStatus::Completed);
        assert_eq!(
            done.release_breakdown.unwrap(),
            ReleaseBreakdown {
                to_owner: 50,
                to_renter: 500,
                to_arbitrator: 0
            }
        );
    }

    #[tokio::test]
    async fn signing_order_is_commutative() {
        let (chain, service) = service();
        let a = funded(&chain, &service).await;
        let b = funded(&chain, &service).await;

        service.sign_release(a.escrow_id, Party::Owner, "sig-o").unwrap();
        let a_done = service.sign_release(a.escrow_id, Party::Renter, "sig-r").unwrap();

        service.sign_release(b.escrow_id, Party::Renter, "sig-r").unwrap();
        let b_done = service.sign_release(b.escrow_id, Party::Owner, "sig-o").unwrap();

        assert_eq!(a_done.status, b_done.status);
        assert_eq!(a_done.release_breakdown, b_done.release_breakdown);
    }

    #[tokio::test]
    async fn resigning_is_a_noop() {
        let (chain, service) = service();
        let contract = funded(&chain, &service).await;

        service
            .sign_release(contract.escrow_id, Party::Owner, "sig-1")
            .unwrap();
        let again = service
            .sign_release(contract.escrow_id, Party::Owner, "sig-2")
            .unwrap();

        assert_eq!(again.status, EscrowStatus::Funded);
        assert_eq!(again.signatures.owner.as_deref(), Some("sig-1"));
    }

    #[tokio::test]
    async fn signing_an_unfunded_contract_is_rejected() {
        let (_, service) = service();
        let contract = service.create(request()).await.unwrap();
        let err = service
            .sign_release(contract.escrow_id, Party::Owner, "sig")
            .unwrap_err();
        assert!(matches!(
            err,
            EscrowError::InvalidTransition {
                from: EscrowStatus::Created,
                operation: "sign_release"
            }
        ));
    }

    #[tokio::test]
    async fn dispute_blocks_standard_signing() {
        let (chain, service) = service();
        let contract = funded(&chain, &service).await;

        service
            .raise_dispute(
                contract.escrow_id,
                Party::Renter,
                "item damaged".into(),
                vec![Evidence::Message {
                    body: "scratches on return".into(),
                }],
            )
            .unwrap();

        let err = service
            .sign_release(contract.escrow_id, Party::Owner, "sig")
            .unwrap_err();
        assert!(matches!(
            err,
            EscrowError::InvalidTransition {
                from: EscrowStatus::Disputed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn non_conserving_resolution_is_rejected_without_mutation() {
        let (chain, service) = service();
        let contract = funded(&chain, &service).await;
        service
            .raise_dispute(contract.escrow_id, Party::Owner, "no return".into(), vec![])
            .unwrap();

        let short = ReleaseBreakdown {
            to_owner: 500,
            to_renter: 0,
            to_arbitrator: 0,
        };
        let err = service
            .resolve_dispute(contract.escrow_id, "arb-1", "owner favored".into(), short)
            .unwrap_err();
        assert!(matches!(
            err,
            EscrowError::FundsConservation {
                expected: 550,
                actual: 500
            }
        ));

        let unchanged = service.contract(contract.escrow_id).unwrap();
        assert_eq!(unchanged.status, EscrowStatus::Disputed);
        assert!(unchanged.release_breakdown.is_none());
        assert!(unchanged.dispute.unwrap().resolution.is_none());
    }

    #[tokio::test]
    async fn overflowing_resolution_is_rejected_without_mutation() {
        let (chain, service) = service();
        let contract = funded(&chain, &service).await;
        service
            .raise_dispute(contract.escrow_id, Party::Renter, "wrap".into(), vec![])
            .unwrap();

        // Legs wrap modulo 2^64 to exactly the 550 contract total.
        let wrapped = ReleaseBreakdown {
            to_owner: u64::MAX,
            to_renter: 551,
            to_arbitrator: 0,
        };
        let err = service
            .resolve_dispute(contract.escrow_id, "arb-1", "owner favored".into(), wrapped)
            .unwrap_err();
        assert!(matches!(
            err,
            EscrowError::FundsConservation { expected: 550, .. }
        ));

        let unchanged = service.contract(contract.escrow_id).unwrap();
        assert_eq!(unchanged.status, EscrowStatus::Disputed);
        assert!(unchanged.release_breakdown.is_none());
    }

    #[tokio::test]
    async fn arbitration_records_resolution_and_breakdown() {
        let (chain, service) = service();
        let contract = funded(&chain, &service).await;
        service
            .raise_dispute(contract.escrow_id, Party::Owner, "late return".into(), vec![])
            .unwrap();

        let split = ReleaseBreakdown {
            to_owner: 300,
            to_renter: 200,
            to_arbitrator: 50,
        };
        let done = service
            .resolve_dispute(contract.escrow_id, "arb-1", "split".into(), split)
            .unwrap();

        assert_eq!(done.status, EscrowStatus::Arbitrated);
        assert_eq!(done.release_breakdown, Some(split));
        assert_eq!(
            done.dispute.unwrap().resolution.unwrap().resolved_by,
            "arb-1"
        );
    }

    #[tokio::test]
    async fn terminal_contracts_reject_every_mutation() {
        let (chain, service) = service();
        let contract = funded(&chain, &service).await;
        service.sign_release(contract.escrow_id, Party::Owner, "o").unwrap();
        service.sign_release(contract.escrow_id, Party::Renter, "r").unwrap();

        assert!(matches!(
            service.sign_release(contract.escrow_id, Party::Owner, "o"),
            Err(EscrowError::InvalidTransition { .. })
        ));
        assert!(matches!(
            service.raise_dispute(contract.escrow_id, Party::Owner, "x".into(), vec![]),
            Err(EscrowError::InvalidTransition { .. })
        ));
        assert!(matches!(
            service.cancel(contract.escrow_id),
            Err(EscrowError::InvalidTransition { .. })
        ));
        assert!(matches!(
            service.resolve_dispute(
                contract.escrow_id,
                "arb",
                "".into(),
                ReleaseBreakdown::standard(500, 50)
            ),
            Err(EscrowError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_only_before_funding() {
        let (chain, service) = service();
        let unfunded = service.create(request()).await.unwrap();
        let cancelled = service.cancel(unfunded.escrow_id).unwrap();
        assert_eq!(cancelled.status, EscrowStatus::Cancelled);
        assert!(cancelled.release_breakdown.is_none());

        let contract = funded(&chain, &service).await;
        assert!(matches!(
            service.cancel(contract.escrow_id),
            Err(EscrowError::InvalidTransition {
                from: EscrowStatus::Funded,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn expiry_fires_lazily_after_end_plus_grace() {
        let (chain, service) = service_with(EscrowConfig {
            grace_secs: 0,
            expiry_policy: ExpiryPolicy::RefundRenter,
        });
        let now = UnixTimestamp::now();
        let mut req = request();
        req.period = RentalPeriod {
            start: UnixTimestamp::from_secs(now.as_secs() - 7_200),
            end: UnixTimestamp::from_secs(now.as_secs() - 3_600),
        };
        let contract = service.create(req).await.unwrap();
        let tx = chain.confirm_payment(&contract.escrow_address, 550);
        // Funding itself does not run the expiry check; the next touch does.
        service.fund(contract.escrow_id, &tx).await.unwrap();

        let read = service.contract(contract.escrow_id).unwrap();
        assert_eq!(read.status, EscrowStatus::Expired);
        assert_eq!(
            read.release_breakdown.unwrap(),
            ReleaseBreakdown {
                to_owner: 0,
                to_renter: 550,
                to_arbitrator: 0
            }
        );
    }

    #[tokio::test]
    async fn standard_split_expiry_policy() {
        let (chain, service) = service_with(EscrowConfig {
            grace_secs: 0,
            expiry_policy: ExpiryPolicy::StandardSplit,
        });
        let now = UnixTimestamp::now();
        let mut req = request();
        req.period = RentalPeriod {
            start: UnixTimestamp::from_secs(now.as_secs() - 7_200),
            end: UnixTimestamp::from_secs(now.as_secs() - 3_600),
        };
        let contract = service.create(req).await.unwrap();
        let tx = chain.confirm_payment(&contract.escrow_address, 550);
        service.fund(contract.escrow_id, &tx).await.unwrap();

        assert_eq!(service.sweep_expired(), 1);
        let read = service.contract(contract.escrow_id).unwrap();
        assert_eq!(read.release_breakdown, Some(ReleaseBreakdown::standard(500, 50)));
    }

    #[tokio::test]
    async fn unexpired_contract_survives_sweep() {
        let (chain, service) = service();
        let contract = funded(&chain, &service).await;
        assert_eq!(service.sweep_expired(), 0);
        assert_eq!(
            service.contract(contract.escrow_id).unwrap().status,
            EscrowStatus::Funded
        );
    }

    #[tokio::test]
    async fn terminal_transitions_are_published() {
        let (chain, service) = service();
        let mut events = service.subscribe();
        let contract = funded(&chain, &service).await;

        service.sign_release(contract.escrow_id, Party::Owner, "o").unwrap();
        service.sign_release(contract.escrow_id, Party::Renter, "r").unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.escrow_id, contract.escrow_id);
        assert_eq!(event.status, EscrowStatus::Completed);
        assert_eq!(event.breakdown, Some(ReleaseBreakdown::standard(500, 50)));
    }

    #[tokio::test]
    async fn every_fund_holding_terminal_state_conserves_total() {
        let (chain, service) = service();

        // completed
        let a = funded(&chain, &service).await;
        service.sign_release(a.escrow_id, Party::Owner, "o").unwrap();
        service.sign_release(a.escrow_id, Party::Renter, "r").unwrap();

        // arbitrated
        let b = funded(&chain, &service).await;
        service.raise_dispute(b.escrow_id, Party::Renter, "x".into(), vec![]).unwrap();
        service
            .resolve_dispute(
                b.escrow_id,
                "arb",
                "split".into(),
                ReleaseBreakdown {
                    to_owner: 275,
                    to_renter: 275,
                    to_arbitrator: 0,
                },
            )
            .unwrap();

        for id in [a.escrow_id, b.escrow_id] {
            let c = service.contract(id).unwrap();
            assert!(c.release_breakdown.unwrap().conserves(c.total_amount));
        }
    }
}
