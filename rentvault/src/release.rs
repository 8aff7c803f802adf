//! Release finalization: turns a terminal escrow's breakdown into exactly one
//! broadcast payout transaction.
//!
//! Finalization is idempotent. The first successful broadcast records its
//! transaction id on the contract; every later call returns that same id. An
//! in-flight guard keyed by escrow id ensures two concurrent finalize calls
//! cannot both reach the chain client.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::chain::{ChainClient, ReleaseDraft, TxOutput};
use crate::error::EscrowError;
use crate::escrow::{EscrowContract, EscrowService, ReleaseBreakdown};

/// Broadcasts release transactions for terminal escrow contracts.
pub struct ReleaseCoordinator {
    chain: Arc<dyn ChainClient>,
    escrows: Arc<EscrowService>,
    in_flight: DashMap<Uuid, ()>,
}

impl std::fmt::Debug for ReleaseCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseCoordinator")
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl ReleaseCoordinator {
    /// Creates a coordinator over the given escrow service and chain client.
    #[must_use]
    pub fn new(chain: Arc<dyn ChainClient>, escrows: Arc<EscrowService>) -> Self {
        Self {
            chain,
            escrows,
            in_flight: DashMap::new(),
        }
    }

    /// Builds, signs, and broadcasts the payout transaction for a terminal
    /// contract, returning the release transaction id. Safe to call again:
    /// an already-released contract returns its recorded id without touching
    /// the chain.
    ///
    /// # Errors
    ///
    /// [`EscrowError::InvalidTransition`] if the contract is not terminal,
    /// [`EscrowError::NoBreakdown`] if it holds no funds to pay out,
    /// [`EscrowError::ReleaseInProgress`] if another call is mid-broadcast,
    /// [`EscrowError::Chain`] on broadcast failure.
    pub async fn finalize_release(&self, escrow_id: Uuid) -> Result<String, EscrowError> {
        let contract = self
            .escrows
            .contract(escrow_id)
            .ok_or(EscrowError::NotFound(escrow_id))?;
        if let Some(tx_id) = contract.release_tx_id {
            return Ok(tx_id);
        }
        if !contract.status.is_terminal() {
            return Err(EscrowError::InvalidTransition {
                from: contract.status,
                operation: "finalize_release",
            });
        }
        let breakdown = contract
            .release_breakdown
            .ok_or(EscrowError::NoBreakdown(escrow_id))?;

        match self.in_flight.entry(escrow_id) {
            Entry::Occupied(_) => return Err(EscrowError::ReleaseInProgress(escrow_id)),
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let result = self.broadcast(&contract, breakdown).await;
        self.in_flight.remove(&escrow_id);
        result
    }

    async fn broadcast(
        &self,
        contract: &EscrowContract,
        breakdown: ReleaseBreakdown,
    ) -> Result<String, EscrowError> {
        // A racing call may have finished between our read and winning the
        // guard; the recorded id wins.
        if let Some(current) = self.escrows.contract(contract.escrow_id) {
            if let Some(tx_id) = current.release_tx_id {
                return Ok(tx_id);
            }
        }

        let mut outputs = Vec::with_capacity(3);
        if breakdown.to_owner > 0 {
            outputs.push(self.payout(&contract.owner_key, breakdown.to_owner)?);
        }
        if breakdown.to_renter > 0 {
            outputs.push(self.payout(&contract.renter_key, breakdown.to_renter)?);
        }
        if breakdown.to_arbitrator > 0 {
            let key = contract
                .arbitrator_key
                .as_deref()
                .ok_or(EscrowError::NoArbitrator)?;
            outputs.push(self.payout(key, breakdown.to_arbitrator)?);
        }

        let funding_tx_id = contract
            .funding_tx_id
            .clone()
            .ok_or(EscrowError::InvalidTransition {
                from: contract.status,
                operation: "finalize_release",
            })?;

        let tx_id = self
            .chain
            .sign_and_broadcast(ReleaseDraft {
                funding_tx_id,
                outputs,
            })
            .await?;
        self.escrows.record_release(contract.escrow_id, &tx_id);
        tracing::info!(escrow = %contract.escrow_id, tx = %tx_id, "release broadcast");
        Ok(tx_id)
    }

    fn payout(&self, key: &str, amount: u64) -> Result<TxOutput, EscrowError> {
        let script = self.chain.build_pay_to_script(key, amount)?;
        Ok(TxOutput { amount, script })
    }
}
