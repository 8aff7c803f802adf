//! Transport-independent 402 gate logic.
//!
//! [`PayGate`] decides, per request, between three outcomes: let the request
//! through (optionally echoing a freshly minted token), answer 402 with a
//! payment challenge, or answer 402 with a retry hint for a transaction that
//! has not confirmed yet. The Tower wiring lives in [`crate::layer`]; this
//! module never touches a request or response type.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use rentvault::error::PaymentError;
use rentvault::grant::{AccessGrant, AccessGrantIssuer};
use rentvault::ledger::PaymentLedger;
use rentvault::timestamp::UnixTimestamp;

use crate::error::GateError;
use crate::quote::FiatQuote;

/// Payment parameters for the gated resources behind one gate instance.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Currency label shown in challenges, e.g. `"sat"`.
    pub currency: String,
    /// Price per unlock, in the smallest currency unit.
    pub amount: u64,
    /// How long a minted payment reference stays payable.
    pub reference_ttl_secs: u64,
    /// How long a minted access token stays valid.
    pub token_ttl_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            currency: "sat".to_owned(),
            amount: 10_000,
            reference_ttl_secs: 600,
            token_ttl_secs: 3_600,
        }
    }
}

/// Payment-related request headers, already extracted from the transport.
#[derive(Debug, Clone, Default)]
pub struct PaymentHeaders {
    /// `Payment-Token`: a previously minted access token.
    pub token: Option<String>,
    /// `Payment-Txid`: an on-chain transaction id.
    pub transaction_id: Option<String>,
    /// `Payment-Reference`: the reference the transaction settles.
    pub reference: Option<String>,
}

/// The gate's verdict for one request.
#[derive(Debug, Clone)]
pub enum GateOutcome {
    /// Let the request through. `minted` is set when this request's payment
    /// evidence just earned a new token, which the transport echoes back.
    Allow {
        /// A token minted by this request, if any.
        minted: Option<AccessGrant>,
    },
    /// Answer 402 with a fresh payment challenge.
    Challenge(PaymentChallenge),
    /// Answer 402 without minting anything: the named transaction exists but
    /// is not confirmed yet, and the same reference stays valid for a retry.
    Pending {
        /// The unconfirmed transaction.
        transaction_id: String,
        /// The still-open reference to retry with.
        reference: String,
    },
}

/// JSON body of a 402 challenge response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentChallenge {
    /// Always `"payment required"`.
    pub error: String,
    /// What to pay, where, and by when.
    pub payment: PaymentDetails,
    /// Human-readable payment instructions.
    pub instructions: String,
}

/// Payment terms inside a [`PaymentChallenge`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentDetails {
    /// Currency label.
    pub currency: String,
    /// Amount due, in the smallest currency unit.
    pub amount: u64,
    /// Informational fiat estimate; never used in verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_approx_fiat: Option<String>,
    /// Address to pay.
    pub address: String,
    /// Reference id to present alongside the transaction id.
    pub reference: String,
    /// Seconds until the reference expires.
    pub expires_in: u64,
    /// Absolute reference expiry.
    pub expires_at: UnixTimestamp,
}

/// Decides pass/challenge for payment-gated resources.
pub struct PayGate {
    ledger: Arc<PaymentLedger>,
    grants: Arc<AccessGrantIssuer>,
    quote: Option<Arc<dyn FiatQuote>>,
    config: GateConfig,
}

impl std::fmt::Debug for PayGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayGate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PayGate {
    /// Creates a gate over the given ledger and token issuer.
    #[must_use]
    pub fn new(
        ledger: Arc<PaymentLedger>,
        grants: Arc<AccessGrantIssuer>,
        config: GateConfig,
    ) -> Self {
        Self {
            ledger,
            grants,
            quote: None,
            config,
        }
    }

    /// Attaches a fiat quote source for challenge bodies.
    #[must_use]
    pub fn with_quote(mut self, quote: Arc<dyn FiatQuote>) -> Self {
        self.quote = Some(quote);
        self
    }

    /// Evaluates one request against the gate.
    ///
    /// Order matters: a valid token wins outright; otherwise payment evidence
    /// is verified; otherwise a fresh challenge is minted. A replayed payment
    /// that originally unlocked a *different* resource earns nothing and falls
    /// through to the challenge.
    ///
    /// # Errors
    ///
    /// [`GateError::Chain`] when the chain backend fails. Deliberately not a
    /// 402: the client's payment may be fine.
    pub async fn evaluate(
        &self,
        resource_id: &str,
        headers: &PaymentHeaders,
    ) -> Result<GateOutcome, GateError> {
        if let Some(token) = headers.token.as_deref() {
            if self.grants.validate(token, resource_id) {
                return Ok(GateOutcome::Allow { minted: None });
            }
        }

        if let (Some(transaction_id), Some(reference)) =
            (headers.transaction_id.as_deref(), headers.reference.as_deref())
        {
            match self
                .ledger
                .verify_payment(transaction_id, reference, self.config.amount)
                .await
            {
                Ok(v) if v.resource_id == resource_id => {
                    let minted = self.grants.mint(resource_id, self.config.token_ttl_secs);
                    tracing::info!(
                        resource = %resource_id,
                        transaction = %transaction_id,
                        replayed = v.replayed,
                        "payment accepted, token minted"
                    );
                    return Ok(GateOutcome::Allow {
                        minted: Some(minted),
                    });
                }
                Ok(v) => {
                    tracing::warn!(
                        requested = %resource_id,
                        original = %v.resource_id,
                        transaction = %transaction_id,
                        "replayed payment for a different resource"
                    );
                }
                Err(PaymentError::TransactionPending(tx)) => {
                    return Ok(GateOutcome::Pending {
                        transaction_id: tx,
                        reference: reference.to_owned(),
                    });
                }
                Err(PaymentError::Chain(e)) => return Err(GateError::Chain(e)),
                Err(e) => {
                    tracing::debug!(
                        resource = %resource_id,
                        error = %e,
                        "payment evidence rejected"
                    );
                }
            }
        }

        self.challenge(resource_id).await.map(GateOutcome::Challenge)
    }

    async fn challenge(&self, resource_id: &str) -> Result<PaymentChallenge, GateError> {
        let reference = self
            .ledger
            .create_reference(resource_id, self.config.amount, self.config.reference_ttl_secs)
            .await
            .map_err(|e| match e {
                PaymentError::Chain(chain) => GateError::Chain(chain),
                // create_reference only fails through the chain client.
                other => GateError::Chain(rentvault::error::ChainError::Unavailable(
                    other.to_string(),
                )),
            })?;
        let amount_approx_fiat = self
            .quote
            .as_ref()
            .and_then(|q| q.approx_fiat(self.config.amount));
        Ok(PaymentChallenge {
            error: "payment required".to_owned(),
            payment: PaymentDetails {
                currency: self.config.currency.clone(),
                amount: self.config.amount,
                amount_approx_fiat,
                address: reference.pay_to_address,
                reference: reference.id,
                expires_in: self.config.reference_ttl_secs,
                expires_at: reference.expires_at,
            },
            instructions: format!(
                "pay {} {} to the address above, then retry with Payment-Txid and Payment-Reference headers",
                self.config.amount, self.config.currency
            ),
        })
    }
}
