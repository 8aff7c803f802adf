//! Axum route handlers for the escrow API.
//!
//! One route per state-machine operation plus a read endpoint. The gated
//! asset route lives in `main.rs` where the payment layer is applied.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rentvault::error::EscrowError;
use rentvault::escrow::{
    CreateEscrow, EscrowContract, EscrowService, Evidence, Party, ReleaseBreakdown,
};
use rentvault::release::ReleaseCoordinator;

use crate::error::ApiError;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// The escrow state machine.
    pub escrows: Arc<EscrowService>,
    /// Payout finalization.
    pub release: Arc<ReleaseCoordinator>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Body of `POST /escrows/{id}/fund`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundRequest {
    /// The funding transaction id.
    pub transaction_id: String,
}

/// Body of `POST /escrows/{id}/sign`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRequest {
    /// Which party is signing.
    pub party: Party,
    /// The party's release signature, opaque to the engine.
    pub signature: String,
}

/// Body of `POST /escrows/{id}/dispute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeRequest {
    /// Which party raises the dispute.
    pub raised_by: Party,
    /// Why.
    pub reason: String,
    /// Supporting evidence.
    #[serde(default)]
    pub evidence: Vec<Evidence>,
}

/// Body of `POST /escrows/{id}/resolve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveRequest {
    /// Identity of the resolving arbitrator.
    pub resolved_by: String,
    /// Human-readable resolution summary.
    pub summary: String,
    /// The payout split; must conserve the contract total.
    pub breakdown: ReleaseBreakdown,
}

/// Body of a successful `POST /escrows/{id}/release`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseResponse {
    /// The broadcast payout transaction id.
    pub release_tx_id: String,
}

/// `POST /escrows` — opens a new contract.
///
/// # Errors
///
/// 422 if the amounts or period are invalid.
pub async fn create_escrow(
    State(state): State<AppState>,
    Json(body): Json<CreateEscrow>,
) -> Result<Json<EscrowContract>, ApiError> {
    Ok(Json(state.escrows.create(body).await?))
}

/// `GET /escrows/{id}` — reads a contract, applying lazy expiry.
///
/// # Errors
///
/// 404 for an unknown id.
pub async fn get_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<EscrowContract>, ApiError> {
    let contract = state
        .escrows
        .contract(id)
        .ok_or(EscrowError::NotFound(id))?;
    Ok(Json(contract))
}

/// `POST /escrows/{id}/fund` — confirms the funding transaction.
///
/// # Errors
///
/// 402 if the transaction is pending or underpays, 409 from a non-created state.
pub async fn fund_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<FundRequest>,
) -> Result<Json<EscrowContract>, ApiError> {
    Ok(Json(state.escrows.fund(id, &body.transaction_id).await?))
}

/// `POST /escrows/{id}/cancel` — cancels an unfunded contract.
///
/// # Errors
///
/// 409 once the contract is funded or terminal.
pub async fn cancel_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<EscrowContract>, ApiError> {
    Ok(Json(state.escrows.cancel(id)?))
}

/// `POST /escrows/{id}/sign` — records a party's release signature.
///
/// # Errors
///
/// 409 unless the contract is funded and undisputed.
pub async fn sign_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SignRequest>,
) -> Result<Json<EscrowContract>, ApiError> {
    Ok(Json(
        state.escrows.sign_release(id, body.party, &body.signature)?,
    ))
}

/// `POST /escrows/{id}/dispute` — raises a dispute on a funded contract.
///
/// # Errors
///
/// 409 unless the contract is funded.
pub async fn dispute_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<DisputeRequest>,
) -> Result<Json<EscrowContract>, ApiError> {
    Ok(Json(state.escrows.raise_dispute(
        id,
        body.raised_by,
        body.reason,
        body.evidence,
    )?))
}

/// `POST /escrows/{id}/resolve` — applies an arbitrator's resolution.
///
/// # Errors
///
/// 422 if the breakdown does not conserve the total, 409 unless disputed.
pub async fn resolve_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ResolveRequest>,
) -> Result<Json<EscrowContract>, ApiError> {
    Ok(Json(state.escrows.resolve_dispute(
        id,
        &body.resolved_by,
        body.summary,
        body.breakdown,
    )?))
}

/// `POST /escrows/{id}/release` — broadcasts the payout transaction.
/// Idempotent: repeat calls return the recorded transaction id.
///
/// # Errors
///
/// 409 unless the contract is terminal with a breakdown.
pub async fn release_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    let release_tx_id = state.release.finalize_release(id).await?;
    Ok(Json(ReleaseResponse { release_tx_id }))
}

/// Creates an axum [`axum::Router`] with all escrow endpoints.
///
/// Endpoints:
/// - `POST /escrows` — create a contract
/// - `GET /escrows/{id}` — read a contract
/// - `POST /escrows/{id}/fund` — confirm funding
/// - `POST /escrows/{id}/cancel` — cancel before funding
/// - `POST /escrows/{id}/sign` — record a release signature
/// - `POST /escrows/{id}/dispute` — raise a dispute
/// - `POST /escrows/{id}/resolve` — arbitrate a dispute
/// - `POST /escrows/{id}/release` — broadcast the payout
pub fn escrow_router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/escrows", axum::routing::post(create_escrow))
        .route("/escrows/{id}", axum::routing::get(get_escrow))
        .route("/escrows/{id}/fund", axum::routing::post(fund_escrow))
        .route("/escrows/{id}/cancel", axum::routing::post(cancel_escrow))
        .route("/escrows/{id}/sign", axum::routing::post(sign_escrow))
        .route("/escrows/{id}/dispute", axum::routing::post(dispute_escrow))
        .route("/escrows/{id}/resolve", axum::routing::post(resolve_escrow))
        .route("/escrows/{id}/release", axum::routing::post(release_escrow))
        .with_state(state)
}
