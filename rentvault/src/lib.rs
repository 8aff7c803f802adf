//! Core engine for payment-gated access and two-party rental escrow.
//!
//! This crate holds the transport-agnostic pieces of the vault: the payment
//! ledger that backs HTTP 402 challenges, the access grant issuer, the escrow
//! state machine for rental deposits, and the release coordinator that turns a
//! settled contract into a payout transaction. All chain interaction goes
//! through the [`chain::ChainClient`] trait; nothing here speaks a wire
//! protocol.
//!
//! # Modules
//!
//! - [`chain`] - Chain client trait and the in-memory sandbox implementation
//! - [`error`] - Payment, escrow, and chain error types
//! - [`escrow`] - Two-party escrow contracts and their state machine
//! - [`grant`] - Time-boxed, resource-scoped access grants
//! - [`ledger`] - Payment references and replay-safe verification
//! - [`release`] - Idempotent payout broadcast for terminal contracts
//! - [`timestamp`] - Unix timestamps with string serialization

pub mod chain;
pub mod error;
pub mod escrow;
pub mod grant;
pub mod ledger;
pub mod release;
pub mod timestamp;
