//! HTTP transport for the rentvault payment gate.
//!
//! Wraps the core ledger and grant issuer in an HTTP 402 flow: a request
//! without payment evidence receives a JSON challenge naming an amount, a
//! pay-to address, and a one-time reference; a request presenting a confirmed
//! transaction id plus that reference passes through and receives an access
//! token in the response headers; later requests present the token alone.
//!
//! # Modules
//!
//! - [`constants`] - Header names
//! - [`error`] - Gate-level errors and their status mapping
//! - [`gate`] - Transport-independent gate decisions
//! - [`layer`] - Tower [`Layer`](tower::Layer)/`Service` wiring for axum
//! - [`quote`] - Informational fiat quotes for challenge bodies

pub mod constants;
pub mod error;
pub mod gate;
pub mod layer;
pub mod quote;
