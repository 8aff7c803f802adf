//! Library portion of the rentvault server binary: configuration, error
//! mapping, and route handlers.

pub mod config;
pub mod error;
pub mod handlers;
