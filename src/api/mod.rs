//! API Module
//!
//! REST surface over the source ledger, allowlists and node registry.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
