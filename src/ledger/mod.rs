//! Source Ledger Module
//!
//! Per-source scheduling state and the optimistic-concurrency primitive that
//! licenses at most one refresh per eligibility window.

pub mod clock;
pub mod source_ledger;

pub use clock::*;
pub use source_ledger::*;
