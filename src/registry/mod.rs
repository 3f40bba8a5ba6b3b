//! Node Registry Module
//!
//! Read-side views over ingested nodes and the allowlists that filter them.

pub mod aggregation;
pub mod allowlist;
pub mod pagination;

pub use aggregation::*;
pub use allowlist::*;
pub use pagination::*;
