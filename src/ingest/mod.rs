//! Ingestion Module
//!
//! Feed retrieval, the per-source ingestion pipeline, and the scheduler
//! loop that drives it.

pub mod fetcher;
pub mod pipeline;
pub mod scheduler;

pub use fetcher::*;
pub use pipeline::*;
pub use scheduler::*;
