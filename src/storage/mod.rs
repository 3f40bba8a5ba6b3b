//! Storage Backends
//!
//! Implementations of the `Storage` port:
//! - `MemoryStore`: process-local, for tests and single-process deployments
//! - `SqliteStore`: durable single-file database

pub mod memory;
pub mod sqlite;

pub use memory::*;
pub use sqlite::*;
