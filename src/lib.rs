//! nodefeed - Versioned Feed Ingestion and Node Registry
//!
//! Polls a set of external address feeds ("sources") on their own refresh
//! periods, records every refresh as an immutable version, and serves a
//! cursor-paginated registry of the observed nodes filtered by CIDR
//! allowlists.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               Scheduler Loop                                │
//! │                (Scanning ⇄ Idle, bounded per-scan concurrency)              │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  Source Ledger  │  │  Feed Fetcher   │  │     Ingestion Pipeline      │  │
//! │  │ (eligibility +  │  │ (reqwest + csv) │  │ (validate, retry, persist)  │  │
//! │  │  prepare/version│  │                 │  │                             │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                  │
//! │           └────────────────────┼─────────────────────────┘                  │
//! │                                │                                            │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │     Storage Port      │                                │
//! │                    │  (memory | sqlite)    │                                │
//! │                    └───────────┬───────────┘                                │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │                                │                                            │
//! │  ┌─────────────────────────────┴───────┐  ┌─────────────────────────────┐   │
//! │  │     Node Aggregation Engine         │  │     Allowlist Service       │   │
//! │  │  (group by address, keyset pages)   │  │   (CIDR prefixes)           │   │
//! │  └─────────────────────────────────────┘  └─────────────────────────────┘   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                      REST API (/sources, /allowlist, /nodes)                │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`ledger`]: Source scheduling state and the prepare primitive
//! - [`ingest`]: Feed fetching, the ingestion pipeline and the scheduler
//! - [`registry`]: Node aggregation, allowlists and pagination
//! - [`storage`]: Storage backends
//! - [`api`]: REST API server
//! - [`net`]: Address and CIDR parsing
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling

pub mod api;
pub mod domain;
pub mod error;
pub mod ingest;
pub mod ledger;
pub mod metrics;
pub mod net;
pub mod registry;
pub mod storage;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, RestRouter};

pub use domain::ports::{
    Allowlist, AllowlistEntry, AllowlistId, Clock, ClockRef, EntryId, FeedFetcher, FeedFetcherRef,
    NodeFilter, NodeObservation, Period, Source, SourceId, Storage, StorageRef,
};

pub use error::{Error, ErrorAction, Result};

pub use ingest::{
    FetcherConfig, HttpFeedFetcher, IngestReport, IngestionPipeline, RetryPolicy, ScanSummary,
    Scheduler, SchedulerConfig, SchedulerState,
};

pub use ledger::{ManualClock, SourceLedger, SystemClock};

pub use metrics::IngestMetrics;

pub use net::{Cidr, NodeAddress};

pub use registry::{AggregatedNode, AllowlistService, NodeAggregator, Paginated};

pub use storage::{MemoryStore, SqliteStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
