//! Domain Ports - Core types and trait definitions for nodefeed
//!
//! These traits define the boundaries between the ingestion/registry logic
//! and external systems (the relational store, the feed endpoints, the wall
//! clock). Adapters implement these traits to provide concrete functionality.

use crate::error::{Error, Result};
use crate::net::{Cidr, NodeAddress};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;

// =============================================================================
// Identifiers
// =============================================================================

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(
    /// Identifier of a polled feed source
    SourceId
);
id_type!(
    /// Identifier of an allowlist
    AllowlistId
);
id_type!(
    /// Identifier of a single CIDR entry within an allowlist
    EntryId
);

// =============================================================================
// Refresh Period
// =============================================================================

/// How often a source should be refreshed, with whole-second resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period(u64);

impl Period {
    /// Longest accepted period (ten years)
    pub const MAX_SECS: u64 = 10 * 365 * 24 * 60 * 60;

    pub fn from_secs(secs: u64) -> Result<Self> {
        if secs == 0 || secs > Self::MAX_SECS {
            return Err(Error::InvalidPeriod {
                value: format!("{}s", secs),
                reason: format!("period must be between 1s and {}s", Self::MAX_SECS),
            });
        }
        Ok(Self(secs))
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    pub fn as_chrono(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.0 as i64)
    }

    /// Parse a period string such as `90s`, `15m`, `1h30m`, `2d` or `1w`
    pub fn parse(s: &str) -> Result<Self> {
        let raw = s;
        let s = s.trim();
        let invalid = |reason: String| Error::InvalidPeriod {
            value: raw.to_string(),
            reason,
        };

        if s.is_empty() {
            return Err(invalid("empty period string".into()));
        }

        let mut total: u64 = 0;
        let mut rest = s;
        while !rest.is_empty() {
            let num_end = rest
                .char_indices()
                .find(|(_, c)| !c.is_ascii_digit())
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
            if num_end == 0 {
                return Err(invalid(format!("expected a number at {:?}", rest)));
            }

            let num: u64 = rest[..num_end]
                .parse()
                .map_err(|_| invalid(format!("invalid number: {}", &rest[..num_end])))?;
            rest = rest[num_end..].trim_start();

            let unit_end = rest
                .char_indices()
                .find(|(_, c)| !c.is_ascii_alphabetic())
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
            let unit = &rest[..unit_end];
            rest = rest[unit_end..].trim_start();

            let multiplier: u64 = match unit.to_lowercase().as_str() {
                "s" | "sec" | "secs" | "second" | "seconds" => 1,
                "m" | "min" | "mins" | "minute" | "minutes" => 60,
                "h" | "hr" | "hrs" | "hour" | "hours" => 60 * 60,
                "d" | "day" | "days" => 24 * 60 * 60,
                "w" | "week" | "weeks" => 7 * 24 * 60 * 60,
                "" => return Err(invalid(format!("missing unit after {}", num))),
                other => return Err(invalid(format!("unknown unit: {}", other))),
            };

            total = num
                .checked_mul(multiplier)
                .and_then(|secs| total.checked_add(secs))
                .ok_or_else(|| invalid("period overflows".into()))?;
        }

        Self::from_secs(total).map_err(|_| {
            invalid(format!("period must be between 1s and {}s", Self::MAX_SECS))
        })
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const UNITS: [(u64, &str); 4] = [(86_400, "d"), (3_600, "h"), (60, "m"), (1, "s")];
        let mut remaining = self.0;
        for (size, suffix) in UNITS {
            if remaining >= size {
                write!(f, "{}{}", remaining / size, suffix)?;
                remaining %= size;
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for Period {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Sources
// =============================================================================

/// A periodically polled feed of network addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    /// Unique name
    pub name: String,
    /// Feed URL
    pub url: String,
    /// Refresh period
    pub period: Period,
    /// When the most recent execution was prepared
    pub last_execution: Option<DateTime<Utc>>,
    /// Execution epoch, bumped by every prepare and every stop
    pub version: i64,
    /// Whether the scheduler should consider this source
    pub enabled: bool,
}

impl Source {
    /// When this source next becomes due, `None` if it has never run
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.last_execution.map(|t| t + self.period.as_chrono())
    }

    /// Enabled and never run, or a full period has elapsed since the last prepare
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_due_at().map_or(true, |due| due < now)
    }
}

/// Parameters for registering a new source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSource {
    pub name: String,
    pub url: String,
    pub period: Period,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

// =============================================================================
// Node Observations
// =============================================================================

/// One (address, source, version) observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeObservation {
    pub address: NodeAddress,
    pub source_id: SourceId,
    /// Source version of the execution that produced this row
    pub version: i64,
    /// The source's last-execution stamp for that execution
    pub observed_at: DateTime<Utc>,
}

/// A single row a batch insert refused
#[derive(Debug)]
pub struct BatchFailure {
    /// Position of the row in the submitted batch
    pub index: usize,
    pub error: Error,
}

/// Result of a batch insert that the store accepted
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub failures: Vec<BatchFailure>,
}

/// Which nodes a registry query considers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFilter {
    /// Every node
    All,
    /// Nodes observed by one source
    Source(SourceId),
    /// Nodes contained by at least one prefix of the list
    InsideAllowlist(AllowlistId),
    /// Nodes contained by none of the list's prefixes
    OutsideAllowlist(AllowlistId),
}

/// Keyset-paginated node query
///
/// `limit` counts distinct addresses; every row of each selected address is
/// returned so an address never straddles two pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeQuery {
    pub filter: NodeFilter,
    /// Only addresses strictly greater than this one
    pub after: Option<NodeAddress>,
    pub limit: usize,
}

// =============================================================================
// Allowlists
// =============================================================================

/// A named collection of CIDR prefixes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowlist {
    pub id: AllowlistId,
    pub name: String,
}

/// One prefix of an allowlist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowlistEntry {
    pub id: EntryId,
    pub cidr: Cidr,
    pub allowlist_id: AllowlistId,
}

// =============================================================================
// Storage Port
// =============================================================================

/// Port for the relational store holding sources, allowlists and nodes
///
/// Every list operation is keyset-paginated (`after`, `limit`).
/// `prepare_execution` must be a single atomic conditional update: of any
/// number of concurrent callers within one eligibility window, exactly one
/// succeeds.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a source; fails with `AlreadyExists` if the name is taken
    async fn create_source(&self, source: NewSource) -> Result<Source>;

    async fn get_source(&self, id: SourceId) -> Result<Source>;

    /// Sources with id greater than `after`, ascending by id
    async fn list_sources(&self, after: Option<SourceId>, limit: usize) -> Result<Vec<Source>>;

    /// Enabled sources whose last execution is unset or older than one period
    async fn list_eligible_sources(&self, now: DateTime<Utc>) -> Result<Vec<Source>>;

    /// Claim an execution: set `last_execution = now` and bump the version
    ///
    /// Fails with `ExecutionNotEligible` if the source is disabled or its
    /// current window was already claimed.
    async fn prepare_execution(&self, id: SourceId, now: DateTime<Utc>) -> Result<Source>;

    async fn start_source(&self, id: SourceId) -> Result<Source>;

    /// Disable a source and advance its version
    async fn stop_source(&self, id: SourceId) -> Result<Source>;

    /// Insert observations, reporting per-row failures without aborting
    async fn batch_insert_nodes(&self, rows: Vec<NodeObservation>) -> Result<BatchOutcome>;

    /// Rows for the first `query.limit` distinct matching addresses after the cursor
    ///
    /// Rows are ordered by address, then source id, then version.
    async fn list_nodes(&self, query: &NodeQuery) -> Result<Vec<NodeObservation>>;

    async fn create_allowlist(&self, name: &str) -> Result<Allowlist>;

    async fn get_allowlist(&self, id: AllowlistId) -> Result<Allowlist>;

    async fn list_allowlists(&self, after: Option<AllowlistId>, limit: usize) -> Result<Vec<Allowlist>>;

    /// Remove a list together with its entries
    async fn delete_allowlist(&self, id: AllowlistId) -> Result<()>;

    async fn add_allowlist_entry(&self, list_id: AllowlistId, cidr: Cidr) -> Result<AllowlistEntry>;

    async fn remove_allowlist_entry(&self, list_id: AllowlistId, entry_id: EntryId) -> Result<()>;

    async fn list_allowlist_entries(&self, list_id: AllowlistId) -> Result<Vec<AllowlistEntry>>;

    /// Check if the store is reachable
    async fn health_check(&self) -> Result<bool>;

    /// Get backend name
    fn backend_name(&self) -> &str;
}

// =============================================================================
// Feed Fetcher Port
// =============================================================================

/// One decoded row of a feed payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    /// 1-based line number in the payload
    pub line: u64,
    pub fields: Vec<String>,
}

impl RawRow {
    /// The candidate address column
    pub fn address_field(&self) -> &str {
        self.fields.first().map(String::as_str).unwrap_or("")
    }
}

/// Single-pass sequence of decoded feed rows
pub type FeedRows = Box<dyn Iterator<Item = Result<RawRow>> + Send>;

/// Port for retrieving a source's raw payload
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// Retrieve and decode the payload at `url`
    ///
    /// Transport and HTTP failures surface here; malformed rows surface as
    /// `Err` items of the returned sequence. No retries happen at this layer.
    async fn fetch(&self, url: &str) -> Result<FeedRows>;
}

// =============================================================================
// Clock Port
// =============================================================================

/// Source of "now" for eligibility decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type StorageRef = Arc<dyn Storage>;
pub type FeedFetcherRef = Arc<dyn FeedFetcher>;
pub type ClockRef = Arc<dyn Clock>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn source(period: &str, last_execution: Option<DateTime<Utc>>, enabled: bool) -> Source {
        Source {
            id: SourceId(1),
            name: "feed".into(),
            url: "http://feed.local/list.csv".into(),
            period: Period::parse(period).unwrap(),
            last_execution,
            version: 0,
            enabled,
        }
    }

    #[test]
    fn test_period_parse() {
        assert_eq!(Period::parse("90s").unwrap().as_secs(), 90);
        assert_eq!(Period::parse("15m").unwrap().as_secs(), 900);
        assert_eq!(Period::parse("1h").unwrap().as_secs(), 3600);
        assert_eq!(Period::parse("1h30m").unwrap().as_secs(), 5400);
        assert_eq!(Period::parse("2 days").unwrap().as_secs(), 172_800);
        assert_eq!(Period::parse("1w").unwrap().as_secs(), 604_800);

        assert!(Period::parse("").is_err());
        assert!(Period::parse("10").is_err());
        assert!(Period::parse("0s").is_err());
        assert!(Period::parse("h").is_err());
        assert!(Period::parse("5 fortnights").is_err());
    }

    #[test]
    fn test_period_display() {
        assert_eq!(Period::parse("1h30m").unwrap().to_string(), "1h30m");
        assert_eq!(Period::parse("90s").unwrap().to_string(), "1m30s");
        assert_eq!(Period::parse("1w").unwrap().to_string(), "7d");
        assert_eq!(serde_json::to_string(&Period::parse("1h").unwrap()).unwrap(), "\"1h\"");
    }

    #[test]
    fn test_source_eligibility() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        assert!(source("1h", None, true).is_eligible(now));
        assert!(!source("1h", None, false).is_eligible(now));

        let recent = now - chrono::Duration::minutes(30);
        assert!(!source("1h", Some(recent), true).is_eligible(now));

        let stale = now - chrono::Duration::minutes(61);
        assert!(source("1h", Some(stale), true).is_eligible(now));

        // Exactly one period ago is not yet strictly older than the period
        let boundary = now - chrono::Duration::hours(1);
        assert!(!source("1h", Some(boundary), true).is_eligible(now));
    }

    #[test]
    fn test_raw_row_address_field() {
        let row = RawRow {
            line: 1,
            fields: vec!["1.2.3.4".into(), "botnet".into()],
        };
        assert_eq!(row.address_field(), "1.2.3.4");
        assert_eq!(RawRow { line: 2, fields: vec![] }.address_field(), "");
    }
}
