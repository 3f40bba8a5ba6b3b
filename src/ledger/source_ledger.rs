//! Source Ledger
//!
//! Owns per-source scheduling state. `prepare` is the only way a refresh is
//! licensed: it stamps `last_execution` and bumps the version in one
//! conditional update, which also makes the source ineligible again until a
//! full period has passed.

use crate::domain::ports::{ClockRef, NewSource, Period, Source, SourceId, StorageRef};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Scheduling state and admission control for feed sources
pub struct SourceLedger {
    storage: StorageRef,
    clock: ClockRef,
}

impl SourceLedger {
    /// Create a new ledger over a store and a clock
    pub fn new(storage: StorageRef, clock: ClockRef) -> Arc<Self> {
        Arc::new(Self { storage, clock })
    }

    pub fn storage(&self) -> &StorageRef {
        &self.storage
    }

    pub fn clock(&self) -> &ClockRef {
        &self.clock
    }

    /// Register a new source
    pub async fn create(&self, name: &str, url: &str, period: Period) -> Result<Source> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("source name must not be empty".into()));
        }
        validate_feed_url(url)?;

        let source = self
            .storage
            .create_source(NewSource {
                name: name.to_string(),
                url: url.trim().to_string(),
                period,
                enabled: true,
            })
            .await?;

        info!(
            source_id = %source.id,
            name = %source.name,
            period = %source.period,
            "Registered source"
        );
        Ok(source)
    }

    pub async fn get(&self, id: SourceId) -> Result<Source> {
        self.storage.get_source(id).await
    }

    /// Sources after `after` in id order
    pub async fn list(&self, after: Option<SourceId>, limit: usize) -> Result<Vec<Source>> {
        self.storage.list_sources(after, limit).await
    }

    /// Sources due for refresh right now
    ///
    /// Evaluated against the store on every call; nothing is cached.
    pub async fn list_eligible(&self) -> Result<Vec<Source>> {
        let now = self.clock.now();
        let sources = self.storage.list_eligible_sources(now).await?;
        debug!(count = sources.len(), now = %now, "Listed eligible sources");
        Ok(sources)
    }

    /// Claim the current eligibility window of a source
    ///
    /// Returns the updated source whose `version` stamps the execution.
    pub async fn prepare(&self, id: SourceId) -> Result<Source> {
        let now = self.clock.now();
        match self.storage.prepare_execution(id, now).await {
            Ok(source) => {
                debug!(source_id = %id, version = source.version, "Prepared execution");
                Ok(source)
            }
            Err(e @ Error::ExecutionNotEligible { .. }) => {
                warn!(source_id = %id, "Execution window already claimed");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Enable a source
    pub async fn start(&self, id: SourceId) -> Result<Source> {
        let source = self.storage.start_source(id).await?;
        info!(source_id = %id, version = source.version, "Started source");
        Ok(source)
    }

    /// Disable a source and open a new version epoch
    pub async fn stop(&self, id: SourceId) -> Result<Source> {
        let source = self.storage.stop_source(id).await?;
        info!(source_id = %id, version = source.version, "Stopped source");
        Ok(source)
    }
}

/// Feed URLs must be absolute http(s) URLs
fn validate_feed_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url.trim()).map_err(|e| Error::InvalidUrl {
        value: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::InvalidUrl {
            value: url.to_string(),
            reason: format!("unsupported scheme: {}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::clock::ManualClock;
    use crate::storage::MemoryStore;
    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};

    fn ledger() -> (Arc<SourceLedger>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let ledger = SourceLedger::new(Arc::new(MemoryStore::new()), clock.clone());
        (ledger, clock)
    }

    fn hour() -> Period {
        Period::parse("1h").unwrap()
    }

    #[tokio::test]
    async fn test_prepare_cycle_scenario() {
        let (ledger, clock) = ledger();
        let s = ledger.create("S", "http://feed.local/s.csv", hour()).await.unwrap();
        assert_eq!(s.version, 0);
        assert!(s.last_execution.is_none());

        let eligible = ledger.list_eligible().await.unwrap();
        assert_eq!(eligible.iter().map(|s| s.id).collect::<Vec<_>>(), vec![s.id]);

        let prepared = ledger.prepare(s.id).await.unwrap();
        assert_eq!(prepared.version, 1);
        assert_eq!(prepared.last_execution, Some(clock.now()));

        assert!(ledger.list_eligible().await.unwrap().is_empty());

        clock.advance(chrono::Duration::minutes(61));
        let eligible = ledger.list_eligible().await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].version, 1);
    }

    #[tokio::test]
    async fn test_versions_increase_without_gaps() {
        let (ledger, clock) = ledger();
        let s = ledger.create("S", "http://feed.local/s.csv", hour()).await.unwrap();

        let mut versions = Vec::new();
        for _ in 0..5 {
            versions.push(ledger.prepare(s.id).await.unwrap().version);
            clock.advance(chrono::Duration::minutes(61));
        }
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_second_prepare_in_window_is_rejected() {
        let (ledger, _clock) = ledger();
        let s = ledger.create("S", "http://feed.local/s.csv", hour()).await.unwrap();

        ledger.prepare(s.id).await.unwrap();
        assert_matches!(
            ledger.prepare(s.id).await,
            Err(Error::ExecutionNotEligible { source_id }) if source_id == s.id.0
        );
        assert_eq!(ledger.get(s.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_stop_bumps_version_and_excludes() {
        let (ledger, _clock) = ledger();
        let s = ledger.create("S", "http://feed.local/s.csv", hour()).await.unwrap();

        let stopped = ledger.stop(s.id).await.unwrap();
        assert!(!stopped.enabled);
        assert_eq!(stopped.version, 1);
        assert!(ledger.list_eligible().await.unwrap().is_empty());
        assert_matches!(ledger.prepare(s.id).await, Err(Error::ExecutionNotEligible { .. }));

        let started = ledger.start(s.id).await.unwrap();
        assert!(started.enabled);
        assert_eq!(started.version, 1);
        assert_eq!(ledger.list_eligible().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_validation() {
        let (ledger, _clock) = ledger();
        assert_matches!(
            ledger.create("  ", "http://feed.local", hour()).await,
            Err(Error::Validation(_))
        );
        assert_matches!(
            ledger.create("S", "not a url", hour()).await,
            Err(Error::InvalidUrl { .. })
        );
        assert_matches!(
            ledger.create("S", "ftp://feed.local/list", hour()).await,
            Err(Error::InvalidUrl { .. })
        );

        ledger.create("S", "http://feed.local/s.csv", hour()).await.unwrap();
        assert_matches!(
            ledger.create("S", "http://feed.local/other.csv", hour()).await,
            Err(Error::AlreadyExists { .. })
        );
    }

    #[tokio::test]
    async fn test_unknown_source() {
        let (ledger, _clock) = ledger();
        assert_matches!(ledger.get(SourceId(42)).await, Err(Error::NotFound { .. }));
        assert_matches!(ledger.prepare(SourceId(42)).await, Err(Error::NotFound { .. }));
        assert_matches!(ledger.stop(SourceId(42)).await, Err(Error::NotFound { .. }));
    }
}
