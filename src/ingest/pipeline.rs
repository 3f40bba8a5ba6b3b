//! Ingestion Pipeline
//!
//! One source execution: prepare, fetch, validate, batch persist. Rows that
//! fail validation or are refused by the store are collected as row failures
//! and do not fail the run.

use crate::domain::ports::{FeedFetcherRef, FeedRows, NodeObservation, Source};
use crate::error::{Error, Result};
use crate::ledger::SourceLedger;
use crate::metrics::IngestMetrics;
use crate::net::NodeAddress;
use backoff::ExponentialBackoffBuilder;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn, Instrument};

// =============================================================================
// Retry Policy
// =============================================================================

/// Bounded exponential backoff for transient fetch failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Total time budget across attempts; `None` or zero disables retry
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            max_elapsed: Some(Duration::from_secs(60)),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries
    pub fn disabled() -> Self {
        Self {
            max_elapsed: None,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_elapsed.map_or(false, |d| !d.is_zero())
    }
}

// =============================================================================
// Run Reporting
// =============================================================================

/// Correlation id of one ingestion run: `<source name>#v<version>@tick<n>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobId {
    pub source_name: String,
    pub version: i64,
    pub tick: u64,
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#v{}@tick{}", self.source_name, self.version, self.tick)
    }
}

/// A feed row that did not become an observation
#[derive(Debug)]
pub struct RowFailure {
    /// Line in the feed payload
    pub line: u64,
    /// Raw address field
    pub value: String,
    pub error: Error,
}

/// Outcome of a run the store accepted
#[derive(Debug)]
pub struct IngestReport {
    pub job: JobId,
    pub source: Source,
    /// Decoded rows, valid or not
    pub rows_seen: usize,
    pub inserted: usize,
    pub failures: Vec<RowFailure>,
    pub duration: Duration,
}

impl IngestReport {
    pub fn version(&self) -> i64 {
        self.source.version
    }

    /// No row failed
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Runs one execution per call against the ledger, fetcher and store
pub struct IngestionPipeline {
    ledger: Arc<SourceLedger>,
    fetcher: FeedFetcherRef,
    retry: RetryPolicy,
    metrics: IngestMetrics,
}

impl IngestionPipeline {
    pub fn new(
        ledger: Arc<SourceLedger>,
        fetcher: FeedFetcherRef,
        retry: RetryPolicy,
        metrics: IngestMetrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            fetcher,
            retry,
            metrics,
        })
    }

    pub fn ledger(&self) -> &Arc<SourceLedger> {
        &self.ledger
    }

    pub fn metrics(&self) -> &IngestMetrics {
        &self.metrics
    }

    /// Execute `source` once as part of scheduler tick `tick`
    ///
    /// Fails only if prepare, fetch or decode fail; the source keeps its
    /// ledger state if prepare fails.
    pub async fn run(&self, source: &Source, tick: u64) -> Result<IngestReport> {
        let started = Instant::now();

        let prepared = match self.ledger.prepare(source.id).await {
            Ok(prepared) => prepared,
            Err(e) => {
                let outcome = match e {
                    Error::ExecutionNotEligible { .. } => "skipped",
                    _ => "failed",
                };
                self.metrics.runs_total.with_label_values(&[outcome]).inc();
                return Err(e);
            }
        };

        let job = JobId {
            source_name: prepared.name.clone(),
            version: prepared.version,
            tick,
        };
        let span = info_span!(
            "ingest",
            job = %job,
            source_id = %prepared.id,
            version = prepared.version
        );

        let result = self
            .execute(job, prepared, started)
            .instrument(span.clone())
            .await;

        let _entered = span.enter();
        match &result {
            Ok(report) => {
                self.metrics.runs_total.with_label_values(&["success"]).inc();
                info!(
                    rows = report.rows_seen,
                    inserted = report.inserted,
                    failed = report.failures.len(),
                    elapsed_ms = report.duration.as_millis() as u64,
                    "Ingestion run complete"
                );
            }
            Err(e) => {
                self.metrics.runs_total.with_label_values(&["failed"]).inc();
                warn!(error = %e, "Ingestion run aborted");
            }
        }
        self.metrics
            .run_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        result
    }

    async fn execute(&self, job: JobId, source: Source, started: Instant) -> Result<IngestReport> {
        let rows = self.fetch_with_retry(&source.url).await?;

        let observed_at = source
            .last_execution
            .unwrap_or_else(|| self.ledger.clock().now());
        let mut rows_seen = 0;
        let mut failures = Vec::new();
        let mut batch = Vec::new();
        let mut origins = Vec::new();

        for row in rows {
            let row = row?;
            rows_seen += 1;

            let value = row.address_field().to_string();
            match NodeAddress::parse(&value) {
                Ok(address) => {
                    batch.push(NodeObservation {
                        address,
                        source_id: source.id,
                        version: source.version,
                        observed_at,
                    });
                    origins.push((row.line, value));
                }
                Err(error) => {
                    warn!(line = row.line, value = %value, error = %error, "Skipping invalid row");
                    self.metrics.rows_total.with_label_values(&["invalid"]).inc();
                    failures.push(RowFailure {
                        line: row.line,
                        value,
                        error,
                    });
                }
            }
        }

        let outcome = self.ledger.storage().batch_insert_nodes(batch).await?;
        for rejected in outcome.failures {
            let (line, value) = origins
                .get(rejected.index)
                .cloned()
                .unwrap_or_else(|| (0, String::new()));
            warn!(line, value = %value, error = %rejected.error, "Store rejected row");
            self.metrics.rows_total.with_label_values(&["rejected"]).inc();
            failures.push(RowFailure {
                line,
                value,
                error: rejected.error,
            });
        }
        failures.sort_by_key(|f| f.line);

        self.metrics
            .rows_total
            .with_label_values(&["inserted"])
            .inc_by(outcome.inserted as u64);

        Ok(IngestReport {
            job,
            source,
            rows_seen,
            inserted: outcome.inserted,
            failures,
            duration: started.elapsed(),
        })
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<FeedRows> {
        let max_elapsed = match self.retry.max_elapsed {
            Some(max) if !max.is_zero() => max,
            _ => return self.fetcher.fetch(url).await,
        };

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry.initial_interval)
            .with_max_interval(self.retry.max_interval)
            .with_max_elapsed_time(Some(max_elapsed))
            .build();

        backoff::future::retry_notify(
            policy,
            || async {
                self.fetcher.fetch(url).await.map_err(|e| {
                    if e.is_retryable() {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            },
            |e: Error, wait: Duration| {
                self.metrics.fetch_retries_total.inc();
                warn!(url = %url, error = %e, retry_in_ms = wait.as_millis() as u64, "Feed fetch failed, retrying");
            },
        )
        .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::ports::{FeedFetcher, NodeFilter, NodeQuery, Period, RawRow, SourceId, Storage};
    use crate::ingest::fetcher::{decode_rows, FetcherConfig};
    use crate::ledger::ManualClock;
    use crate::storage::MemoryStore;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};

    /// One canned fetch response
    #[derive(Debug, Clone)]
    pub(crate) enum Scripted {
        Rows(Vec<&'static str>),
        /// Raw payload run through the feed decoder
        Payload(&'static [u8]),
        /// Payload whose connection drops after the given bytes
        Severed(&'static [u8]),
        Status(u16),
        Transient,
    }

    /// Reader that fails once its bytes are used up
    struct SeveredReader(std::io::Cursor<&'static [u8]>);

    impl std::io::Read for SeveredReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match std::io::Read::read(&mut self.0, buf)? {
                0 => Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "feed connection reset",
                )),
                n => Ok(n),
            }
        }
    }

    /// Serves canned responses per URL; the last one repeats
    #[derive(Default)]
    pub(crate) struct ScriptedFetcher {
        feeds: Mutex<HashMap<String, VecDeque<Scripted>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        pub fn with(self, url: &str, response: Scripted) -> Self {
            self.feeds
                .lock()
                .entry(url.to_string())
                .or_default()
                .push_back(response);
            self
        }

        /// Every fetched URL, in call order
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        pub fn calls_to(&self, url: &str) -> usize {
            self.calls.lock().iter().filter(|u| *u == url).count()
        }
    }

    #[async_trait]
    impl FeedFetcher for ScriptedFetcher {
        async fn fetch(&self, url: &str) -> Result<FeedRows> {
            self.calls.lock().push(url.to_string());
            let response = {
                let mut feeds = self.feeds.lock();
                let queue = feeds.get_mut(url);
                match queue {
                    Some(q) if q.len() > 1 => q.pop_front(),
                    Some(q) => q.front().cloned(),
                    None => None,
                }
            };

            match response.unwrap_or(Scripted::Status(404)) {
                Scripted::Rows(rows) => Ok(Box::new(rows.into_iter().enumerate().map(
                    |(i, field)| {
                        Ok(RawRow {
                            line: i as u64 + 1,
                            fields: vec![field.to_string()],
                        })
                    },
                ))),
                Scripted::Payload(bytes) => Ok(decode_rows(
                    &FetcherConfig::default(),
                    std::io::Cursor::new(bytes),
                )),
                Scripted::Severed(bytes) => Ok(decode_rows(
                    &FetcherConfig::default(),
                    SeveredReader(std::io::Cursor::new(bytes)),
                )),
                Scripted::Status(status) => Err(Error::FetchStatus {
                    url: url.to_string(),
                    status,
                }),
                Scripted::Transient => Err(Error::Storage("connection reset".into())),
            }
        }
    }

    pub(crate) fn t0() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    pub(crate) fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            max_elapsed: Some(Duration::from_secs(2)),
        }
    }

    fn setup(
        fetcher: ScriptedFetcher,
        retry: RetryPolicy,
    ) -> (Arc<IngestionPipeline>, Arc<ScriptedFetcher>, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let ledger = SourceLedger::new(store.clone(), clock.clone());
        let fetcher = Arc::new(fetcher);
        let pipeline = IngestionPipeline::new(
            ledger,
            fetcher.clone(),
            retry,
            IngestMetrics::detached().unwrap(),
        );
        (pipeline, fetcher, store, clock)
    }

    #[tokio::test]
    async fn test_partial_row_failure_scenario() {
        let url = "http://feeds.local/s7.csv";
        let (pipeline, _fetcher, store, clock) = setup(
            ScriptedFetcher::default().with(url, Scripted::Rows(vec!["1.2.3.4", "bad-addr", "5.6.7.8"])),
            RetryPolicy::disabled(),
        );
        let ledger = pipeline.ledger().clone();
        let hour = Period::parse("1h").unwrap();

        for i in 1..7 {
            ledger
                .create(&format!("filler-{}", i), "http://feeds.local/x.csv", hour)
                .await
                .unwrap();
        }
        let source = ledger.create("S7", url, hour).await.unwrap();
        assert_eq!(source.id, SourceId(7));

        // Two earlier executions bring the version to 2
        for _ in 0..2 {
            ledger.prepare(source.id).await.unwrap();
            clock.advance(chrono::Duration::minutes(61));
        }

        let report = pipeline.run(&source, 1).await.unwrap();
        assert_eq!(report.version(), 3);
        assert_eq!(report.job.to_string(), "S7#v3@tick1");
        assert_eq!(report.rows_seen, 3);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].line, 2);
        assert_eq!(report.failures[0].value, "bad-addr");
        assert_matches!(report.failures[0].error, Error::InvalidAddress { .. });
        assert!(report.failures[0].error.is_validation());

        let rows = store
            .list_nodes(&NodeQuery {
                filter: NodeFilter::Source(source.id),
                after: None,
                limit: 10,
            })
            .await
            .unwrap();
        let persisted: Vec<_> = rows.iter().map(|r| r.address.to_string()).collect();
        assert_eq!(persisted, vec!["1.2.3.4", "5.6.7.8"]);
        assert!(rows.iter().all(|r| r.version == 3 && r.observed_at == clock.now()));
    }

    #[tokio::test]
    async fn test_prepare_failure_leaves_no_trace() {
        let url = "http://feeds.local/a.csv";
        let (pipeline, fetcher, _store, _clock) = setup(
            ScriptedFetcher::default().with(url, Scripted::Rows(vec!["1.2.3.4"])),
            RetryPolicy::disabled(),
        );
        let ledger = pipeline.ledger().clone();
        let source = ledger.create("A", url, Period::parse("1h").unwrap()).await.unwrap();

        pipeline.run(&source, 1).await.unwrap();
        assert_matches!(
            pipeline.run(&source, 2).await,
            Err(Error::ExecutionNotEligible { .. })
        );
        assert_eq!(fetcher.calls_to(url), 1);
        assert_eq!(ledger.get(source.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_transient_fetch_is_retried() {
        let url = "http://feeds.local/flaky.csv";
        let (pipeline, fetcher, _store, _clock) = setup(
            ScriptedFetcher::default()
                .with(url, Scripted::Status(503))
                .with(url, Scripted::Transient)
                .with(url, Scripted::Rows(vec!["9.9.9.9"])),
            fast_retry(),
        );
        let source = pipeline
            .ledger()
            .create("flaky", url, Period::parse("1h").unwrap())
            .await
            .unwrap();

        let report = pipeline.run(&source, 1).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.version(), 1);
        assert_eq!(fetcher.calls_to(url), 3);
        assert_eq!(pipeline.metrics().fetch_retries_total.get(), 2);
    }

    #[tokio::test]
    async fn test_permanent_fetch_failure_is_not_retried() {
        let url = "http://feeds.local/gone.csv";
        let (pipeline, fetcher, _store, _clock) = setup(
            ScriptedFetcher::default().with(url, Scripted::Status(404)),
            fast_retry(),
        );
        let source = pipeline
            .ledger()
            .create("gone", url, Period::parse("1h").unwrap())
            .await
            .unwrap();

        assert_matches!(
            pipeline.run(&source, 1).await,
            Err(Error::FetchStatus { status: 404, .. })
        );
        assert_eq!(fetcher.calls_to(url), 1);
        // The execution was still claimed
        assert_eq!(pipeline.ledger().get(source.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_invalid_utf8_row_fails_alone() {
        let url = "http://feeds.local/mixed.csv";
        let (pipeline, _fetcher, store, _clock) = setup(
            ScriptedFetcher::default().with(url, Scripted::Payload(b"1.2.3.4\n\xff\xfe\n5.6.7.8\n")),
            RetryPolicy::disabled(),
        );
        let source = pipeline
            .ledger()
            .create("mixed", url, Period::parse("1h").unwrap())
            .await
            .unwrap();

        let report = pipeline.run(&source, 1).await.unwrap();
        assert_eq!(report.version(), 1);
        assert_eq!(report.rows_seen, 3);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].line, 2);
        assert_matches!(report.failures[0].error, Error::InvalidAddress { .. });
        assert_eq!(store.observation_count(), 2);
    }

    #[tokio::test]
    async fn test_severed_payload_aborts_run() {
        let url = "http://feeds.local/severed.csv";
        let (pipeline, fetcher, store, _clock) = setup(
            ScriptedFetcher::default().with(url, Scripted::Severed(b"1.2.3.4\n5.6.7.8\n")),
            fast_retry(),
        );
        let source = pipeline
            .ledger()
            .create("severed", url, Period::parse("1h").unwrap())
            .await
            .unwrap();

        assert_matches!(pipeline.run(&source, 1).await, Err(Error::Decode(_)));
        assert_eq!(fetcher.calls_to(url), 1);
        assert_eq!(store.observation_count(), 0);
        assert_eq!(pipeline.ledger().get(source.id).await.unwrap().version, 1);
    }

    #[test]
    fn test_retry_policy_switch() {
        assert!(RetryPolicy::default().is_enabled());
        assert!(!RetryPolicy::disabled().is_enabled());
        let zero = RetryPolicy {
            max_elapsed: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(!zero.is_enabled());
    }
}
