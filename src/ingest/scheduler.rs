//! Scheduler Loop
//!
//! Alternates between two states for the life of the process:
//! - `Scanning`: list eligible sources and run the pipeline for each
//! - `Idle`: sleep for the tick interval
//!
//! A failing source is logged and counted; it never stops the scan or the
//! loop.

use crate::error::Error;
use crate::ingest::pipeline::IngestionPipeline;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Idle time between scans
    pub tick_interval: Duration,
    /// Sources run concurrently within one scan; 1 is sequential
    pub batch_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            batch_concurrency: 1,
        }
    }
}

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Scanning,
    Idle,
}

/// Tally of one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub tick: u64,
    pub eligible: usize,
    pub succeeded: usize,
    /// Lost the eligibility window to another preparer
    pub skipped: usize,
    pub failed: usize,
    /// Row failures across all successful runs
    pub row_failures: usize,
}

// =============================================================================
// Scheduler
// =============================================================================

/// Owned scheduler loop over one ingestion pipeline
pub struct Scheduler {
    config: SchedulerConfig,
    pipeline: Arc<IngestionPipeline>,
    state: SchedulerState,
    tick: u64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, pipeline: Arc<IngestionPipeline>) -> Self {
        Self {
            config,
            pipeline,
            state: SchedulerState::Idle,
            tick: 0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Number of scans started so far
    pub fn ticks(&self) -> u64 {
        self.tick
    }

    /// One Scanning pass over the currently eligible sources
    pub async fn scan_once(&mut self) -> ScanSummary {
        self.state = SchedulerState::Scanning;
        self.tick += 1;
        let tick = self.tick;
        let mut summary = ScanSummary {
            tick,
            ..Default::default()
        };

        let sources = match self.pipeline.ledger().list_eligible().await {
            Ok(sources) => sources,
            Err(e) => {
                error!(tick, error = %e, "Failed to list eligible sources");
                self.state = SchedulerState::Idle;
                return summary;
            }
        };
        summary.eligible = sources.len();
        self.pipeline
            .metrics()
            .eligible_sources
            .set(sources.len() as i64);
        debug!(tick, eligible = sources.len(), "Scanning");

        let pipeline = &self.pipeline;
        let mut results = stream::iter(sources)
            .map(|source| async move {
                let result = pipeline.run(&source, tick).await;
                (source, result)
            })
            .buffered(self.config.batch_concurrency.max(1));

        while let Some((source, result)) = results.next().await {
            match result {
                Ok(report) => {
                    summary.succeeded += 1;
                    summary.row_failures += report.failures.len();
                }
                Err(Error::ExecutionNotEligible { .. }) => summary.skipped += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        tick,
                        source_id = %source.id,
                        name = %source.name,
                        error = %e,
                        "Source run failed"
                    );
                }
            }
        }
        drop(results);

        self.pipeline.metrics().scans_total.inc();
        if summary.eligible > 0 {
            info!(
                tick,
                eligible = summary.eligible,
                succeeded = summary.succeeded,
                skipped = summary.skipped,
                failed = summary.failed,
                "Scan complete"
            );
        }

        self.state = SchedulerState::Idle;
        summary
    }

    /// Scan and idle until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            tick_interval_ms = self.config.tick_interval.as_millis() as u64,
            batch_concurrency = self.config.batch_concurrency,
            "Scheduler started"
        );

        while !shutdown.is_cancelled() {
            self.scan_once().await;

            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        info!(ticks = self.tick, "Scheduler stopped");
    }
}
