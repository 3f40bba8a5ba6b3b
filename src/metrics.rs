//! Ingestion Metrics
//!
//! Prometheus collectors for scheduler scans and pipeline runs. Collectors
//! are registered into a caller-supplied registry; the binary uses the
//! process-wide default registry that `/metrics` gathers from.

use crate::error::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Collectors for the ingestion side of the service
#[derive(Clone)]
pub struct IngestMetrics {
    /// Pipeline runs by outcome (`success`, `failed`, `skipped`)
    pub runs_total: IntCounterVec,
    /// Feed rows by result (`inserted`, `invalid`, `rejected`)
    pub rows_total: IntCounterVec,
    /// Transient fetch failures that were retried
    pub fetch_retries_total: IntCounter,
    pub run_duration_seconds: Histogram,
    /// Sources found eligible by the most recent scan
    pub eligible_sources: IntGauge,
    pub scans_total: IntCounter,
}

impl IngestMetrics {
    /// Create the collectors and register them
    pub fn new(registry: &Registry) -> Result<Self> {
        let metrics = Self {
            runs_total: IntCounterVec::new(
                Opts::new("nodefeed_ingest_runs_total", "Ingestion runs by outcome"),
                &["outcome"],
            )?,
            rows_total: IntCounterVec::new(
                Opts::new("nodefeed_ingest_rows_total", "Feed rows by result"),
                &["result"],
            )?,
            fetch_retries_total: IntCounter::new(
                "nodefeed_fetch_retries_total",
                "Retried feed fetch attempts",
            )?,
            run_duration_seconds: Histogram::with_opts(
                HistogramOpts::new(
                    "nodefeed_ingest_run_duration_seconds",
                    "Duration of ingestion runs",
                )
                .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0]),
            )?,
            eligible_sources: IntGauge::new(
                "nodefeed_eligible_sources",
                "Sources eligible in the latest scan",
            )?,
            scans_total: IntCounter::new("nodefeed_scans_total", "Completed scheduler scans")?,
        };

        registry.register(Box::new(metrics.runs_total.clone()))?;
        registry.register(Box::new(metrics.rows_total.clone()))?;
        registry.register(Box::new(metrics.fetch_retries_total.clone()))?;
        registry.register(Box::new(metrics.run_duration_seconds.clone()))?;
        registry.register(Box::new(metrics.eligible_sources.clone()))?;
        registry.register(Box::new(metrics.scans_total.clone()))?;

        Ok(metrics)
    }

    /// Collectors registered in a private registry
    pub fn detached() -> Result<Self> {
        Self::new(&Registry::new())
    }
}
