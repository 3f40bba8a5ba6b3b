//! nodefeed
//!
//! Versioned feed ingestion and node registry service. Runs the REST API,
//! the ingestion scheduler, or both in one process.
//!
//! # Process Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  REST API (:3333)      Health (:8081)      Metrics (:8080)   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Scheduler ──► Ingestion Pipeline ──► Feed Fetcher           │
//! ├──────────────────────────────────────────────────────────────┤
//! │               Storage (sqlite file | in-memory)              │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nodefeed::{
    ApiServer, ApiServerConfig, Error, FetcherConfig, HttpFeedFetcher, IngestMetrics,
    IngestionPipeline, MemoryStore, Result, RetryPolicy, Scheduler, SchedulerConfig,
    SourceLedger, SqliteStore, StorageRef, SystemClock,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Which halves of the service this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// REST API and scheduler
    All,
    /// REST API only
    Api,
    /// Scheduler only
    Ingest,
}

impl Mode {
    fn runs_api(self) -> bool {
        matches!(self, Mode::All | Mode::Api)
    }

    fn runs_ingest(self) -> bool {
        matches!(self, Mode::All | Mode::Ingest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Sqlite,
    Memory,
}

/// nodefeed - versioned feed ingestion and node registry
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Components to run
    #[arg(long, env = "MODE", value_enum, default_value = "all")]
    mode: Mode,

    /// Storage backend
    #[arg(long, env = "STORE", value_enum, default_value = "sqlite")]
    store: StoreKind,

    /// SQLite database file
    #[arg(long, env = "DATABASE_PATH", default_value = "nodefeed.db")]
    database_path: PathBuf,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:3333")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Idle time between scheduler scans in seconds
    #[arg(long, env = "TICK_INTERVAL_SECS", default_value = "10")]
    tick_interval_secs: u64,

    /// Sources ingested concurrently within one scan
    #[arg(long, env = "BATCH_CONCURRENCY", default_value = "1")]
    batch_concurrency: usize,

    /// Feed request timeout in seconds
    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value = "30")]
    fetch_timeout_secs: u64,

    /// Retry budget for transient fetch failures in seconds (0 disables)
    #[arg(long, env = "RETRY_MAX_ELAPSED_SECS", default_value = "60")]
    retry_max_elapsed_secs: u64,

    /// Allow cross-origin API requests
    #[arg(long, env = "CORS_PERMISSIVE")]
    cors_permissive: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!(
        version = nodefeed::VERSION,
        mode = ?args.mode,
        store = ?args.store,
        "Starting nodefeed"
    );

    let storage: StorageRef = match args.store {
        StoreKind::Sqlite => Arc::new(SqliteStore::open(&args.database_path)?),
        StoreKind::Memory => {
            warn!("Using in-memory store; state is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };
    let ledger = SourceLedger::new(storage.clone(), Arc::new(SystemClock));

    // Start health server
    let health_addr = parse_addr(&args.health_addr, "health server")?;
    let health_storage = storage.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_storage).await {
            error!(error = %e, "Health server error");
        }
    });

    // Start metrics server
    let metrics_addr = parse_addr(&args.metrics_addr, "metrics server")?;
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr).await {
            error!(error = %e, "Metrics server error");
        }
    });

    let shutdown = CancellationToken::new();

    // Start scheduler
    let scheduler_handle = if args.mode.runs_ingest() {
        let fetcher = HttpFeedFetcher::new(FetcherConfig {
            request_timeout: Duration::from_secs(args.fetch_timeout_secs),
            ..Default::default()
        })?;
        let retry = RetryPolicy {
            max_elapsed: Some(Duration::from_secs(args.retry_max_elapsed_secs)),
            ..Default::default()
        };
        let metrics = IngestMetrics::new(prometheus::default_registry())?;
        let pipeline = IngestionPipeline::new(ledger.clone(), Arc::new(fetcher), retry, metrics);
        let scheduler = Scheduler::new(
            SchedulerConfig {
                tick_interval: Duration::from_secs(args.tick_interval_secs),
                batch_concurrency: args.batch_concurrency,
            },
            pipeline,
        );
        Some(tokio::spawn(scheduler.run(shutdown.clone())))
    } else {
        None
    };

    // Start API server
    let api_server = if args.mode.runs_api() {
        let config = ApiServerConfig {
            rest_addr: parse_addr(&args.api_addr, "REST API")?,
            cors_permissive: args.cors_permissive,
            ..Default::default()
        };
        Some(Arc::new(ApiServer::new(config, ledger.clone())))
    } else {
        None
    };
    let api_handle = api_server.clone().map(|server| {
        tokio::spawn(async move { server.run().await })
    });

    let api_exit = async {
        match api_handle {
            Some(handle) => handle
                .await
                .map_err(|e| Error::Internal(format!("API task failed: {}", e)))?,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received");
        }
        result = api_exit => {
            if let Err(e) = result {
                error!(error = %e, "API server stopped");
            }
        }
    }

    shutdown.cancel();
    if let Some(server) = &api_server {
        server.shutdown();
    }
    if let Some(handle) = scheduler_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Scheduler task failed");
        }
    }

    info!("nodefeed shutdown complete");
    Ok(())
}

fn parse_addr(raw: &str, what: &str) -> Result<SocketAddr> {
    raw.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} address {:?}: {}", what, raw, e)))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        level @ ("trace" | "debug" | "info" | "warn" | "error") => level.to_string(),
        other => {
            return Err(Error::Configuration(format!("Unknown log level: {}", other)));
        }
    };

    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        format!("{},hyper=warn,tower=warn,tower_http=info,axum=info,reqwest=info", level)
    });
    let filter = EnvFilter::try_new(&directives)
        .map_err(|e| Error::Configuration(format!("Invalid log filter {:?}: {}", directives, e)))?;

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: SocketAddr, storage: StorageRef) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let storage = storage.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let storage = storage.clone();
                async move {
                    let (status, body) = match req.uri().path() {
                        "/healthz" | "/livez" => (StatusCode::OK, "ok"),
                        "/readyz" => match storage.health_check().await {
                            Ok(true) => (StatusCode::OK, "ok"),
                            _ => (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable"),
                        },
                        _ => (StatusCode::NOT_FOUND, "not found"),
                    };
                    let mut response = Response::new(Body::from(body));
                    *response.status_mut() = status;
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!(addr = %addr, "Health server listening");
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Failed to bind health server: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let mut response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    match encoder.encode(&metric_families, &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => {
                            let mut response = Response::new(Body::from(e.to_string()));
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            response
                        }
                    }
                }
                _ => {
                    let mut response = Response::new(Body::from("not found"));
                    *response.status_mut() = StatusCode::NOT_FOUND;
                    response
                }
            };
            response.headers_mut().entry("cache-control").or_insert(HeaderValue::from_static("no-store"));
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!(addr = %addr, "Metrics server listening");
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
