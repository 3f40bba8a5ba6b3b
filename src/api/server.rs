//! API Server
//!
//! Serves the REST router with request tracing, a request timeout and
//! graceful shutdown.

use crate::error::{Error, Result};
use crate::ledger::SourceLedger;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::rest::{PageLimits, RestRouter};

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
    /// Largest accepted `limit`
    pub max_page_size: usize,
    /// `limit` used when none is given
    pub default_page_size: usize,
    /// Allow cross-origin requests from anywhere
    pub cors_permissive: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([127, 0, 0, 1], 3333)),
            request_timeout_secs: 30,
            max_page_size: 1000,
            default_page_size: 10,
            cors_permissive: false,
        }
    }
}

impl ApiServerConfig {
    fn page_limits(&self) -> PageLimits {
        PageLimits {
            default: self.default_page_size,
            max: self.max_page_size,
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// REST API server
pub struct ApiServer {
    config: ApiServerConfig,
    ledger: Arc<SourceLedger>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, ledger: Arc<SourceLedger>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            ledger,
            shutdown_tx,
        }
    }

    /// Full application router with middleware
    pub fn router(&self) -> axum::Router {
        let router = RestRouter::new(self.ledger.clone(), self.config.page_limits())
            .build()
            .layer(TimeoutLayer::new(Duration::from_secs(
                self.config.request_timeout_secs,
            )))
            .layer(TraceLayer::new_for_http());

        if self.config.cors_permissive {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Serve until `shutdown` is called
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.rest_addr;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let app = self.router();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(
            addr = %listener.local_addr()?,
            store = self.ledger.storage().backend_name(),
            "REST API listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
