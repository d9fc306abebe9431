//! Admin server for health checks and metrics.
//!
//! Runs on its own port (default 6000) so probes and scrapes never share a
//! listener with inference traffic:
//!
//! - `GET /health` liveness, `GET /ready` readiness (from the core
//!   lifecycle router)
//! - `GET /metrics` OpenMetrics text for gateway and component metrics

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::ports::admin_port;
use modelgate_core::lifecycle::{LifecycleManager, health_router};

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Admin server configuration.
#[derive(Debug, Clone)]
pub struct AdminServerConfig {
    /// Port to listen on (default: 6000)
    pub port: u16,
    /// Bind address (default: 127.0.0.1)
    pub bind_addr: String,
}

impl Default for AdminServerConfig {
    fn default() -> Self {
        Self {
            port: admin_port(),
            bind_addr: "127.0.0.1".to_string(),
        }
    }
}

impl AdminServerConfig {
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn bind_string(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

#[derive(Clone)]
pub struct AdminState {
    pub lifecycle: Arc<LifecycleManager>,
    pub registry: Arc<Registry>,
}

pub struct AdminServer {
    config: AdminServerConfig,
    state: AdminState,
}

impl AdminServer {
    pub fn new(lifecycle: Arc<LifecycleManager>, registry: Arc<Registry>) -> Self {
        Self::with_config(lifecycle, registry, AdminServerConfig::default())
    }

    pub fn with_config(
        lifecycle: Arc<LifecycleManager>,
        registry: Arc<Registry>,
        config: AdminServerConfig,
    ) -> Self {
        Self {
            config,
            state: AdminState {
                lifecycle,
                registry,
            },
        }
    }

    /// Health and readiness come from the core lifecycle router; this adds
    /// `/metrics`.
    pub fn router(&self) -> Router {
        let metrics_router = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone());

        health_router(self.state.lifecycle.clone()).merge(metrics_router)
    }

    /// Serves until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound or serving fails.
    pub async fn run(
        self,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let bind_addr = self.config.bind_string();
        let listener = TcpListener::bind(&bind_addr).await?;

        info!(addr = %bind_addr, "Admin server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Admin server shutting down");
            })
            .await?;

        Ok(())
    }
}

async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let mut buffer = String::new();

    if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, &state.registry) {
        error!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {e}"),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)],
        buffer,
    )
        .into_response()
}
