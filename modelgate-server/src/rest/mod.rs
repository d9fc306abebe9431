//! REST surface.
//!
//! Every verb accepts the body in any supported dialect and answers in the
//! same one. `POST /` switches to event-push mode when the request carries
//! CloudEvents headers; without them it runs the protocol's default verb.
//!
//! | Method | Path | Verb |
//! |--------|------|------|
//! | POST | `/` | event, or predict / send-feedback per protocol |
//! | POST | `/predict`, `/api/v1.0/predictions` | predict |
//! | POST | `/v2/models/{name}/infer` | predict (V2) |
//! | POST | `/route` | route |
//! | POST | `/transform-input`, `/transform-output` | transforms |
//! | POST | `/aggregate` | aggregate |
//! | POST | `/score` | score |
//! | POST | `/send-feedback`, `/api/v1.0/feedback` | send feedback |
//! | GET | `/metadata`, `/protocol`, `/health/ping` | info |

mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use modelgate_core::error::GatewayError;
use modelgate_core::gateway::{Delivery, EventProcessor, GatewayService};
use modelgate_core::lifecycle::{LifecycleManager, RequestGuard};
use modelgate_core::telemetry::GatewayMetrics;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::app::Gateway;
use crate::logging::logging_layer;

const SURFACE: &str = "rest";

#[derive(Clone)]
pub struct RestState {
    pub service: Arc<GatewayService>,
    pub events: Arc<EventProcessor>,
    pub delivery: Arc<dyn Delivery>,
    pub lifecycle: Arc<LifecycleManager>,
    pub metrics: Arc<GatewayMetrics>,
    pub reply_url: Option<String>,
}

impl RestState {
    pub fn from_gateway(gateway: &Gateway) -> Self {
        Self {
            service: gateway.service.clone(),
            events: gateway.events.clone(),
            delivery: gateway.delivery.clone(),
            lifecycle: gateway.lifecycle.clone(),
            metrics: gateway.metrics.clone(),
            reply_url: gateway.reply_url(),
        }
    }

    fn admit(&self) -> Result<RequestGuard, GatewayError> {
        self.lifecycle
            .track_request()
            .ok_or_else(|| GatewayError::ServiceUnavailable {
                reason: "shutting down".to_string(),
            })
    }

    fn record<T>(&self, method: &str, result: &Result<T, GatewayError>, start: Instant) {
        let outcome = match result {
            Ok(_) => "success",
            Err(e) => e.error_type_name(),
        };
        self.metrics
            .record_request(SURFACE, method, outcome, start.elapsed().as_secs_f64() * 1000.0);
    }

    /// Runs a pipeline call on the blocking pool under a request guard.
    async fn call<T, F>(&self, method: &'static str, f: F) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: FnOnce(&GatewayService) -> Result<T, GatewayError> + Send + 'static,
    {
        let _guard = self.admit()?;
        let start = Instant::now();
        let service = self.service.clone();
        let result = blocking(move || f(&service)).await;
        self.record(method, &result, start);
        result
    }
}

/// Runs `f` on the blocking pool, mapping a panicked or cancelled task to
/// an internal error.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, GatewayError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, GatewayError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| {
            Err(GatewayError::InternalError {
                details: format!("request task failed: {e}"),
            })
        })
}

pub fn router(state: RestState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", post(handlers::root))
        .route("/predict", post(handlers::predict))
        .route("/api/v1.0/predictions", post(handlers::predict))
        .route("/v2/models/{name}/infer", post(handlers::infer_v2))
        .route("/route", post(handlers::route))
        .route("/transform-input", post(handlers::transform_input))
        .route("/transform-output", post(handlers::transform_output))
        .route("/aggregate", post(handlers::aggregate))
        .route("/score", post(handlers::score))
        .route("/send-feedback", post(handlers::send_feedback))
        .route("/api/v1.0/feedback", post(handlers::send_feedback))
        .route("/metadata", get(handlers::metadata))
        .route("/protocol", get(handlers::protocol))
        .route("/health/ping", get(handlers::ping))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(logging_layer())
        .with_state(state)
}

/// Serves the REST router on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "REST server listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("REST server shutting down");
        })
        .await
}
