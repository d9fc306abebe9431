//! Health and readiness probe handlers.
//!
//! | Endpoint | Condition | Status |
//! |----------|-----------|--------|
//! | /health  | Process alive | 200 |
//! | /health  | Process stopped | 503 |
//! | /ready   | Config and component loaded, lifecycle Ready | 200 |
//! | /ready   | Otherwise | 503 |

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use std::sync::Arc;

use super::{LifecycleManager, LifecycleState};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct UnhealthyResponse {
    pub status: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessChecks {
    pub config_loaded: bool,
    pub component_loaded: bool,
}

impl ReadinessChecks {
    #[must_use]
    pub fn all_pass(&self) -> bool {
        self.config_loaded && self.component_loaded
    }

    #[must_use]
    pub fn first_failure(&self) -> Option<&'static str> {
        if !self.config_loaded {
            Some("config_loaded")
        } else if !self.component_loaded {
            Some("component_loaded")
        } else {
            None
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub checks: ReadinessChecks,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub fn health_router(lifecycle: Arc<LifecycleManager>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(readiness_handler))
        .with_state(lifecycle)
}

async fn health_handler(State(lifecycle): State<Arc<LifecycleManager>>) -> Response {
    if matches!(lifecycle.state(), LifecycleState::Stopped) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(UnhealthyResponse {
                status: "unhealthy",
                reason: "service_stopped".to_string(),
            }),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy",
            version: lifecycle.version(),
            uptime_seconds: lifecycle.uptime_seconds(),
        }),
    )
        .into_response()
}

async fn readiness_handler(State(lifecycle): State<Arc<LifecycleManager>>) -> Response {
    let checks = lifecycle.readiness_checks();

    if lifecycle.is_shutting_down() {
        return not_ready(checks, Some("shutting_down".to_string()));
    }
    if checks.all_pass() && lifecycle.is_ready() {
        return (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready",
                checks,
                reason: None,
            }),
        )
            .into_response();
    }

    let reason = match checks.first_failure() {
        Some(failed) => failed.to_string(),
        None => format!("lifecycle_state: {}", lifecycle.state()),
    };
    not_ready(checks, Some(reason))
}

fn not_ready(checks: ReadinessChecks, reason: Option<String>) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ReadinessResponse {
            status: "not_ready",
            checks,
            reason,
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleConfig;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn get_json(lifecycle: Arc<LifecycleManager>, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = health_router(lifecycle).oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_during_startup() {
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::default()));
        let (status, json) = get_json(lifecycle, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_health_when_stopped() {
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::default()));
        lifecycle.mark_stopped();
        let (status, _) = get_json(lifecycle, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_ready_waits_for_component() {
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::default()));
        lifecycle.mark_config_loaded();
        lifecycle.mark_ready();

        let (status, json) = get_json(Arc::clone(&lifecycle), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["reason"], "component_loaded");

        lifecycle.mark_component_loaded();
        let (status, json) = get_json(lifecycle, "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ready");
    }

    #[tokio::test]
    async fn test_not_ready_while_starting() {
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::default()));
        lifecycle.mark_config_loaded();
        lifecycle.mark_component_loaded();
        let (status, json) = get_json(lifecycle, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["reason"], "lifecycle_state: starting");
    }

    #[tokio::test]
    async fn test_not_ready_during_shutdown() {
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::default()));
        lifecycle.mark_config_loaded();
        lifecycle.mark_component_loaded();
        lifecycle.mark_ready();
        lifecycle.begin_shutdown();
        let (status, json) = get_json(lifecycle, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["reason"], "shutting_down");
    }
}
