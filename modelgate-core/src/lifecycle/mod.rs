//! Process lifecycle: startup, readiness, request tracking and drain.
//!
//! ```text
//! Starting --mark_ready--> Ready --begin_shutdown--> ShuttingDown --mark_stopped--> Stopped
//! ```
//!
//! Every surface (REST, RPC, columnar) takes a [`RequestGuard`] per request
//! so shutdown can wait for in-flight work, and listens on the shared
//! [`CancellationToken`] to stop accepting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod health;

pub use health::{HealthResponse, ReadinessChecks, ReadinessResponse, health_router};

use crate::telemetry::GatewayMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Ready,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Shutdown timing.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Upper bound for the whole shutdown sequence.
    pub shutdown_timeout: Duration,
    /// Time allowed for in-flight requests. Kept below `shutdown_timeout`.
    pub drain_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(25),
        }
    }
}

impl LifecycleConfig {
    /// Reads `MODELGATE_SHUTDOWN_TIMEOUT_SECS` and
    /// `MODELGATE_DRAIN_TIMEOUT_SECS`. A drain timeout that does not leave
    /// a second of shutdown budget is reduced.
    #[must_use]
    pub fn from_env() -> Self {
        let default = Self::default();
        let shutdown_timeout =
            parse_duration_env("MODELGATE_SHUTDOWN_TIMEOUT_SECS", default.shutdown_timeout);
        let drain_timeout =
            parse_duration_env("MODELGATE_DRAIN_TIMEOUT_SECS", default.drain_timeout);
        Self::clamped(shutdown_timeout, drain_timeout)
    }

    fn clamped(shutdown_timeout: Duration, drain_timeout: Duration) -> Self {
        const MIN_DRAIN: Duration = Duration::from_secs(1);
        let max_drain = shutdown_timeout
            .saturating_sub(Duration::from_secs(1))
            .max(MIN_DRAIN);

        let adjusted = drain_timeout.clamp(MIN_DRAIN, max_drain);
        if adjusted != drain_timeout {
            warn!(
                drain_timeout_secs = drain_timeout.as_secs(),
                shutdown_timeout_secs = shutdown_timeout.as_secs(),
                adjusted_drain_secs = adjusted.as_secs(),
                "drain_timeout out of range, adjusting"
            );
        }
        Self {
            shutdown_timeout,
            drain_timeout: adjusted,
        }
    }
}

fn parse_duration_env(var_name: &str, default: Duration) -> Duration {
    match std::env::var(var_name) {
        Ok(value) => match value.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                warn!(
                    var = var_name,
                    value = %value,
                    default_secs = default.as_secs(),
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

pub struct LifecycleManager {
    state: ArcSwap<LifecycleState>,
    started_at: Instant,
    shutdown_token: CancellationToken,
    active_requests: AtomicUsize,
    config_loaded: AtomicBool,
    component_loaded: AtomicBool,
    config: LifecycleConfig,
    version: &'static str,
    metrics: ArcSwapOption<GatewayMetrics>,
}

impl LifecycleManager {
    #[must_use]
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            state: ArcSwap::new(Arc::new(LifecycleState::Starting)),
            started_at: Instant::now(),
            shutdown_token: CancellationToken::new(),
            active_requests: AtomicUsize::new(0),
            config_loaded: AtomicBool::new(false),
            component_loaded: AtomicBool::new(false),
            config,
            version: env!("CARGO_PKG_VERSION"),
            metrics: ArcSwapOption::empty(),
        }
    }

    pub fn set_metrics(&self, metrics: Arc<GatewayMetrics>) {
        metrics.set_component_loaded(self.component_loaded.load(Ordering::SeqCst));
        self.metrics.store(Some(metrics));
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), LifecycleState::Ready)
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::ShuttingDown | LifecycleState::Stopped
        )
    }

    pub fn mark_ready(&self) {
        self.state.store(Arc::new(LifecycleState::Ready));
        info!(
            version = %self.version,
            startup_duration_ms = self.started_at.elapsed().as_millis(),
            "modelgate ready"
        );
    }

    pub fn mark_config_loaded(&self) {
        self.config_loaded.store(true, Ordering::SeqCst);
    }

    pub fn mark_component_loaded(&self) {
        self.component_loaded.store(true, Ordering::SeqCst);
        if let Some(metrics) = self.metrics.load().as_ref() {
            metrics.set_component_loaded(true);
        }
    }

    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Moves to ShuttingDown and cancels every listener.
    pub fn begin_shutdown(&self) {
        self.state.store(Arc::new(LifecycleState::ShuttingDown));
        self.shutdown_token.cancel();
        info!(
            active_requests = self.active_requests.load(Ordering::SeqCst),
            "Shutdown initiated"
        );
    }

    /// Returns `None` once shutdown has begun.
    #[must_use]
    pub fn track_request(self: &Arc<Self>) -> Option<RequestGuard> {
        if self.is_shutting_down() {
            return None;
        }
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        Some(RequestGuard {
            manager: Arc::clone(self),
        })
    }

    #[must_use]
    pub fn active_request_count(&self) -> usize {
        self.active_requests.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    #[must_use]
    pub fn version(&self) -> &'static str {
        self.version
    }

    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    #[must_use]
    pub fn readiness_checks(&self) -> ReadinessChecks {
        ReadinessChecks {
            config_loaded: self.config_loaded.load(Ordering::SeqCst),
            component_loaded: self.component_loaded.load(Ordering::SeqCst),
        }
    }

    /// Waits for in-flight requests, up to the drain timeout.
    pub async fn drain_requests(&self) -> DrainResult {
        let deadline = Instant::now() + self.config.drain_timeout;
        let mut last_log = Instant::now();

        loop {
            let active = self.active_requests.load(Ordering::SeqCst);
            if active == 0 {
                return DrainResult::Complete;
            }
            if Instant::now() > deadline {
                warn!(
                    active_requests = active,
                    "Drain timeout exceeded, forcing shutdown"
                );
                return DrainResult::Timeout { remaining: active };
            }
            if last_log.elapsed() >= Duration::from_secs(5) {
                info!(active_requests = active, "Draining requests...");
                last_log = Instant::now();
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn mark_stopped(&self) {
        self.state.store(Arc::new(LifecycleState::Stopped));
    }
}

/// Decrements the active request count on drop.
pub struct RequestGuard {
    manager: Arc<LifecycleManager>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.manager.active_requests.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete,
    Timeout { remaining: usize },
}
