//! Outbound reply delivery for event-push mode.
//!
//! Replies are POSTed to the configured reply target as binary-mode
//! CloudEvents. Delivery is best-effort: the inbound event has already
//! been acknowledged, so failures are retried with capped exponential
//! backoff and then dropped with an error log.
//!
//! # Retry policy
//!
//! - Connection errors, timeouts, HTTP 5xx and 429 are retried
//! - Other 4xx responses are dropped immediately
//! - Backoff is `initial_backoff * 4^attempt`, capped at `max_backoff`

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::Client;
use tracing::{debug, error, warn};

use crate::error::GatewayError;
use crate::telemetry::GatewayMetrics;

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Configuration for the delivery client.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryConfig {
    /// Reply target; delivery is disabled when `None`.
    pub reply_url: Option<String>,
    /// Per-attempt timeout (connection + response)
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            reply_url: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(val) => val.parse().unwrap_or_else(|_| {
            warn!(var = name, value = %val, default, "Invalid integer in environment, using default");
            default
        }),
        Err(_) => default,
    }
}

impl DeliveryConfig {
    /// Applies environment overrides on top of `self`.
    ///
    /// # Environment Variables
    ///
    /// - `MODELGATE_REPLY_URL`: reply target
    /// - `MODELGATE_DELIVERY_TIMEOUT_SECS` (default: 10)
    /// - `MODELGATE_DELIVERY_MAX_ATTEMPTS` (default: 3)
    ///
    /// Unparseable numbers are logged and the current value is kept.
    pub fn with_env(mut self) -> Self {
        if let Ok(url) = std::env::var("MODELGATE_REPLY_URL") {
            self.reply_url = Some(url).filter(|u| !u.is_empty());
        }
        self.timeout = Duration::from_secs(env_u64(
            "MODELGATE_DELIVERY_TIMEOUT_SECS",
            self.timeout.as_secs(),
        ));
        let attempts = env_u64("MODELGATE_DELIVERY_MAX_ATTEMPTS", u64::from(self.max_attempts));
        self.max_attempts = u32::try_from(attempts).unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1);
        self
    }

    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    pub fn with_reply_url(reply_url: impl Into<String>) -> Self {
        Self {
            reply_url: Some(reply_url.into()),
            ..Default::default()
        }
    }

    /// Backoff before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 4u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// One reply ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub correlation_id: String,
    /// Reply target of the inbound event. Falls back to the configured
    /// reply URL when `None`.
    pub target: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

/// Sends reply events (enables mocking in tests).
#[async_trait::async_trait]
pub trait Delivery: Send + Sync {
    /// Sends one event, retrying per policy. Errors are the final failure.
    async fn deliver(&self, event: &OutboundEvent) -> Result<(), GatewayError>;
}

/// HTTP delivery client.
#[derive(Clone)]
pub struct DeliveryClient {
    client: Client,
    config: DeliveryConfig,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl DeliveryClient {
    /// # Errors
    ///
    /// `InternalError` if the reply URL is not absolute or the HTTP client
    /// cannot be built.
    pub fn new(config: DeliveryConfig) -> Result<Self, GatewayError> {
        if let Some(url) = &config.reply_url {
            reqwest::Url::parse(url).map_err(|e| GatewayError::InternalError {
                details: format!("invalid reply url '{url}': {e}"),
            })?;
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| GatewayError::InternalError {
                details: format!("delivery client build error: {e}"),
            })?;

        Ok(Self {
            client,
            config,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.reply_url.is_some()
    }

    /// Delivers with retries to the event's target, or to the configured
    /// reply URL.
    #[tracing::instrument(skip_all, fields(correlation_id = %event.correlation_id))]
    pub async fn deliver_with_retry(&self, event: &OutboundEvent) -> Result<(), GatewayError> {
        let target = event.target.as_deref().filter(|url| !url.is_empty());
        let Some(url) = target.or(self.config.reply_url.as_deref()) else {
            debug!("No reply target configured, skipping delivery");
            return Ok(());
        };

        let start = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.deliver_once(url, event).await {
                Ok(()) => {
                    self.record("delivered", start);
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if !e.is_retriable() || attempt >= max_attempts {
                        error!(
                            attempts = attempt,
                            error = %e,
                            url,
                            "Dropping reply event"
                        );
                        self.record("dropped", start);
                        return Err(e);
                    }

                    let backoff = self.config.backoff(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Reply delivery failed, retrying"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_delivery_retry();
                    }
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn record(&self, outcome: &str, start: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_delivery(outcome, start.elapsed().as_secs_f64() * 1000.0);
        }
    }

    /// Single attempt, no retry.
    async fn deliver_once(&self, url: &str, event: &OutboundEvent) -> Result<(), GatewayError> {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(event.body.clone());
        for (name, value) in &event.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| self.classify_error(e, url))?;
        let status = response.status();
        if status.is_success() {
            debug!(status = %status, "Reply delivered");
            Ok(())
        } else {
            Err(GatewayError::DeliveryRejected {
                status: status.as_u16(),
            })
        }
    }

    fn classify_error(&self, error: reqwest::Error, url: &str) -> GatewayError {
        if error.is_timeout() {
            GatewayError::DeliveryTimeout {
                url: url.to_string(),
                timeout_secs: self.config.timeout.as_secs(),
            }
        } else {
            GatewayError::DeliveryFailed {
                url: url.to_string(),
                reason: error.to_string(),
            }
        }
    }
}

#[async_trait::async_trait]
impl Delivery for DeliveryClient {
    async fn deliver(&self, event: &OutboundEvent) -> Result<(), GatewayError> {
        self.deliver_with_retry(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// RAII guard that restores env vars on drop.
    struct EnvVarGuard {
        vars: Vec<(&'static str, Option<String>)>,
    }

    impl EnvVarGuard {
        fn new(var_names: &[&'static str]) -> Self {
            let vars = var_names
                .iter()
                .map(|&name| (name, std::env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            for (name, original) in &self.vars {
                // SAFETY: serialized by #[serial]
                unsafe {
                    match original {
                        Some(val) => std::env::set_var(name, val),
                        None => std::env::remove_var(name),
                    }
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "MODELGATE_REPLY_URL",
        "MODELGATE_DELIVERY_TIMEOUT_SECS",
        "MODELGATE_DELIVERY_MAX_ATTEMPTS",
    ];

    fn fast_config(url: String) -> DeliveryConfig {
        DeliveryConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..DeliveryConfig::with_reply_url(url)
        }
    }

    fn event() -> OutboundEvent {
        OutboundEvent {
            correlation_id: "1234".into(),
            target: None,
            headers: BTreeMap::from([
                ("ce-id".to_string(), "1234".to_string()),
                ("ce-source".to_string(), "io.modelgate".to_string()),
            ]),
            body: Bytes::from_static(br#"{"data":{"ndarray":[1]}}"#),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = DeliveryConfig::default();
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(400));
        assert_eq!(config.backoff(2), Duration::from_millis(1600));
        assert_eq!(config.backoff(3), Duration::from_secs(2));
        assert_eq!(config.backoff(40), Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_url_rejected() {
        let result = DeliveryClient::new(DeliveryConfig::with_reply_url("not a url"));
        assert!(matches!(result, Err(GatewayError::InternalError { .. })));
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        let _guard = EnvVarGuard::new(ENV_VARS);
        // SAFETY: serialized by #[serial]
        unsafe {
            std::env::set_var("MODELGATE_REPLY_URL", "http://sink:8080");
            std::env::set_var("MODELGATE_DELIVERY_TIMEOUT_SECS", "3");
            std::env::set_var("MODELGATE_DELIVERY_MAX_ATTEMPTS", "5");
        }
        let config = DeliveryConfig::from_env();
        assert_eq!(config.reply_url.as_deref(), Some("http://sink:8080"));
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.max_attempts, 5);
    }

    #[test]
    #[serial]
    fn test_config_from_env_invalid_values_fall_back() {
        let _guard = EnvVarGuard::new(ENV_VARS);
        // SAFETY: serialized by #[serial]
        unsafe {
            std::env::remove_var("MODELGATE_REPLY_URL");
            std::env::set_var("MODELGATE_DELIVERY_TIMEOUT_SECS", "soon");
            std::env::set_var("MODELGATE_DELIVERY_MAX_ATTEMPTS", "many");
        }
        let config = DeliveryConfig::from_env();
        assert!(config.reply_url.is_none());
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(config.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_delivers_with_ce_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("ce-id", "1234"))
            .and(header("ce-source", "io.modelgate"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = DeliveryClient::new(fast_config(server.uri())).unwrap();
        client.deliver(&event()).await.unwrap();
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = DeliveryClient::new(fast_config(server.uri())).unwrap();
        let err = client.deliver(&event()).await.unwrap_err();
        assert_eq!(err, GatewayError::DeliveryRejected { status: 503 });
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let client = DeliveryClient::new(fast_config(server.uri())).unwrap();
        assert!(client.deliver(&event()).await.is_ok());
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let client = DeliveryClient::new(fast_config(server.uri())).unwrap();
        assert!(client.deliver(&event()).await.is_err());
    }

    #[tokio::test]
    async fn test_event_target_takes_precedence() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/per-event"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/configured"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let targeted = OutboundEvent {
            target: Some(format!("{}/per-event", server.uri())),
            ..event()
        };
        let configured = DeliveryClient::new(fast_config(format!("{}/configured", server.uri()))).unwrap();
        configured.deliver(&targeted).await.unwrap();

        let unconfigured = DeliveryClient::new(DeliveryConfig::default()).unwrap();
        unconfigured.deliver(&targeted).await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_without_reply_url() {
        let client = DeliveryClient::new(DeliveryConfig::default()).unwrap();
        assert!(!client.is_enabled());
        assert!(client.deliver(&event()).await.is_ok());
    }
}
