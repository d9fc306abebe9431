//! Configuration schema type definitions.
//!
//! # Example
//! ```yaml
//! component:
//!   name: router
//!   kind: epsilon_greedy
//!   bandit:
//!     n_branches: 3
//!     epsilon: 0.1
//!
//! protocol: seldon_http
//!
//! unit:
//!   id: router
//!   image: registry.local/router:0.3
//!
//! events:
//!   source: io.modelgate.detector
//!   type: io.modelgate.drift
//!   drift_batch_size: 20
//!
//! delivery:
//!   reply_url: ${REPLY_URL:-}
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gateway::delivery::DeliveryConfig;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-Level Schema
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Root configuration structure. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub component: ComponentConfig,
    pub protocol: Protocol,
    pub unit: UnitConfig,
    pub events: EventsConfig,
    pub delivery: DeliverySection,
    pub metrics: MetricsConfig,
    pub limits: LimitsConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Component
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Built-in component implementations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    #[default]
    Identity,
    EpsilonGreedy,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComponentConfig {
    pub name: String,
    pub kind: ComponentKind,
    /// Artifact location resolved before load (`file://` or a local path).
    pub storage_uri: Option<String>,
    /// Required for `epsilon_greedy`.
    pub bandit: Option<BanditConfig>,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            name: "identity".to_string(),
            kind: ComponentKind::Identity,
            storage_uri: None,
            bandit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BanditConfig {
    pub n_branches: usize,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Fixed RNG seed for reproducible exploration.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Branch picked until feedback has been received.
    #[serde(default)]
    pub best_branch: usize,
}

fn default_epsilon() -> f64 {
    0.1
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Protocol
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wire protocol served on `/` and reported by `GET /protocol`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    SeldonHttp,
    SeldonfeedbackHttp,
    KfservingHttp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SeldonHttp => "seldon_http",
            Self::SeldonfeedbackHttp => "seldonfeedback_http",
            Self::KfservingHttp => "kfserving_http",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seldon_http" => Ok(Self::SeldonHttp),
            "seldonfeedback_http" => Ok(Self::SeldonfeedbackHttp),
            "kfserving_http" => Ok(Self::KfservingHttp),
            other => Err(format!(
                "unknown protocol '{other}': expected seldon_http, seldonfeedback_http or kfserving_http"
            )),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Unit identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
/// Where this gateway sits in a deployment graph. Used for routing and
/// request-path meta, metadata defaults and metric labels.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UnitConfig {
    pub id: Option<String>,
    /// `repo:tag` of the serving image.
    pub image: Option<String>,
    pub deployment: Option<String>,
    pub predictor: Option<String>,
    pub namespace: Option<String>,
}

impl UnitConfig {
    /// Unit id, falling back to the component name.
    pub fn id_or<'a>(&'a self, component: &'a str) -> &'a str {
        self.id.as_deref().unwrap_or(component)
    }

    /// Default labels attached to exported component metrics.
    pub fn metric_labels(&self) -> BTreeMap<String, String> {
        let (model, version) = self
            .image
            .as_deref()
            .map(crate::dispatch::split_image_tag)
            .unwrap_or_default();
        let or_na = |v: &Option<String>| v.clone().unwrap_or_else(|| "NOT_IMPLEMENTED".to_string());
        BTreeMap::from([
            ("deployment_name".to_string(), or_na(&self.deployment)),
            ("predictor_name".to_string(), or_na(&self.predictor)),
            ("model_name".to_string(), or_na(&self.id)),
            ("model_image".to_string(), if model.is_empty() { "NOT_IMPLEMENTED".into() } else { model }),
            ("model_version".to_string(), if version.is_empty() { "NOT_IMPLEMENTED".into() } else { version }),
            ("namespace".to_string(), or_na(&self.namespace)),
        ])
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What an inbound event does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventMethod {
    #[default]
    Predict,
    Score,
    Feedback,
}

impl EventMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Predict => "predict",
            Self::Score => "score",
            Self::Feedback => "feedback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventsConfig {
    /// `ce-source` stamped on replies.
    pub source: String,
    /// `ce-type` stamped on replies.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Overrides the method implied by the protocol.
    pub method: Option<EventMethod>,
    /// Rows to accumulate before a predict flush. `None` disables batching.
    pub drift_batch_size: Option<usize>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            source: "io.modelgate.gateway".to_string(),
            event_type: "io.modelgate.inference.response".to_string(),
            method: None,
            drift_batch_size: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delivery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeliverySection {
    pub reply_url: Option<String>,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for DeliverySection {
    fn default() -> Self {
        let d = DeliveryConfig::default();
        Self {
            reply_url: None,
            timeout_secs: d.timeout.as_secs(),
            connect_timeout_secs: d.connect_timeout.as_secs(),
            max_attempts: d.max_attempts,
            initial_backoff_ms: d.initial_backoff.as_millis() as u64,
            max_backoff_ms: d.max_backoff.as_millis() as u64,
        }
    }
}

impl DeliverySection {
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            reply_url: self.reply_url.clone().filter(|u| !u.is_empty()),
            timeout: Duration::from_secs(self.timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Metrics and limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// Copy metric records into the response `meta.metrics`.
    pub include_in_response: bool,
    /// Distinct component metric keys exported before overflow.
    pub max_custom_keys: usize,
    /// Extra labels added to every exported component metric.
    pub labels: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            include_in_response: true,
            max_custom_keys: 200,
            labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Largest REST request body accepted.
    pub max_body_bytes: usize,
    /// Largest RPC or columnar frame accepted or sent.
    pub max_message_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 16 * 1024 * 1024,
            max_message_bytes: 4 * 1024 * 1024,
        }
    }
}

impl GatewayConfig {
    /// Event method: explicit setting, else implied by the protocol.
    pub fn event_method(&self) -> EventMethod {
        self.events.method.unwrap_or(match self.protocol {
            Protocol::SeldonfeedbackHttp => EventMethod::Feedback,
            _ => EventMethod::Predict,
        })
    }

    pub fn unit_id(&self) -> &str {
        self.unit.id_or(&self.component.name)
    }

    /// Default metric labels plus configured extras.
    pub fn metric_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.unit.metric_labels();
        labels.extend(self.metrics.labels.clone());
        labels
    }
}
