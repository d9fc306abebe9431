//! Metric records emitted by components.
//!
//! Records travel in a response's `meta.metrics` and are exported on the
//! scrape endpoint. A record is `{key, type, value, tags?, bins?}` where
//! `type` is one of `COUNTER`, `GAUGE`, `TIMER` (milliseconds) or
//! `HISTOGRAM`.

mod sidecar;

pub use sidecar::{Sidecar, SidecarBuilder};

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricType {
    Counter,
    Gauge,
    Timer,
    Histogram,
}

impl MetricType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "COUNTER" => Some(Self::Counter),
            "GAUGE" => Some(Self::Gauge),
            "TIMER" => Some(Self::Timer),
            "HISTOGRAM" => Some(Self::Histogram),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "COUNTER",
            Self::Gauge => "GAUGE",
            Self::Timer => "TIMER",
            Self::Histogram => "HISTOGRAM",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One typed metric observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    pub key: String,

    #[serde(rename = "type")]
    pub metric_type: MetricType,

    pub value: f64,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    /// Bucket bounds, only meaningful for histograms.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bins: Vec<f64>,
}

impl MetricRecord {
    pub fn new(key: impl Into<String>, metric_type: MetricType, value: f64) -> Self {
        Self {
            key: key.into(),
            metric_type,
            value,
            tags: BTreeMap::new(),
            bins: Vec::new(),
        }
    }

    pub fn counter(key: impl Into<String>, value: f64) -> Self {
        Self::new(key, MetricType::Counter, value)
    }

    pub fn gauge(key: impl Into<String>, value: f64) -> Self {
        Self::new(key, MetricType::Gauge, value)
    }

    /// `millis` is the observed duration in milliseconds.
    pub fn timer(key: impl Into<String>, millis: f64) -> Self {
        Self::new(key, MetricType::Timer, millis)
    }

    pub fn histogram(key: impl Into<String>, value: f64, bins: Vec<f64>) -> Self {
        Self {
            bins,
            ..Self::new(key, MetricType::Histogram, value)
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        let invalid = |details: String| GatewayError::InvalidMetricRecord { details };

        if self.key.is_empty() {
            return Err(invalid("metric key is empty".to_string()));
        }
        if !self.value.is_finite() {
            return Err(invalid(format!("metric '{}' has a non-finite value", self.key)));
        }
        if matches!(self.metric_type, MetricType::Counter | MetricType::Timer) && self.value < 0.0 {
            return Err(invalid(format!(
                "{} '{}' must not be negative",
                self.metric_type, self.key
            )));
        }
        if self.tags.keys().any(String::is_empty) {
            return Err(invalid(format!("metric '{}' has an empty tag name", self.key)));
        }

        match self.metric_type {
            MetricType::Histogram => {
                if self.bins.is_empty() {
                    return Err(invalid(format!("HISTOGRAM '{}' has no bins", self.key)));
                }
                let ascending = self.bins.iter().all(|b| b.is_finite())
                    && self.bins.windows(2).all(|w| w[0] < w[1]);
                if !ascending {
                    return Err(invalid(format!(
                        "HISTOGRAM '{}' bins are not sorted ascending",
                        self.key
                    )));
                }
            }
            _ if !self.bins.is_empty() => {
                return Err(invalid(format!(
                    "bins are only valid for HISTOGRAM, '{}' is {}",
                    self.key, self.metric_type
                )));
            }
            _ => {}
        }
        Ok(())
    }

    /// Parses and validates one wire record.
    pub fn from_value(value: &Value) -> Result<Self, GatewayError> {
        let invalid = |details: &str| GatewayError::InvalidMetricRecord {
            details: details.to_string(),
        };

        let object = value
            .as_object()
            .ok_or_else(|| invalid("metric record is not an object"))?;

        let key = match object.get("key") {
            Some(Value::String(k)) => k.clone(),
            Some(_) => return Err(invalid("metric key is not a string")),
            None => return Err(invalid("metric record has no key")),
        };
        let metric_type = match object.get("type") {
            Some(Value::String(t)) => MetricType::parse(t).ok_or_else(|| {
                GatewayError::InvalidMetricRecord {
                    details: format!("unknown metric type '{t}'"),
                }
            })?,
            _ => return Err(invalid("metric record has no type")),
        };
        let value = match object.get("value") {
            Some(Value::Number(n)) => n.as_f64().ok_or_else(|| invalid("metric value is not numeric"))?,
            Some(_) => return Err(invalid("metric value is not numeric")),
            None => return Err(invalid("metric record has no value")),
        };

        let mut tags = BTreeMap::new();
        match object.get("tags") {
            None | Some(Value::Null) => {}
            Some(Value::Object(map)) => {
                for (k, v) in map {
                    let text = match v {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        _ => return Err(invalid("metric tag values must be scalars")),
                    };
                    tags.insert(k.clone(), text);
                }
            }
            Some(_) => return Err(invalid("metric tags are not an object")),
        }

        let bins = match object.get("bins") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|b| b.as_f64().ok_or_else(|| invalid("histogram bins must be numeric")))
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err(invalid("histogram bins are not a list")),
        };

        let record = Self {
            key,
            metric_type,
            value,
            tags,
            bins,
        };
        record.validate()?;
        Ok(record)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Parses a list of wire records, failing on the first invalid one.
pub fn parse_metrics(values: &[Value]) -> Result<Vec<MetricRecord>, GatewayError> {
    values.iter().map(MetricRecord::from_value).collect()
}
