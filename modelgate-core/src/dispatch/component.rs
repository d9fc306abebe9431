//! Capability contracts a user component can implement.
//!
//! A component implements [`Component`] and returns `Some(self)` from the
//! `as_*` accessor of every capability it supports. The dispatcher
//! discovers capabilities once at registration.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::array::CanonicalArray;
use crate::codec::Meta;
use crate::metrics::MetricRecord;

/// Error returned by user code. `code`, when set, is surfaced to the
/// caller in the failure envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentFailure {
    pub code: Option<i32>,
    pub message: String,
}

impl ComponentFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

impl fmt::Display for ComponentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ComponentFailure {}

pub type ComponentResult<T> = Result<T, ComponentFailure>;

/// Output of a component call.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseData {
    Array(CanonicalArray),
    Json(Value),
}

/// Data plus optional runtime metrics and tags.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub data: ResponseData,
    /// Column labels; filled by the dispatcher when left empty.
    pub names: Vec<String>,
    pub metrics: Vec<MetricRecord>,
    pub tags: BTreeMap<String, String>,
}

impl ModelResponse {
    pub fn new(data: ResponseData) -> Self {
        Self {
            data,
            names: Vec::new(),
            metrics: Vec::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_names(mut self, names: Vec<String>) -> Self {
        self.names = names;
        self
    }

    pub fn with_metric(mut self, record: MetricRecord) -> Self {
        self.metrics.push(record);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn array(&self) -> Option<&CanonicalArray> {
        match &self.data {
            ResponseData::Array(a) => Some(a),
            ResponseData::Json(_) => None,
        }
    }
}

impl From<CanonicalArray> for ModelResponse {
    fn from(array: CanonicalArray) -> Self {
        Self::new(ResponseData::Array(array))
    }
}

impl From<Value> for ModelResponse {
    fn from(value: Value) -> Self {
        Self::new(ResponseData::Json(value))
    }
}

/// Which outlier scores a scorer should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScoreLevel {
    pub instance: bool,
    pub feature: bool,
}

/// Decoded feedback handed to a [`FeedbackHandler`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackRequest {
    pub features: CanonicalArray,
    pub names: Vec<String>,
    pub response: Option<CanonicalArray>,
    pub truth: Option<CanonicalArray>,
    pub reward: f64,
    /// Branch this unit picked for the original request, if it routed.
    pub routing: Option<i64>,
}

pub trait Loader: Send + Sync {
    fn load(&self) -> ComponentResult<()>;
}

pub trait Predictor: Send + Sync {
    fn predict(&self, features: &CanonicalArray, names: &[String], meta: &Meta) -> ComponentResult<ModelResponse>;

    /// Labels for the last axis of predictions.
    fn class_names(&self) -> Option<Vec<String>> {
        None
    }
}

pub trait Router: Send + Sync {
    fn route(&self, features: &CanonicalArray, names: &[String]) -> ComponentResult<i64>;
}

pub trait InputTransformer: Send + Sync {
    fn transform_input(&self, features: &CanonicalArray, names: &[String], meta: &Meta) -> ComponentResult<ModelResponse>;
}

pub trait OutputTransformer: Send + Sync {
    fn transform_output(&self, features: &CanonicalArray, names: &[String], meta: &Meta) -> ComponentResult<ModelResponse>;
}

pub trait Combiner: Send + Sync {
    fn aggregate(&self, inputs: &[CanonicalArray], names: &[Vec<String>]) -> ComponentResult<ModelResponse>;
}

pub trait Scorer: Send + Sync {
    fn score(&self, features: &CanonicalArray, names: &[String], level: ScoreLevel) -> ComponentResult<ModelResponse>;
}

pub trait FeedbackHandler: Send + Sync {
    fn send_feedback(&self, feedback: &FeedbackRequest) -> ComponentResult<Vec<MetricRecord>>;
}

pub trait MetricsSource: Send + Sync {
    fn metrics(&self) -> Vec<MetricRecord>;
}

pub trait TagsSource: Send + Sync {
    fn tags(&self) -> BTreeMap<String, String>;
}

pub trait MetadataSource: Send + Sync {
    /// Partial or complete metadata object; merged over defaults.
    fn init_metadata(&self) -> ComponentResult<Value>;
}

/// A user-supplied component.
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    fn as_loader(&self) -> Option<&dyn Loader> {
        None
    }

    fn as_predictor(&self) -> Option<&dyn Predictor> {
        None
    }

    fn as_router(&self) -> Option<&dyn Router> {
        None
    }

    fn as_input_transformer(&self) -> Option<&dyn InputTransformer> {
        None
    }

    fn as_output_transformer(&self) -> Option<&dyn OutputTransformer> {
        None
    }

    fn as_combiner(&self) -> Option<&dyn Combiner> {
        None
    }

    fn as_scorer(&self) -> Option<&dyn Scorer> {
        None
    }

    fn as_feedback_handler(&self) -> Option<&dyn FeedbackHandler> {
        None
    }

    fn as_metrics_source(&self) -> Option<&dyn MetricsSource> {
        None
    }

    fn as_tags_source(&self) -> Option<&dyn TagsSource> {
        None
    }

    fn as_metadata_source(&self) -> Option<&dyn MetadataSource> {
        None
    }
}
