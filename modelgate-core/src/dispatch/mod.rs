//! Capability dispatch.
//!
//! The [`Dispatcher`] owns one registered component, knows which verbs it
//! supports, and is the only place user code is called. Failures and
//! panics inside user code become [`GatewayError::ComponentError`] so no
//! request can take the process down.

pub mod capabilities;
pub mod component;
pub mod metadata;

pub use capabilities::Capabilities;
pub use component::{
    Combiner, Component, ComponentFailure, ComponentResult, FeedbackHandler, FeedbackRequest,
    InputTransformer, Loader, MetadataSource, MetricsSource, ModelResponse, OutputTransformer,
    Predictor, ResponseData, Router, ScoreLevel, Scorer, TagsSource,
};
pub use metadata::{ModelMetadata, TensorSpec, split_image_tag};

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::array::CanonicalArray;
use crate::codec::{Decoded, Meta};
use crate::error::GatewayError;
use crate::metrics::MetricRecord;

/// Direction of a transform call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

pub struct Dispatcher {
    component: Arc<dyn Component>,
    capabilities: Capabilities,
    loaded: AtomicBool,
    load_lock: Mutex<()>,
}

/// Synthetic `t:i` column labels for arrays of rank > 1.
pub fn synthetic_names(array: &CanonicalArray) -> Vec<String> {
    if array.ndim() > 1 {
        (0..array.columns()).map(|i| format!("t:{i}")).collect()
    } else {
        Vec::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Dispatcher {
    /// Registers a component and probes its capabilities once.
    pub fn register(component: Arc<dyn Component>) -> Self {
        let capabilities = Capabilities::discover(component.as_ref());
        info!(
            component = component.name(),
            capabilities = %capabilities,
            "Registered component"
        );
        Self {
            loaded: AtomicBool::new(!capabilities.contains(Capabilities::LOAD)),
            component,
            capabilities,
            load_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        self.component.name()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn is_ready(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Runs the component's loader once. Later calls are no-ops.
    pub fn load(&self) -> Result<(), GatewayError> {
        let _guard = self.load_lock.lock();
        if self.is_ready() {
            return Ok(());
        }
        if let Some(loader) = self.optional(Capabilities::LOAD, |c| c.as_loader()) {
            self.guarded("load", || loader.load())?;
        }
        self.loaded.store(true, Ordering::Release);
        info!(component = self.name(), "Component loaded");
        Ok(())
    }

    /// Accessor for a verb the component registered with. Verbs outside
    /// the registered set are rejected without calling the component.
    fn capability<'a, T: ?Sized + 'a>(
        &'a self,
        cap: Capabilities,
        name: &'static str,
        get: impl FnOnce(&'a dyn Component) -> Option<&'a T>,
    ) -> Result<&'a T, GatewayError> {
        self.optional(cap, get)
            .ok_or(GatewayError::CapabilityNotImplemented { capability: name })
    }

    fn optional<'a, T: ?Sized + 'a>(
        &'a self,
        cap: Capabilities,
        get: impl FnOnce(&'a dyn Component) -> Option<&'a T>,
    ) -> Option<&'a T> {
        if self.capabilities.contains(cap) {
            get(self.component.as_ref())
        } else {
            None
        }
    }

    fn ensure_ready(&self) -> Result<(), GatewayError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(GatewayError::ComponentNotReady {
                component: self.name().to_string(),
            })
        }
    }

    /// Calls user code, converting failures and panics.
    fn guarded<T>(
        &self,
        verb: &'static str,
        f: impl FnOnce() -> Result<T, ComponentFailure>,
    ) -> Result<T, GatewayError> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => {
                warn!(component = self.name(), verb, error = %failure, "Component call failed");
                Err(GatewayError::ComponentError {
                    code: failure.code,
                    message: failure.message,
                })
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(component = self.name(), verb, panic = %message, "Component panicked");
                Err(GatewayError::ComponentError {
                    code: None,
                    message: format!("component panicked during {verb}: {message}"),
                })
            }
        }
    }

    #[tracing::instrument(skip_all, fields(component = self.name(), rows = input.array.rows()))]
    pub fn invoke_predict(&self, input: &Decoded, meta: &Meta) -> Result<ModelResponse, GatewayError> {
        self.ensure_ready()?;
        let predictor = self.capability(Capabilities::PREDICT, "predict", |c| c.as_predictor())?;

        self.guarded("predict", || {
            let mut response = predictor.predict(&input.array, &input.names, meta)?;
            if response.names.is_empty() {
                let names = response
                    .array()
                    .map(|array| predictor.class_names().unwrap_or_else(|| synthetic_names(array)));
                if let Some(names) = names {
                    response.names = names;
                }
            }
            Ok(response)
        })
    }

    /// Returns a branch index in `[0, n_branches)`.
    #[tracing::instrument(skip_all, fields(component = self.name(), n_branches = n_branches))]
    pub fn invoke_route(&self, input: &Decoded, n_branches: usize) -> Result<usize, GatewayError> {
        self.ensure_ready()?;
        let router = self.capability(Capabilities::ROUTE, "route", |c| c.as_router())?;

        let branch = self.guarded("route", || router.route(&input.array, &input.names))?;
        match usize::try_from(branch) {
            Ok(b) if b < n_branches => {
                debug!(branch = b, "Routed request");
                Ok(b)
            }
            _ => Err(GatewayError::RoutingContractViolation { branch, n_branches }),
        }
    }

    /// Transforms the input or output. A component without the matching
    /// transformer passes data through unchanged.
    pub fn invoke_transform(
        &self,
        direction: Direction,
        input: &Decoded,
        meta: &Meta,
    ) -> Result<ModelResponse, GatewayError> {
        self.ensure_ready()?;
        let result = match direction {
            Direction::Input => {
                match self.optional(Capabilities::TRANSFORM_INPUT, |c| c.as_input_transformer()) {
                    Some(t) => Some(self.guarded("transform_input", || {
                        t.transform_input(&input.array, &input.names, meta)
                    })?),
                    None => None,
                }
            }
            Direction::Output => {
                match self.optional(Capabilities::TRANSFORM_OUTPUT, |c| c.as_output_transformer()) {
                    Some(t) => Some(self.guarded("transform_output", || {
                        t.transform_output(&input.array, &input.names, meta)
                    })?),
                    None => None,
                }
            }
        };

        let Some(mut response) = result else {
            return Ok(ModelResponse::from(input.array.clone()).with_names(input.names.clone()));
        };
        let keeps_columns = response
            .array()
            .is_some_and(|array| array.columns() == input.names.len());
        if response.names.is_empty() && keeps_columns {
            response.names = input.names.clone();
        }
        Ok(response)
    }

    pub fn invoke_aggregate(&self, inputs: &[Decoded]) -> Result<ModelResponse, GatewayError> {
        self.ensure_ready()?;
        let combiner = self.capability(Capabilities::AGGREGATE, "aggregate", |c| c.as_combiner())?;
        if inputs.is_empty() {
            return Err(GatewayError::malformed("aggregate requires at least one input"));
        }

        let arrays: Vec<CanonicalArray> = inputs.iter().map(|d| d.array.clone()).collect();
        let names: Vec<Vec<String>> = inputs.iter().map(|d| d.names.clone()).collect();
        let mut response = self.guarded("aggregate", || combiner.aggregate(&arrays, &names))?;
        if response.names.is_empty() {
            response.names = response.array().map(synthetic_names).unwrap_or_default();
        }
        Ok(response)
    }

    pub fn invoke_score(&self, input: &Decoded, level: ScoreLevel) -> Result<ModelResponse, GatewayError> {
        self.ensure_ready()?;
        let scorer = self.capability(Capabilities::SCORE, "score", |c| c.as_scorer())?;
        self.guarded("score", || scorer.score(&input.array, &input.names, level))
    }

    #[tracing::instrument(skip_all, fields(component = self.name(), reward = feedback.reward))]
    pub fn invoke_send_feedback(&self, feedback: &FeedbackRequest) -> Result<Vec<MetricRecord>, GatewayError> {
        self.ensure_ready()?;
        let handler = self.capability(Capabilities::SEND_FEEDBACK, "send_feedback", |c| {
            c.as_feedback_handler()
        })?;
        self.guarded("send_feedback", || handler.send_feedback(feedback))
    }

    /// Records from the component's `metrics()` hook, if any.
    pub fn collect_metrics(&self) -> Result<Vec<MetricRecord>, GatewayError> {
        match self.optional(Capabilities::METRICS, |c| c.as_metrics_source()) {
            Some(source) => self.guarded("metrics", || Ok(source.metrics())),
            None => Ok(Vec::new()),
        }
    }

    /// Tags from the component's `tags()` hook. Failures yield no tags.
    pub fn collect_tags(&self) -> BTreeMap<String, String> {
        match self.optional(Capabilities::TAGS, |c| c.as_tags_source()) {
            Some(source) => self.guarded("tags", || Ok(source.tags())).unwrap_or_default(),
            None => BTreeMap::new(),
        }
    }

    /// Metadata merged over defaults derived from `image`.
    pub fn metadata(&self, image: Option<&str>) -> Result<ModelMetadata, GatewayError> {
        let defaults = ModelMetadata::defaults(self.name(), image);
        match self.optional(Capabilities::INIT_METADATA, |c| c.as_metadata_source()) {
            Some(source) => {
                let supplied = self.guarded("init_metadata", || source.init_metadata())?;
                ModelMetadata::merge(&defaults, supplied)
            }
            None => Ok(defaults),
        }
    }
}
