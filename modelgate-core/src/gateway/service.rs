//! Synchronous request pipeline: decode, dispatch, encode.
//!
//! Every verb ends in [`GatewayService::finish`], which merges request
//! meta, component tags and metrics into the sidecar, exports the records
//! and renders the payload in the caller's dialect.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::derived::detector_payload;
use crate::array::CanonicalArray;
use crate::codec::{
    self, Decoded, FeedbackEnvelope, Meta, PayloadKind, WireEnvelope, WirePayload, columnar,
};
use crate::config::{GatewayConfig, Protocol};
use crate::dispatch::{
    Capabilities, Direction, Dispatcher, FeedbackRequest, ModelResponse, ResponseData, ScoreLevel,
};
use crate::error::GatewayError;
use crate::metrics::{MetricRecord, SidecarBuilder};
use crate::telemetry::{CustomMetrics, GatewayMetrics};

/// Per-deployment settings the pipeline needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    pub unit_id: String,
    pub image: Option<String>,
    pub include_metrics: bool,
    pub protocol: Protocol,
    /// Branch count routers are checked against. Routing is refused when
    /// unset.
    pub n_branches: Option<usize>,
}

impl ServiceSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            unit_id: config.unit_id().to_string(),
            image: config.unit.image.clone().filter(|i| !i.is_empty()),
            include_metrics: config.metrics.include_in_response,
            protocol: config.protocol,
            n_branches: config.component.bandit.as_ref().map(|b| b.n_branches),
        }
    }
}

/// How a response body is laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseTemplate {
    pub kind: PayloadKind,
    /// V2 request id, echoed in the response.
    pub request_id: Option<String>,
    /// JSON outputs go under `data`, unwrapped from a `{"data": ...}`
    /// detector result, instead of `jsonData`.
    pub event: bool,
}

impl ResponseTemplate {
    pub fn of(envelope: &WireEnvelope) -> Self {
        let request_id = match &envelope.payload {
            WirePayload::V2(v2) => v2.id.clone(),
            _ => None,
        };
        Self {
            kind: envelope.kind(),
            request_id,
            event: false,
        }
    }

    pub fn for_event(mut self) -> Self {
        self.event = true;
        self
    }
}

/// Parses an aggregate body: `{"seldonMessages": [...]}` or a bare list.
pub fn parse_message_list(value: Value) -> Result<Vec<WireEnvelope>, GatewayError> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("seldonMessages") {
            Some(Value::Array(items)) => items,
            Some(_) => return Err(GatewayError::malformed("'seldonMessages' is not a list")),
            None => return Err(GatewayError::missing("seldonMessages")),
        },
        _ => return Err(GatewayError::malformed("aggregate body is not a list of messages")),
    };
    items.into_iter().map(WireEnvelope::from_value).collect()
}

pub struct GatewayService {
    dispatcher: Arc<Dispatcher>,
    settings: ServiceSettings,
    custom: CustomMetrics,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl GatewayService {
    pub fn new(dispatcher: Arc<Dispatcher>, settings: ServiceSettings, custom: CustomMetrics) -> Self {
        if settings.n_branches.is_none() && dispatcher.capabilities().contains(Capabilities::ROUTE) {
            warn!(
                component = dispatcher.name(),
                "Router has no configured branch count, route requests will be refused"
            );
        }
        Self {
            dispatcher,
            settings,
            custom,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn protocol(&self) -> Protocol {
        self.settings.protocol
    }

    // ─────────────────────────────────────────────────────────────────────
    // Verbs
    // ─────────────────────────────────────────────────────────────────────

    pub fn predict(&self, request: &WireEnvelope) -> Result<Value, GatewayError> {
        let input = codec::decode(request)?;
        let response = self.dispatcher.invoke_predict(&input, &request.meta)?;
        self.finish(
            "predict",
            &ResponseTemplate::of(request),
            SidecarBuilder::from_request(&request.meta),
            response,
            Vec::new(),
        )
    }

    /// Routes and answers `[[branch]]`, recording the branch under this
    /// unit in `meta.routing`.
    pub fn route(&self, request: &WireEnvelope) -> Result<Value, GatewayError> {
        let input = codec::decode(request)?;
        let n_branches = match self.settings.n_branches {
            Some(n) => n,
            None if self.dispatcher.capabilities().contains(Capabilities::ROUTE) => {
                return Err(GatewayError::InternalError {
                    details: format!(
                        "no branch count is configured for router '{}'",
                        self.dispatcher.name()
                    ),
                });
            }
            // Lets the dispatcher report the missing capability.
            None => 0,
        };
        let branch = self.dispatcher.invoke_route(&input, n_branches)? as i64;
        let array = CanonicalArray::from_shape_vec(&[1, 1], vec![branch])?;
        let builder = SidecarBuilder::from_request(&request.meta).routing(&self.settings.unit_id, branch);
        self.finish(
            "route",
            &ResponseTemplate::of(request),
            builder,
            ModelResponse::from(array),
            Vec::new(),
        )
    }

    pub fn transform(&self, direction: Direction, request: &WireEnvelope) -> Result<Value, GatewayError> {
        let input = codec::decode(request)?;
        let response = self.dispatcher.invoke_transform(direction, &input, &request.meta)?;
        let method = match direction {
            Direction::Input => "transform_input",
            Direction::Output => "transform_output",
        };
        self.finish(
            method,
            &ResponseTemplate::of(request),
            SidecarBuilder::from_request(&request.meta),
            response,
            Vec::new(),
        )
    }

    /// Combines several messages. The response uses the first message's
    /// dialect and merges all request metas.
    pub fn aggregate(&self, requests: &[WireEnvelope]) -> Result<Value, GatewayError> {
        let first = requests
            .first()
            .ok_or_else(|| GatewayError::malformed("aggregate requires at least one message"))?;
        let inputs = requests
            .iter()
            .map(codec::decode)
            .collect::<Result<Vec<Decoded>, _>>()?;
        let response = self.dispatcher.invoke_aggregate(&inputs)?;
        self.finish(
            "aggregate",
            &ResponseTemplate::of(first),
            SidecarBuilder::from_requests(requests.iter().map(|r| &r.meta)),
            response,
            Vec::new(),
        )
    }

    pub fn score(&self, request: &WireEnvelope, level: ScoreLevel) -> Result<Value, GatewayError> {
        let input = codec::decode(request)?;
        let response = self.dispatcher.invoke_score(&input, level)?;
        self.finish(
            "score",
            &ResponseTemplate::of(request),
            SidecarBuilder::from_request(&request.meta),
            response,
            Vec::new(),
        )
    }

    /// Hands feedback to the component. The reply carries only `meta`.
    pub fn send_feedback(&self, feedback: &FeedbackEnvelope) -> Result<Value, GatewayError> {
        let (request, meta) = self.feedback_request(feedback)?;
        let records = self.dispatcher.invoke_send_feedback(&request)?;
        let meta = self.sidecar(
            "send_feedback",
            SidecarBuilder::from_request(&meta).wire_metrics(&feedback.metrics),
            Vec::new(),
            records,
        );
        Ok(json!({ "meta": meta }))
    }

    /// Builds the component-facing feedback request and the meta to reply
    /// with. Routing is looked up under this unit's id.
    pub fn feedback_request(&self, feedback: &FeedbackEnvelope) -> Result<(FeedbackRequest, Meta), GatewayError> {
        let parts = feedback.decode_parts()?;
        let routing = parts.response_meta.routing.get(&self.settings.unit_id).copied();
        let (features, names) = match parts.request {
            Some(d) => (d.array, d.names),
            None => (CanonicalArray::empty(), Vec::new()),
        };
        let meta = feedback
            .request
            .as_ref()
            .map(|r| r.meta.clone())
            .unwrap_or_default();
        let request = FeedbackRequest {
            features,
            names,
            response: parts.response.map(|d| d.array),
            truth: parts.truth.map(|d| d.array),
            reward: parts.reward,
            routing,
        };
        Ok((request, meta))
    }

    pub fn metadata(&self) -> Result<Value, GatewayError> {
        Ok(self.dispatcher.metadata(self.settings.image.as_deref())?.to_value())
    }

    /// Columnar surface: a data frame in, a data or status frame out.
    pub fn predict_frame(&self, frame: &[u8]) -> Bytes {
        match self.predict_columnar(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "Columnar request failed");
                columnar::encode_error(&e)
            }
        }
    }

    fn predict_columnar(&self, frame: &[u8]) -> Result<Bytes, GatewayError> {
        let (array, names) = columnar::decode_data(frame)?;
        let input = Decoded { array, names };
        let response = self.dispatcher.invoke_predict(&input, &Meta::default())?;
        let meta = self.sidecar(
            "predict",
            SidecarBuilder::from_request(&Meta::default()),
            response.tags.clone().into_iter().collect(),
            response.metrics.clone(),
        );
        debug!(puid = %meta.puid, "Columnar prediction");
        match &response.data {
            ResponseData::Array(out) => columnar::encode_data(out, &response.names),
            ResponseData::Json(_) => Err(GatewayError::InternalError {
                details: "component returned JSON, which columnar frames cannot carry".to_string(),
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Response assembly
    // ─────────────────────────────────────────────────────────────────────

    /// Merges the sidecar and renders the response body.
    ///
    /// `extra` are records produced by the gateway itself, appended after
    /// the component's.
    pub fn finish(
        &self,
        method: &'static str,
        template: &ResponseTemplate,
        builder: SidecarBuilder,
        response: ModelResponse,
        extra: Vec<MetricRecord>,
    ) -> Result<Value, GatewayError> {
        let ModelResponse {
            data,
            names,
            mut metrics,
            tags,
        } = response;
        metrics.extend(extra);
        let meta = self.sidecar(method, builder, tags.into_iter().collect(), metrics);
        self.render(template, data, &names, meta)
    }

    fn sidecar(
        &self,
        method: &'static str,
        builder: SidecarBuilder,
        runtime_tags: Vec<(String, String)>,
        runtime_metrics: Vec<MetricRecord>,
    ) -> Meta {
        let mut builder = builder.tags(self.dispatcher.collect_tags());
        builder = builder.tags(runtime_tags.into_iter().collect());
        builder = match self.dispatcher.collect_metrics() {
            Ok(records) => builder.metrics(records),
            Err(e) => builder.rejected(GatewayError::InvalidMetricRecord {
                details: e.to_string(),
            }),
        };
        builder = builder.metrics(runtime_metrics);
        if let Some(image) = &self.settings.image {
            builder = builder.request_path(&self.settings.unit_id, image);
        }

        let sidecar = builder.build(self.settings.include_metrics);
        if sidecar.rejected.is_some() {
            if let Some(metrics) = &self.metrics {
                metrics.record_rejected_metrics(method);
            }
        }
        self.custom.record_all(&sidecar.exported, method);
        sidecar.meta
    }

    fn render(
        &self,
        template: &ResponseTemplate,
        data: ResponseData,
        names: &[String],
        meta: Meta,
    ) -> Result<Value, GatewayError> {
        let array = match data {
            ResponseData::Array(array) => array,
            ResponseData::Json(value) => {
                let mut out = Map::new();
                if template.event {
                    out.insert("data".to_string(), detector_payload(&value).clone());
                } else {
                    out.insert("jsonData".to_string(), value);
                }
                if !meta.is_empty() {
                    out.insert("meta".to_string(), serde_json::to_value(&meta).unwrap_or(Value::Null));
                }
                return Ok(Value::Object(out));
            }
        };

        let mut envelope = codec::encode(&array, names, template.kind)?;
        if let WirePayload::V2(v2) = &mut envelope.payload {
            v2.model_name = Some(self.settings.unit_id.clone());
            v2.id = template.request_id.clone().or_else(|| Some(meta.puid.clone()));
        }
        envelope.meta = meta;
        Ok(envelope.to_value())
    }
}
