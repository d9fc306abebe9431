//! Event-push processing.
//!
//! An inbound event runs through the same pipeline as a synchronous call,
//! but its result becomes a reply event. `Ok(None)` means the event was
//! accepted and produced nothing to send, which is what happens while a
//! batch is still accumulating.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::batching::{Accumulated, Accumulators};
use super::cloudevents::DeliveryContext;
use super::delivery::OutboundEvent;
use super::derived::{drift_metrics, outlier_metrics};
use super::service::{GatewayService, ResponseTemplate};
use crate::codec::{self, Decoded, FeedbackEnvelope, WireEnvelope, feedback_extract};
use crate::config::EventMethod;
use crate::dispatch::{ModelResponse, ResponseData};
use crate::error::GatewayError;
use crate::metrics::{MetricRecord, SidecarBuilder};
use crate::telemetry::GatewayMetrics;

/// Identifiers stamped on reply events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyIdentity {
    pub source: String,
    pub event_type: String,
}

/// A reply ready to be acknowledged and delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct EventResult {
    pub reply_target: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl EventResult {
    pub fn to_outbound(&self) -> OutboundEvent {
        OutboundEvent {
            correlation_id: self
                .headers
                .get(super::cloudevents::CE_ID)
                .cloned()
                .unwrap_or_default(),
            target: self.reply_target.clone(),
            headers: self.headers.clone(),
            body: Bytes::from(serde_json::to_vec(&self.body).unwrap_or_default()),
        }
    }
}

pub struct EventProcessor {
    service: Arc<GatewayService>,
    method: EventMethod,
    accumulators: Option<Accumulators>,
    identity: ReplyIdentity,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl EventProcessor {
    /// `drift_batch_size` enables accumulation for predict events.
    pub fn new(
        service: Arc<GatewayService>,
        method: EventMethod,
        drift_batch_size: Option<usize>,
        identity: ReplyIdentity,
    ) -> Self {
        Self {
            service,
            method,
            accumulators: drift_batch_size.map(Accumulators::new),
            identity,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn method(&self) -> EventMethod {
        self.method
    }

    pub fn accumulators(&self) -> Option<&Accumulators> {
        self.accumulators.as_ref()
    }

    /// Processes one event body.
    #[tracing::instrument(skip_all, fields(correlation_id = %ctx.correlation_id, method = ?self.method))]
    pub fn process(&self, ctx: &DeliveryContext, body: &[u8]) -> Result<Option<EventResult>, GatewayError> {
        let reply = match self.method {
            EventMethod::Predict => self.predict(ctx, body)?,
            EventMethod::Score => Some(self.score(ctx, body)?),
            EventMethod::Feedback => Some(self.feedback(body)?),
        };
        Ok(reply.map(|body| EventResult {
            reply_target: ctx.reply_target.clone(),
            headers: ctx.reply_headers(&self.identity.source, &self.identity.event_type),
            body,
        }))
    }

    fn predict(&self, ctx: &DeliveryContext, body: &[u8]) -> Result<Option<Value>, GatewayError> {
        let request = WireEnvelope::from_slice(body)?;
        let mut input = codec::decode(&request)?;

        let batched = match &self.accumulators {
            Some(accumulators) => {
                let instance = ctx.instance(self.service.dispatcher().name());
                match accumulators.push(&instance, input.array)? {
                    Accumulated::Pending { rows } => {
                        if let Some(metrics) = &self.metrics {
                            metrics.record_deferred(&instance, rows);
                        }
                        debug!(instance = %instance, rows, "Event accumulated");
                        return Ok(None);
                    }
                    Accumulated::Ready(batch) => {
                        if let Some(metrics) = &self.metrics {
                            metrics.record_flush(&instance);
                        }
                        info!(instance = %instance, rows = batch.rows(), "Flushing batch");
                        input = Decoded {
                            array: batch,
                            names: input.names,
                        };
                        true
                    }
                }
            }
            None => false,
        };

        let response = self.service.dispatcher().invoke_predict(&input, &request.meta)?;
        let derived = if batched { derived_from(&response, drift_metrics) } else { Vec::new() };
        self.service
            .finish(
                "predict",
                &ResponseTemplate::of(&request).for_event(),
                SidecarBuilder::from_request(&request.meta),
                response,
                derived,
            )
            .map(Some)
    }

    fn score(&self, ctx: &DeliveryContext, body: &[u8]) -> Result<Value, GatewayError> {
        let request = WireEnvelope::from_slice(body)?;
        let input = codec::decode(&request)?;
        let response = self.service.dispatcher().invoke_score(&input, ctx.score_level())?;
        let derived = derived_from(&response, outlier_metrics);
        self.service.finish(
            "score",
            &ResponseTemplate::of(&request).for_event(),
            SidecarBuilder::from_request(&request.meta),
            response,
            derived,
        )
    }

    /// Feedback for metric computation: `truth` and `response` required,
    /// inbound metrics carried forward, reply data `{}`.
    fn feedback(&self, body: &[u8]) -> Result<Value, GatewayError> {
        let envelope = FeedbackEnvelope::from_slice(body)?;
        let parts = feedback_extract(&envelope)?;
        if parts.response.is_none() {
            return Err(GatewayError::missing("response"));
        }

        let (request, meta) = self.service.feedback_request(&envelope)?;
        let records = self.service.dispatcher().invoke_send_feedback(&request)?;
        let template = ResponseTemplate {
            kind: codec::PayloadKind::Json,
            request_id: None,
            event: true,
        };
        self.service.finish(
            "feedback",
            &template,
            SidecarBuilder::from_request(&meta).wire_metrics(&envelope.metrics),
            ModelResponse::from(json!({})),
            records,
        )
    }
}

fn derived_from(response: &ModelResponse, derive: fn(&Value) -> Vec<MetricRecord>) -> Vec<MetricRecord> {
    match &response.data {
        ResponseData::Json(value) => derive(value),
        ResponseData::Array(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::CanonicalArray;
    use crate::codec::Meta;
    use crate::config::Protocol;
    use crate::dispatch::{
        Component, ComponentResult, Dispatcher, FeedbackHandler, FeedbackRequest, Predictor, ScoreLevel,
        Scorer,
    };
    use crate::gateway::cloudevents::{CE_ID, CE_SOURCE, CE_TIME, INSTANCE_HEADER, RETURN_INSTANCE_SCORE_HEADER};
    use crate::gateway::service::ServiceSettings;
    use crate::metrics::MetricType;
    use crate::telemetry::CustomMetrics;

    /// Reports drift when the batch mean exceeds 1.
    struct Detector;

    impl Predictor for Detector {
        fn predict(&self, x: &CanonicalArray, _: &[String], _: &Meta) -> ComponentResult<ModelResponse> {
            let values = x.to_f64_vec();
            let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
            Ok(ModelResponse::from(json!({
                "data": {
                    "is_drift": i32::from(mean > 1.0),
                    "distance": [mean, mean / 2.0],
                    "p_val": [0.01, 0.2],
                    "threshold": [0.05, 0.05],
                    "rows": x.rows()
                }
            })))
        }
    }

    impl Scorer for Detector {
        fn score(&self, x: &CanonicalArray, _: &[String], level: ScoreLevel) -> ComponentResult<ModelResponse> {
            let scores: Vec<f64> = x.to_f64_vec();
            let mut data = json!({"is_outlier": scores.iter().map(|s| i32::from(*s > 1.0)).collect::<Vec<_>>()});
            if level.instance {
                data["instance_score"] = json!(scores);
            }
            Ok(ModelResponse::from(json!({ "data": data })))
        }
    }

    impl FeedbackHandler for Detector {
        fn send_feedback(&self, fb: &FeedbackRequest) -> ComponentResult<Vec<MetricRecord>> {
            let truth = fb.truth.as_ref().map(|t| t.to_f64_vec()).unwrap_or_default();
            let response = fb.response.as_ref().map(|r| r.to_f64_vec()).unwrap_or_default();
            let correct = truth.iter().zip(&response).filter(|(a, b)| a == b).count();
            Ok(vec![MetricRecord::counter("correct", correct as f64)])
        }
    }

    impl Component for Detector {
        fn name(&self) -> &str {
            "detector"
        }

        fn as_predictor(&self) -> Option<&dyn Predictor> {
            Some(self)
        }

        fn as_scorer(&self) -> Option<&dyn Scorer> {
            Some(self)
        }

        fn as_feedback_handler(&self) -> Option<&dyn FeedbackHandler> {
            Some(self)
        }
    }

    fn processor(method: EventMethod, batch: Option<usize>) -> EventProcessor {
        let service = GatewayService::new(
            Arc::new(Dispatcher::register(Arc::new(Detector))),
            ServiceSettings {
                unit_id: "detector".to_string(),
                image: None,
                include_metrics: true,
                protocol: Protocol::SeldonHttp,
                n_branches: None,
            },
            CustomMetrics::new(BTreeMap::new(), 50),
        );
        EventProcessor::new(
            Arc::new(service),
            method,
            batch,
            ReplyIdentity {
                source: "io.test.out".to_string(),
                event_type: "io.test.reply".to_string(),
            },
        )
    }

    fn ctx(pairs: &[(&str, &str)]) -> DeliveryContext {
        let headers = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DeliveryContext::from_headers(headers, None)
    }

    fn row(value: f64) -> Vec<u8> {
        serde_json::to_vec(&json!({"data": {"ndarray": [[value, value]]}})).unwrap()
    }

    fn metric_summary(body: &Value) -> Vec<(String, String)> {
        body["meta"]["metrics"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|m| (m["key"].as_str().unwrap().to_string(), m["type"].as_str().unwrap().to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_drift_batch_of_two() {
        let p = processor(EventMethod::Predict, Some(2));
        let c = ctx(&[(CE_ID, "evt-1"), (CE_SOURCE, "io.test.in")]);

        assert!(p.process(&c, &row(2.0)).unwrap().is_none());
        assert_eq!(p.accumulators().unwrap().buffered_rows("detector"), 1);

        let reply = p.process(&c, &row(3.0)).unwrap().expect("flush");
        assert_eq!(p.accumulators().unwrap().buffered_rows("detector"), 0);
        assert_eq!(reply.body["data"]["is_drift"], 1);
        assert_eq!(reply.body["data"]["rows"], 2);

        let metrics = metric_summary(&reply.body);
        assert_eq!(metrics.len(), 8);
        let drift_counters = metrics
            .iter()
            .filter(|(k, t)| k == "is_drift" && t == MetricType::Counter.as_str())
            .count();
        assert_eq!(drift_counters, 1);

        assert_eq!(reply.headers[CE_ID], "evt-1");
        assert_eq!(reply.headers[CE_SOURCE], "io.test.out");
        assert!(reply.headers.contains_key(CE_TIME));
    }

    #[test]
    fn test_batching_threshold() {
        let n = 5;
        let p = processor(EventMethod::Predict, Some(n));
        let c = ctx(&[(CE_ID, "e")]);
        for i in 1..n {
            assert!(p.process(&c, &row(0.0)).unwrap().is_none());
            assert_eq!(p.accumulators().unwrap().buffered_rows("detector"), i);
        }
        let reply = p.process(&c, &row(0.0)).unwrap().unwrap();
        assert_eq!(reply.body["data"]["is_drift"], 0);
        assert_eq!(p.accumulators().unwrap().buffered_rows("detector"), 0);
    }

    #[test]
    fn test_instances_accumulate_separately() {
        let p = processor(EventMethod::Predict, Some(2));
        let a = ctx(&[(INSTANCE_HEADER, "a")]);
        let b = ctx(&[(INSTANCE_HEADER, "b")]);
        assert!(p.process(&a, &row(1.0)).unwrap().is_none());
        assert!(p.process(&b, &row(1.0)).unwrap().is_none());
        assert!(p.process(&a, &row(1.0)).unwrap().is_some());
        assert_eq!(p.accumulators().unwrap().buffered_rows("b"), 1);
    }

    #[test]
    fn test_unbatched_predict_has_no_derived_metrics() {
        let p = processor(EventMethod::Predict, None);
        let reply = p.process(&ctx(&[]), &row(2.0)).unwrap().unwrap();
        assert_eq!(reply.body["data"]["is_drift"], 1);
        assert!(metric_summary(&reply.body).is_empty());
        assert!(!reply.headers[CE_ID].is_empty());
    }

    #[test]
    fn test_score_uses_header_level() {
        let p = processor(EventMethod::Score, None);
        let body = serde_json::to_vec(&json!({"data": {"ndarray": [0.5, 2.0, 3.0]}})).unwrap();

        let plain = p.process(&ctx(&[]), &body).unwrap().unwrap();
        assert!(plain.body["data"].get("instance_score").is_none());
        assert_eq!(metric_summary(&plain.body), vec![("is_outlier".to_string(), "COUNTER".to_string())]);
        assert_eq!(plain.body["meta"]["metrics"][0]["value"], 2.0);

        let scored = p
            .process(&ctx(&[(RETURN_INSTANCE_SCORE_HEADER, "true")]), &body)
            .unwrap()
            .unwrap();
        assert_eq!(metric_summary(&scored.body).len(), 4);
    }

    #[test]
    fn test_feedback_event() {
        let p = processor(EventMethod::Feedback, None);
        let body = serde_json::to_vec(&json!({
            "response": {"data": {"ndarray": [1, 0, 1]}},
            "truth": {"data": {"ndarray": [1, 1, 1]}},
            "metrics": [{"key": "latency", "type": "GAUGE", "value": 3}]
        }))
        .unwrap();
        let reply = p.process(&ctx(&[]), &body).unwrap().unwrap();
        assert_eq!(reply.body["data"], json!({}));
        let keys: Vec<String> = metric_summary(&reply.body).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["latency", "correct"]);
        assert_eq!(reply.body["meta"]["metrics"][1]["value"], 2.0);
    }

    #[test]
    fn test_feedback_event_requires_truth_and_response() {
        let p = processor(EventMethod::Feedback, None);
        let no_truth = serde_json::to_vec(&json!({"response": {"data": {"ndarray": [1]}}})).unwrap();
        assert_eq!(
            p.process(&ctx(&[]), &no_truth).unwrap_err(),
            GatewayError::missing("truth")
        );
        let no_response = serde_json::to_vec(&json!({"truth": {"data": {"ndarray": [1]}}})).unwrap();
        assert_eq!(
            p.process(&ctx(&[]), &no_response).unwrap_err(),
            GatewayError::missing("response")
        );
    }

    #[test]
    fn test_outbound_carries_headers() {
        let p = processor(EventMethod::Predict, None);
        let reply = p.process(&ctx(&[(CE_ID, "abc")]), &row(0.0)).unwrap().unwrap();
        let outbound = reply.to_outbound();
        assert_eq!(outbound.correlation_id, "abc");
        assert!(outbound.target.is_none());
        let body: Value = serde_json::from_slice(&outbound.body).unwrap();
        assert_eq!(body, reply.body);
    }

    #[test]
    fn test_outbound_targets_event_reply_target() {
        let p = processor(EventMethod::Predict, None);
        let headers = BTreeMap::from([(CE_ID.to_string(), "t1".to_string())]);
        let ctx = DeliveryContext::from_headers(headers, Some("http://sink/replies".to_string()));
        let reply = p.process(&ctx, &row(1.0)).unwrap().unwrap();
        assert_eq!(reply.reply_target.as_deref(), Some("http://sink/replies"));
        assert_eq!(reply.to_outbound().target.as_deref(), Some("http://sink/replies"));
    }
}
