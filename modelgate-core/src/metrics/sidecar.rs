//! Assembly of the response `meta` sidecar.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use super::{MetricRecord, parse_metrics};
use crate::codec::Meta;
use crate::error::GatewayError;

/// Merges request meta with everything the component produced.
///
/// Metric validation fails closed: if any record is invalid the response
/// carries no metrics at all and nothing is exported, but the payload is
/// still returned.
#[derive(Debug, Default)]
pub struct SidecarBuilder {
    meta: Meta,
    forwarded: Vec<Value>,
    produced: Vec<MetricRecord>,
    rejected: Option<GatewayError>,
}

/// Result of [`SidecarBuilder::build`].
#[derive(Debug, Clone, PartialEq)]
pub struct Sidecar {
    pub meta: Meta,
    /// Records produced for this response, to be exported on scrape.
    pub exported: Vec<MetricRecord>,
    pub rejected: Option<GatewayError>,
}

impl SidecarBuilder {
    /// Starts from a request's meta. A missing puid is generated.
    pub fn from_request(meta: &Meta) -> Self {
        Self::from_requests(std::iter::once(meta))
    }

    /// Starts from several request metas, as for aggregation. Later tags
    /// win; metrics are concatenated in input order.
    pub fn from_requests<'a>(metas: impl IntoIterator<Item = &'a Meta>) -> Self {
        let mut merged = Meta::default();
        let mut forwarded = Vec::new();
        for meta in metas {
            if merged.puid.is_empty() {
                merged.puid = meta.puid.clone();
            }
            merged.tags.extend(meta.tags.clone());
            merged.routing.extend(meta.routing.clone());
            merged.request_path.extend(meta.request_path.clone());
            forwarded.extend(meta.metrics.iter().cloned());
        }
        if merged.puid.is_empty() {
            merged.puid = uuid::Uuid::new_v4().to_string();
        }
        Self {
            meta: merged,
            forwarded,
            ..Self::default()
        }
    }

    pub fn tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.meta.tags.extend(tags);
        self
    }

    pub fn routing(mut self, unit: &str, branch: i64) -> Self {
        self.meta.routing.insert(unit.to_string(), branch);
        self
    }

    pub fn request_path(mut self, unit: &str, image: &str) -> Self {
        self.meta
            .request_path
            .insert(unit.to_string(), image.to_string());
        self
    }

    pub fn metrics(mut self, records: impl IntoIterator<Item = MetricRecord>) -> Self {
        self.produced.extend(records);
        self
    }

    /// Adds records still in wire form; they are exported like
    /// component-produced records.
    pub fn wire_metrics(mut self, values: &[Value]) -> Self {
        match parse_metrics(values) {
            Ok(records) => self.produced.extend(records),
            Err(e) => self.reject(e),
        }
        self
    }

    /// Marks the metrics as unusable, e.g. when a source panicked.
    pub fn rejected(mut self, err: GatewayError) -> Self {
        self.reject(err);
        self
    }

    fn reject(&mut self, err: GatewayError) {
        if self.rejected.is_none() {
            self.rejected = Some(err);
        }
    }

    pub fn build(mut self, include_metrics: bool) -> Sidecar {
        if let Err(e) = parse_metrics(&self.forwarded) {
            self.reject(e);
        }
        if let Err(e) = self.produced.iter().try_for_each(MetricRecord::validate) {
            self.reject(e);
        }

        if let Some(err) = self.rejected {
            warn!(error = %err, "Dropping response metrics");
            return Sidecar {
                meta: self.meta,
                exported: Vec::new(),
                rejected: Some(err),
            };
        }

        let mut meta = self.meta;
        if include_metrics {
            meta.metrics = self.forwarded;
            meta.metrics
                .extend(self.produced.iter().map(MetricRecord::to_value));
        }
        Sidecar {
            meta,
            exported: self.produced,
            rejected: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_meta() -> Meta {
        serde_json::from_value(json!({
            "puid": "p1",
            "tags": {"a": "request", "shared": "request"},
            "metrics": [{"key": "upstream", "type": "COUNTER", "value": 1}]
        }))
        .unwrap()
    }

    #[test]
    fn test_merge_order() {
        let sidecar = SidecarBuilder::from_request(&request_meta())
            .tags(BTreeMap::from([("shared".to_string(), "component".to_string())]))
            .metrics([MetricRecord::gauge("component", 2.0)])
            .metrics([MetricRecord::counter("runtime", 3.0)])
            .build(true);

        assert!(sidecar.rejected.is_none());
        assert_eq!(sidecar.meta.puid, "p1");
        assert_eq!(sidecar.meta.tags["a"], "request");
        assert_eq!(sidecar.meta.tags["shared"], "component");

        let keys: Vec<&str> = sidecar
            .meta
            .metrics
            .iter()
            .filter_map(|m| m["key"].as_str())
            .collect();
        assert_eq!(keys, vec!["upstream", "component", "runtime"]);
        assert_eq!(sidecar.exported.len(), 2);
    }

    #[test]
    fn test_invalid_record_drops_all_metrics() {
        let sidecar = SidecarBuilder::from_request(&request_meta())
            .metrics([MetricRecord::gauge("fine", 1.0), MetricRecord::counter("bad", -1.0)])
            .build(true);

        assert!(matches!(
            sidecar.rejected,
            Some(GatewayError::InvalidMetricRecord { .. })
        ));
        assert!(sidecar.meta.metrics.is_empty());
        assert!(sidecar.exported.is_empty());
        assert_eq!(sidecar.meta.tags["a"], "request");
    }

    #[test]
    fn test_invalid_forwarded_record_drops_all_metrics() {
        let meta: Meta = serde_json::from_value(json!({
            "metrics": [{"key": "k", "type": "BAD", "value": 1}]
        }))
        .unwrap();
        let sidecar = SidecarBuilder::from_request(&meta)
            .metrics([MetricRecord::gauge("g", 1.0)])
            .build(true);
        assert!(sidecar.rejected.is_some());
        assert!(sidecar.meta.metrics.is_empty());
    }

    #[test]
    fn test_puid_generated_when_absent() {
        let sidecar = SidecarBuilder::from_request(&Meta::default()).build(true);
        assert_eq!(sidecar.meta.puid.len(), 36);
    }

    #[test]
    fn test_metrics_hidden_but_exported() {
        let sidecar = SidecarBuilder::from_request(&Meta::default())
            .metrics([MetricRecord::gauge("g", 1.0)])
            .build(false);
        assert!(sidecar.meta.metrics.is_empty());
        assert_eq!(sidecar.exported.len(), 1);
    }

    #[test]
    fn test_wire_metrics_are_exported() {
        let sidecar = SidecarBuilder::from_request(&Meta::default())
            .wire_metrics(&[json!({"key": "acc", "type": "GAUGE", "value": 0.5})])
            .build(true);
        assert_eq!(sidecar.exported[0].key, "acc");
    }

    #[test]
    fn test_aggregate_metas() {
        let a: Meta = serde_json::from_value(json!({"tags": {"x": "1"}, "routing": {"r": 0}})).unwrap();
        let b: Meta = serde_json::from_value(json!({"puid": "b", "tags": {"x": "2", "y": "3"}})).unwrap();
        let sidecar = SidecarBuilder::from_requests([&a, &b]).build(true);
        assert_eq!(sidecar.meta.puid, "b");
        assert_eq!(sidecar.meta.tags["x"], "2");
        assert_eq!(sidecar.meta.tags["y"], "3");
        assert_eq!(sidecar.meta.routing["r"], 0);
    }

    #[test]
    fn test_routing_and_path() {
        let sidecar = SidecarBuilder::from_request(&Meta::default())
            .routing("router", 1)
            .request_path("router", "repo/router:0.1")
            .build(true);
        assert_eq!(sidecar.meta.routing["router"], 1);
        assert_eq!(sidecar.meta.request_path["router"], "repo/router:0.1");
    }
}
