//! Request/response sidecar carried next to every payload.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The `meta` object of a wire envelope.
///
/// `metrics` holds the records in their wire form. They are validated
/// when a response sidecar is assembled, not when a request is parsed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub puid: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    /// Branch chosen by each router, keyed by unit id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routing: BTreeMap<String, i64>,

    /// Image of each unit the request passed through.
    #[serde(
        default,
        rename = "requestPath",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub request_path: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<Value>,
}

impl Meta {
    pub fn is_empty(&self) -> bool {
        self.puid.is_empty()
            && self.tags.is_empty()
            && self.routing.is_empty()
            && self.request_path.is_empty()
            && self.metrics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_meta_serializes_to_empty_object() {
        assert_eq!(serde_json::to_value(Meta::default()).unwrap(), json!({}));
        assert!(Meta::default().is_empty());
    }

    #[test]
    fn test_wire_names() {
        let meta: Meta = serde_json::from_value(json!({
            "puid": "abc",
            "tags": {"a": "1"},
            "routing": {"router": 1},
            "requestPath": {"model": "img:1"},
            "metrics": [{"key": "k", "type": "COUNTER", "value": 1}]
        }))
        .unwrap();
        assert_eq!(meta.puid, "abc");
        assert_eq!(meta.routing["router"], 1);
        assert_eq!(meta.request_path["model"], "img:1");
        assert_eq!(meta.metrics.len(), 1);

        let back = serde_json::to_value(&meta).unwrap();
        assert!(back.get("requestPath").is_some());
    }

    #[test]
    fn test_non_string_tag_rejected() {
        let result: Result<Meta, _> = serde_json::from_value(json!({"tags": {"a": {"b": 1}}}));
        assert!(result.is_err());
    }
}
