//! CloudEvents binary-mode headers.
//!
//! An inbound request is an event when it carries any `ce-*` header. The
//! reply keeps the inbound id and extensions but is re-stamped with the
//! gateway's own source and type.

use std::collections::BTreeMap;

use axum::http::HeaderMap;
use chrono::{SecondsFormat, Utc};

use crate::dispatch::ScoreLevel;

pub const CE_ID: &str = "ce-id";
pub const CE_SOURCE: &str = "ce-source";
pub const CE_TYPE: &str = "ce-type";
pub const CE_SPECVERSION: &str = "ce-specversion";
pub const CE_TIME: &str = "ce-time";
pub const CE_DATACONTENTTYPE: &str = "ce-datacontenttype";
pub const SPEC_VERSION: &str = "1.0";

/// Selects the accumulation buffer an event belongs to.
pub const INSTANCE_HEADER: &str = "modelgate-detector-instance";
pub const RETURN_INSTANCE_SCORE_HEADER: &str = "modelgate-return-instance-score";
pub const RETURN_FEATURE_SCORE_HEADER: &str = "modelgate-return-feature-score";

const CE_PREFIX: &str = "ce-";

/// Lower-cased copy of every header with a UTF-8 value.
pub fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

/// Whether the headers select event-push mode.
pub fn is_event(headers: &BTreeMap<String, String>) -> bool {
    headers.keys().any(|k| k.starts_with(CE_PREFIX))
}

fn flag(headers: &BTreeMap<String, String>, name: &str) -> bool {
    headers
        .get(name)
        .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

/// Score level requested through the score headers. Both default to off.
pub fn score_level(headers: &BTreeMap<String, String>) -> ScoreLevel {
    ScoreLevel {
        instance: flag(headers, RETURN_INSTANCE_SCORE_HEADER),
        feature: flag(headers, RETURN_FEATURE_SCORE_HEADER),
    }
}

/// Correlation data carried from an inbound event to its reply.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeliveryContext {
    /// Inbound `ce-id`; empty when the event had none.
    pub correlation_id: String,
    /// Where the reply is POSTed. `None` disables delivery for this event.
    pub reply_target: Option<String>,
    pub source: String,
    pub event_type: String,
    /// All inbound headers, lower-cased.
    pub headers: BTreeMap<String, String>,
}

impl DeliveryContext {
    pub fn from_headers(headers: BTreeMap<String, String>, reply_target: Option<String>) -> Self {
        let get = |name: &str| headers.get(name).cloned().unwrap_or_default();
        Self {
            correlation_id: get(CE_ID),
            reply_target: reply_target.filter(|url| !url.is_empty()),
            source: get(CE_SOURCE),
            event_type: get(CE_TYPE),
            headers,
        }
    }

    pub fn is_event(&self) -> bool {
        is_event(&self.headers)
    }

    /// Accumulation key, defaulting to `fallback` (the component name).
    pub fn instance(&self, fallback: &str) -> String {
        self.headers
            .get(INSTANCE_HEADER)
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    }

    pub fn score_level(&self) -> ScoreLevel {
        score_level(&self.headers)
    }

    /// Headers for the reply event.
    ///
    /// The id is kept (a new UUID when empty), source and type are
    /// replaced, `ce-time` is set, and other `ce-*` extensions are
    /// forwarded. `ce-datacontenttype` is never set.
    pub fn reply_headers(&self, source: &str, event_type: &str) -> BTreeMap<String, String> {
        let mut out: BTreeMap<String, String> = self
            .headers
            .iter()
            .filter(|(k, _)| {
                k.starts_with(CE_PREFIX)
                    && !matches!(
                        k.as_str(),
                        CE_ID | CE_SOURCE | CE_TYPE | CE_SPECVERSION | CE_TIME | CE_DATACONTENTTYPE
                    )
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let id = if self.correlation_id.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            self.correlation_id.clone()
        };
        out.insert(CE_ID.to_string(), id);
        out.insert(CE_SOURCE.to_string(), source.to_string());
        out.insert(CE_TYPE.to_string(), event_type.to_string());
        out.insert(CE_SPECVERSION.to_string(), SPEC_VERSION.to_string());
        out.insert(
            CE_TIME.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn inbound() -> BTreeMap<String, String> {
        let mut headers = HeaderMap::new();
        headers.insert("Ce-Id", HeaderValue::from_static("1234"));
        headers.insert("ce-source", HeaderValue::from_static("a.b.c"));
        headers.insert("ce-type", HeaderValue::from_static("d.e.f"));
        headers.insert("ce-specversion", HeaderValue::from_static("1.0"));
        headers.insert("ce-datacontenttype", HeaderValue::from_static("application/json"));
        headers.insert("ce-traceparent", HeaderValue::from_static("00-abc"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        header_map(&headers)
    }

    #[test]
    fn test_event_detection() {
        assert!(is_event(&inbound()));
        let plain = BTreeMap::from([("content-type".to_string(), "application/json".to_string())]);
        assert!(!is_event(&plain));
    }

    #[test]
    fn test_reply_headers_restamped() {
        let ctx = DeliveryContext::from_headers(inbound(), Some("http://sink".into()));
        assert_eq!(ctx.correlation_id, "1234");
        assert_eq!(ctx.source, "a.b.c");

        let reply = ctx.reply_headers("io.modelgate.detector", "io.modelgate.drift");
        assert_eq!(reply[CE_ID], "1234");
        assert_eq!(reply[CE_SOURCE], "io.modelgate.detector");
        assert_eq!(reply[CE_TYPE], "io.modelgate.drift");
        assert_eq!(reply[CE_SPECVERSION], "1.0");
        assert_eq!(reply["ce-traceparent"], "00-abc");
        assert!(reply.contains_key(CE_TIME));
        assert!(!reply.contains_key(CE_DATACONTENTTYPE));
        assert!(!reply.contains_key("content-type"));
    }

    #[test]
    fn test_missing_id_generates_one() {
        let ctx = DeliveryContext::from_headers(BTreeMap::new(), None);
        let reply = ctx.reply_headers("s", "t");
        assert_eq!(reply[CE_ID].len(), 32);
    }

    #[test]
    fn test_empty_reply_target_ignored() {
        let ctx = DeliveryContext::from_headers(BTreeMap::new(), Some(String::new()));
        assert!(ctx.reply_target.is_none());
    }

    #[test]
    fn test_context_without_ce_headers() {
        let ctx = DeliveryContext::from_headers(BTreeMap::new(), None);
        assert!(!ctx.is_event());
        assert!(ctx.correlation_id.is_empty());
        assert!(ctx.source.is_empty());
        assert!(ctx.event_type.is_empty());
    }

    #[test]
    fn test_instance_and_score_level() {
        let headers = BTreeMap::from([
            (INSTANCE_HEADER.to_string(), "drift-a".to_string()),
            (RETURN_INSTANCE_SCORE_HEADER.to_string(), "True".to_string()),
        ]);
        let ctx = DeliveryContext::from_headers(headers, None);
        assert_eq!(ctx.instance("detector"), "drift-a");
        assert_eq!(
            ctx.score_level(),
            ScoreLevel {
                instance: true,
                feature: false
            }
        );
        assert_eq!(DeliveryContext::default().instance("detector"), "detector");
    }
}
