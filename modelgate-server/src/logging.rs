//! Request logging for the REST surface.
//!
//! `tower_http::trace::TraceLayer` with callbacks that tag each span with a
//! request id and redact credentials when headers are logged.

use http::{HeaderMap, Request, Response};
use modelgate_core::gateway::cloudevents::CE_ID;
use std::fmt;
use std::time::Duration;
use tower_http::classify::{ServerErrorsAsFailures, ServerErrorsFailureClass, SharedClassifier};
use tower_http::trace::{DefaultOnBodyChunk, DefaultOnEos, MakeSpan, OnFailure, OnRequest, OnResponse, TraceLayer};
use tracing::{Span, info, warn};

const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "x-api-key",
    "x-auth-token",
    "proxy-authorization",
    "set-cookie",
];

const MAX_HEADERS_TO_LOG: usize = 50;
const MAX_VALUE_LEN: usize = 1024;

pub type LoggingLayer = TraceLayer<
    SharedClassifier<ServerErrorsAsFailures>,
    RequestIdSpan,
    OnRequestLogger,
    OnResponseLogger,
    DefaultOnBodyChunk,
    DefaultOnEos,
    OnFailureLogger,
>;

pub fn logging_layer() -> LoggingLayer {
    TraceLayer::new_for_http()
        .make_span_with(RequestIdSpan)
        .on_request(OnRequestLogger)
        .on_response(OnResponseLogger)
        .on_failure(OnFailureLogger)
}

/// Request id for log correlation: `x-request-id`, else the CloudEvents id,
/// else a fresh UUID.
pub fn request_id(headers: &HeaderMap) -> String {
    ["x-request-id", CE_ID]
        .iter()
        .find_map(|name| {
            headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

#[derive(Clone, Debug)]
pub struct RequestIdSpan;

impl<B> MakeSpan<B> for RequestIdSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id(request.headers()),
        )
    }
}

#[derive(Clone, Debug)]
pub struct OnRequestLogger;

impl<B> OnRequest<B> for OnRequestLogger {
    fn on_request(&mut self, request: &Request<B>, _span: &Span) {
        info!(method = %request.method(), uri = %request.uri(), "Request received");

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(headers = ?SanitizedHeaders(request.headers()), "Request headers");
        }
    }
}

#[derive(Clone, Debug)]
pub struct OnResponseLogger;

impl<B> OnResponse<B> for OnResponseLogger {
    fn on_response(self, response: &Response<B>, latency: Duration, _span: &Span) {
        info!(
            status = response.status().as_u16(),
            latency_ms = latency.as_millis() as u64,
            "Response sent"
        );

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(headers = ?SanitizedHeaders(response.headers()), "Response headers");
        }
    }
}

#[derive(Clone, Debug)]
pub struct OnFailureLogger;

impl OnFailure<ServerErrorsFailureClass> for OnFailureLogger {
    fn on_failure(&mut self, failure: ServerErrorsFailureClass, latency: Duration, _span: &Span) {
        warn!(
            classification = %failure,
            latency_ms = latency.as_millis() as u64,
            "Request failed"
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Header redaction
// ─────────────────────────────────────────────────────────────────────────────

/// Formats headers with credentials replaced by `[REDACTED]`.
pub struct SanitizedHeaders<'a>(pub &'a HeaderMap);

impl fmt::Debug for SanitizedHeaders<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();

        for (idx, (name, value)) in self.0.iter().enumerate() {
            if idx >= MAX_HEADERS_TO_LOG {
                map.entry(&"...", &format!("({} more headers)", self.0.len() - idx));
                break;
            }

            let name = name.as_str();
            if SENSITIVE_HEADERS.iter().any(|s| name.eq_ignore_ascii_case(s)) {
                map.entry(&name, &"[REDACTED]");
                continue;
            }
            match value.to_str() {
                Ok(v) if v.len() <= MAX_VALUE_LEN => {
                    map.entry(&name, &v);
                }
                Ok(v) => {
                    let cut = (0..=MAX_VALUE_LEN).rev().find(|&i| v.is_char_boundary(i)).unwrap_or(0);
                    map.entry(&name, &format!("{}... ({} bytes)", &v[..cut], v.len()));
                }
                Err(_) => {
                    map.entry(&name, &format!("<binary: {} bytes>", value.len()));
                }
            }
        }

        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_request_id_prefers_x_request_id() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("req-1"));
        headers.insert("ce-id", HeaderValue::from_static("evt-1"));
        assert_eq!(request_id(&headers), "req-1");
    }

    #[test]
    fn test_request_id_falls_back_to_event_id() {
        let mut headers = HeaderMap::new();
        headers.insert("ce-id", HeaderValue::from_static("evt-1"));
        assert_eq!(request_id(&headers), "evt-1");
    }

    #[test]
    fn test_request_id_generated() {
        let id = request_id(&HeaderMap::new());
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_sensitive_headers_redacted() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let rendered = format!("{:?}", SanitizedHeaders(&headers));
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("application/json"));
    }

    #[test]
    fn test_long_values_truncated() {
        let mut headers = HeaderMap::new();
        let long = "a".repeat(MAX_VALUE_LEN + 10);
        headers.insert("x-long", HeaderValue::from_str(&long).unwrap());

        let rendered = format!("{:?}", SanitizedHeaders(&headers));
        assert!(rendered.contains(&format!("({} bytes)", MAX_VALUE_LEN + 10)));
    }
}
