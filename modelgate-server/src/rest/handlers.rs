use std::collections::BTreeMap;
use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use modelgate_core::codec::{FeedbackEnvelope, WireEnvelope};
use modelgate_core::config::Protocol;
use modelgate_core::dispatch::Direction;
use modelgate_core::error::GatewayError;
use modelgate_core::gateway::cloudevents::{header_map, is_event, score_level};
use modelgate_core::gateway::{DeliveryContext, parse_message_list};
use serde_json::Value;
use tracing::{debug, warn};

use super::{RestState, blocking};
use crate::error::ApiError;

type JsonResult = Result<Json<Value>, ApiError>;

fn parse_json(body: &[u8]) -> Result<Value, GatewayError> {
    Ok(serde_json::from_slice(body)?)
}

// ─────────────────────────────────────────────────────────────────────────────
// Verbs
// ─────────────────────────────────────────────────────────────────────────────

pub(super) async fn predict(State(state): State<RestState>, body: Bytes) -> JsonResult {
    let value = state
        .call("predict", move |service| service.predict(&WireEnvelope::from_slice(&body)?))
        .await?;
    Ok(Json(value))
}

/// The path names the model; a gateway serves exactly one, so the name is
/// only logged.
pub(super) async fn infer_v2(
    State(state): State<RestState>,
    Path(name): Path<String>,
    body: Bytes,
) -> JsonResult {
    debug!(model = %name, "V2 inference");
    predict(State(state), body).await
}

pub(super) async fn route(State(state): State<RestState>, body: Bytes) -> JsonResult {
    let value = state
        .call("route", move |service| service.route(&WireEnvelope::from_slice(&body)?))
        .await?;
    Ok(Json(value))
}

pub(super) async fn transform_input(State(state): State<RestState>, body: Bytes) -> JsonResult {
    let value = state
        .call("transform_input", move |service| {
            service.transform(Direction::Input, &WireEnvelope::from_slice(&body)?)
        })
        .await?;
    Ok(Json(value))
}

pub(super) async fn transform_output(State(state): State<RestState>, body: Bytes) -> JsonResult {
    let value = state
        .call("transform_output", move |service| {
            service.transform(Direction::Output, &WireEnvelope::from_slice(&body)?)
        })
        .await?;
    Ok(Json(value))
}

pub(super) async fn aggregate(State(state): State<RestState>, body: Bytes) -> JsonResult {
    let value = state
        .call("aggregate", move |service| {
            let messages = parse_message_list(parse_json(&body)?)?;
            service.aggregate(&messages)
        })
        .await?;
    Ok(Json(value))
}

pub(super) async fn score(
    State(state): State<RestState>,
    headers: HeaderMap,
    body: Bytes,
) -> JsonResult {
    let level = score_level(&header_map(&headers));
    let value = state
        .call("score", move |service| {
            service.score(&WireEnvelope::from_slice(&body)?, level)
        })
        .await?;
    Ok(Json(value))
}

pub(super) async fn send_feedback(State(state): State<RestState>, body: Bytes) -> JsonResult {
    let value = state
        .call("send_feedback", move |service| {
            service.send_feedback(&FeedbackEnvelope::from_slice(&body)?)
        })
        .await?;
    Ok(Json(value))
}

pub(super) async fn metadata(State(state): State<RestState>) -> JsonResult {
    let value = state.call("metadata", |service| service.metadata()).await?;
    Ok(Json(value))
}

pub(super) async fn protocol(State(state): State<RestState>) -> &'static str {
    state.service.protocol().as_str()
}

pub(super) async fn ping() -> &'static str {
    "pong"
}

// ─────────────────────────────────────────────────────────────────────────────
// Root and event push
// ─────────────────────────────────────────────────────────────────────────────

pub(super) async fn root(
    State(state): State<RestState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let headers = header_map(&headers);
    if is_event(&headers) {
        return event(state, headers, body).await;
    }
    let response = match state.service.protocol() {
        Protocol::SeldonfeedbackHttp => send_feedback(State(state), body).await?,
        Protocol::SeldonHttp | Protocol::KfservingHttp => predict(State(state), body).await?,
    };
    Ok(response.into_response())
}

/// Processes one inbound event and acknowledges it with the reply (headers
/// and body), or with an empty 200 while a batch is still filling. The
/// reply is POSTed to the event's reply target in the background; the request
/// guard travels with that task so shutdown waits for it.
async fn event(
    state: RestState,
    headers: BTreeMap<String, String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let guard = state.admit()?;
    let start = Instant::now();
    let ctx = DeliveryContext::from_headers(headers, state.reply_url.clone());
    let events = state.events.clone();
    let result = blocking(move || events.process(&ctx, &body)).await;
    state.record(state.events.method().as_str(), &result, start);

    let Some(reply) = result? else {
        return Ok(StatusCode::OK.into_response());
    };

    let outbound = reply.to_outbound();
    let delivery = state.delivery.clone();
    tokio::spawn(async move {
        let _guard = guard;
        if let Err(e) = delivery.deliver(&outbound).await {
            warn!(correlation_id = %outbound.correlation_id, error = %e, "Reply event not delivered");
        }
    });

    let mut response = Json(reply.body).into_response();
    for (name, value) in &reply.headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => debug!(header = %name, "Skipping reply header that is not valid HTTP"),
        }
    }
    Ok(response)
}
