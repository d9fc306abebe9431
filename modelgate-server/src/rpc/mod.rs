//! Binary RPC surface.
//!
//! Each frame is a big-endian `u32` length followed by a bincode-encoded
//! [`RpcRequest`] or [`RpcResponse`]. Request and response bodies hold the
//! same JSON messages the REST surface accepts, so every payload dialect
//! (including `binTensor` and `binData`) travels unchanged.

mod client;
mod server;

pub use client::RpcClient;
pub use server::RpcServer;

use modelgate_core::codec::{FeedbackEnvelope, WireEnvelope};
use modelgate_core::dispatch::{Direction, ScoreLevel};
use modelgate_core::error::GatewayError;
use modelgate_core::gateway::{GatewayService, parse_message_list};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::LengthDelimitedCodec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcMethod {
    Predict,
    Route,
    TransformInput,
    TransformOutput,
    Aggregate,
    Score { instance: bool, feature: bool },
    SendFeedback,
    Metadata,
}

impl RpcMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Predict => "predict",
            Self::Route => "route",
            Self::TransformInput => "transform_input",
            Self::TransformOutput => "transform_output",
            Self::Aggregate => "aggregate",
            Self::Score { .. } => "score",
            Self::SendFeedback => "send_feedback",
            Self::Metadata => "metadata",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: RpcMethod,
    /// JSON message; empty for `Metadata`.
    pub body: Vec<u8>,
}

impl RpcRequest {
    pub fn new(method: RpcMethod, body: &Value) -> Self {
        Self {
            method,
            body: serde_json::to_vec(body).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// 200 on success, otherwise the HTTP status of the failure.
    pub code: u16,
    /// JSON response, or the failure envelope.
    pub body: Vec<u8>,
}

impl RpcResponse {
    pub fn success(value: &Value) -> Self {
        Self {
            code: 200,
            body: serde_json::to_vec(value).unwrap_or_default(),
        }
    }

    pub fn failure(err: &GatewayError) -> Self {
        Self {
            code: err.status_code(),
            body: serde_json::to_vec(&err.to_status()).unwrap_or_default(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 200
    }

    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Frame codec shared by server and client.
pub fn frame_codec(max_message_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_message_bytes)
        .new_codec()
}

/// Runs one request through the pipeline.
pub fn dispatch(service: &GatewayService, request: &RpcRequest) -> Result<Value, GatewayError> {
    let envelope = || WireEnvelope::from_slice(&request.body);
    match request.method {
        RpcMethod::Predict => service.predict(&envelope()?),
        RpcMethod::Route => service.route(&envelope()?),
        RpcMethod::TransformInput => service.transform(Direction::Input, &envelope()?),
        RpcMethod::TransformOutput => service.transform(Direction::Output, &envelope()?),
        RpcMethod::Aggregate => {
            let messages = parse_message_list(serde_json::from_slice(&request.body)?)?;
            service.aggregate(&messages)
        }
        RpcMethod::Score { instance, feature } => {
            service.score(&envelope()?, ScoreLevel { instance, feature })
        }
        RpcMethod::SendFeedback => service.send_feedback(&FeedbackEnvelope::from_slice(&request.body)?),
        RpcMethod::Metadata => service.metadata(),
    }
}
