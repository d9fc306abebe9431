//! Feedback envelopes.
//!
//! A feedback body bundles the original request, the response that was
//! served, the ground truth and a scalar reward. Each part is a complete
//! wire envelope and decodes on its own.

use serde_json::Value;

use super::{Decoded, Meta, WireEnvelope, decode};
use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackEnvelope {
    pub request: Option<WireEnvelope>,
    pub response: Option<WireEnvelope>,
    pub truth: Option<WireEnvelope>,
    pub reward: f64,
    /// Metric records attached to the feedback itself, in wire form.
    pub metrics: Vec<Value>,
}

/// Decoded feedback parts.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackParts {
    pub request: Option<Decoded>,
    pub response: Option<Decoded>,
    pub truth: Option<Decoded>,
    pub reward: f64,
    /// Meta of the served response; routing decisions live here.
    pub response_meta: Meta,
    pub metrics: Vec<Value>,
}

impl FeedbackEnvelope {
    pub fn from_slice(body: &[u8]) -> Result<Self, GatewayError> {
        Self::from_value(serde_json::from_slice(body)?)
    }

    pub fn from_value(value: Value) -> Result<Self, GatewayError> {
        let Value::Object(mut object) = value else {
            return Err(GatewayError::malformed("Data is not a dict"));
        };

        let mut part = |key: &str| -> Result<Option<WireEnvelope>, GatewayError> {
            match object.remove(key) {
                None | Some(Value::Null) => Ok(None),
                Some(v) => WireEnvelope::from_value(v).map(Some),
            }
        };
        let request = part("request")?;
        let response = part("response")?;
        let truth = part("truth")?;

        let reward = match object.get("reward") {
            None | Some(Value::Null) => 0.0,
            Some(v) => v
                .as_f64()
                .ok_or_else(|| GatewayError::malformed("'reward' is not a number"))?,
        };
        let metrics = match object.remove("metrics") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(_) => return Err(GatewayError::malformed("'metrics' is not a list")),
        };

        Ok(Self {
            request,
            response,
            truth,
            reward,
            metrics,
        })
    }
}

impl FeedbackEnvelope {
    /// Decodes each part that is present and keeps the response meta.
    pub fn decode_parts(&self) -> Result<FeedbackParts, GatewayError> {
        let request = self.request.as_ref().map(decode).transpose()?;
        let response = self.response.as_ref().map(decode).transpose()?;
        let truth = self.truth.as_ref().map(decode).transpose()?;
        let response_meta = self
            .response
            .as_ref()
            .map(|r| r.meta.clone())
            .unwrap_or_default();

        Ok(FeedbackParts {
            request,
            response,
            truth,
            reward: self.reward,
            response_meta,
            metrics: self.metrics.clone(),
        })
    }
}

/// Decodes a feedback body for metric computation. `truth` is required;
/// reward-only feedback goes through [`FeedbackEnvelope::decode_parts`].
pub fn feedback_extract(envelope: &FeedbackEnvelope) -> Result<FeedbackParts, GatewayError> {
    if envelope.truth.is_none() {
        return Err(GatewayError::missing("truth"));
    }
    envelope.decode_parts()
}
