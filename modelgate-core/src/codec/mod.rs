//! Wire codec.
//!
//! A [`WireEnvelope`] is one request or response in any supported dialect.
//! [`decode`] turns it into a [`CanonicalArray`] plus feature names and
//! [`encode`] goes back, mirroring the caller's dialect.
//!
//! ## Dialects
//!
//! - `tensor` - flat `f64` values plus shape
//! - `ndarray` - nested JSON lists
//! - `binTensor` - packed little-endian buffer (see [`binary`])
//! - V2 - named tensors with a datatype table (see [`v2`])
//! - flat binary - columnar frame (see [`columnar`]), carried as `binData`
//!   when it travels inside JSON
//! - `jsonData` - free-form JSON produced by components

pub mod binary;
pub mod columnar;
pub mod feedback;
pub mod meta;
pub mod tensor;
pub mod v2;

pub use binary::BinaryTensorPayload;
pub use feedback::{FeedbackEnvelope, FeedbackParts, feedback_extract};
pub use meta::Meta;
pub use tensor::{TensorPayload, decode_ndarray};
pub use v2::{V2Payload, V2Tensor};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use serde_json::{Map, Value, json};

use crate::array::CanonicalArray;
use crate::error::GatewayError;

/// Exactly one payload variant.
#[derive(Debug, Clone, PartialEq)]
pub enum WirePayload {
    Tensor(TensorPayload),
    Ndarray(Value),
    BinaryTensor(BinaryTensorPayload),
    V2(V2Payload),
    FlatBinary(Bytes),
    Json(Value),
}

/// Discriminant of [`WirePayload`], used to pick the response dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Tensor,
    Ndarray,
    BinaryTensor,
    V2,
    FlatBinary,
    Json,
}

impl PayloadKind {
    /// Dialect used for a numeric response to a request of this kind.
    /// Requests without numeric data get tensors back.
    pub fn numeric_response(self) -> Self {
        match self {
            Self::Json => Self::Tensor,
            other => other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tensor => "tensor",
            Self::Ndarray => "ndarray",
            Self::BinaryTensor => "binTensor",
            Self::V2 => "v2",
            Self::FlatBinary => "binData",
            Self::Json => "jsonData",
        }
    }
}

impl WirePayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Tensor(_) => PayloadKind::Tensor,
            Self::Ndarray(_) => PayloadKind::Ndarray,
            Self::BinaryTensor(_) => PayloadKind::BinaryTensor,
            Self::V2(_) => PayloadKind::V2,
            Self::FlatBinary(_) => PayloadKind::FlatBinary,
            Self::Json(_) => PayloadKind::Json,
        }
    }
}

/// One request or response.
#[derive(Debug, Clone, PartialEq)]
pub struct WireEnvelope {
    pub payload: WirePayload,
    pub names: Option<Vec<String>>,
    pub meta: Meta,
}

/// Result of [`decode`].
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub array: CanonicalArray,
    pub names: Vec<String>,
}

impl WireEnvelope {
    pub fn new(payload: WirePayload) -> Self {
        Self {
            payload,
            names: None,
            meta: Meta::default(),
        }
    }

    pub fn kind(&self) -> PayloadKind {
        self.payload.kind()
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, GatewayError> {
        let value: Value = serde_json::from_slice(body)?;
        Self::from_value(value)
    }

    /// Parses a JSON body. Bodies with `inputs` or `outputs` are V2; all
    /// others use the `data` / `jsonData` / `binData` message shape.
    pub fn from_value(value: Value) -> Result<Self, GatewayError> {
        let Value::Object(mut object) = value else {
            return Err(GatewayError::malformed("request body is not a JSON object"));
        };

        if object.contains_key("inputs") || object.contains_key("outputs") {
            let v2: V2Payload = serde_json::from_value(Value::Object(object))?;
            return Ok(Self::new(WirePayload::V2(v2)));
        }

        let meta: Meta = match object.remove("meta") {
            Some(Value::Null) | None => Meta::default(),
            Some(meta) => serde_json::from_value(meta)?,
        };

        let mut candidates = Vec::new();
        let mut names = None;
        if let Some(data) = object.remove("data") {
            let Value::Object(mut data) = data else {
                return Err(GatewayError::malformed("'data' is not an object"));
            };
            if let Some(n) = data.remove("names") {
                names = Some(serde_json::from_value::<Vec<String>>(n)?);
            }
            if let Some(t) = data.remove("tensor") {
                candidates.push(WirePayload::Tensor(serde_json::from_value(t)?));
            }
            if let Some(n) = data.remove("ndarray") {
                candidates.push(WirePayload::Ndarray(n));
            }
            if let Some(b) = data.remove("binTensor") {
                candidates.push(WirePayload::BinaryTensor(serde_json::from_value(b)?));
            }
        }
        if let Some(j) = object.remove("jsonData") {
            candidates.push(WirePayload::Json(j));
        }
        if let Some(b) = object.remove("binData") {
            let text = b
                .as_str()
                .ok_or_else(|| GatewayError::malformed("'binData' is not a base64 string"))?;
            let bytes = BASE64
                .decode(text.as_bytes())
                .map_err(|e| GatewayError::malformed(format!("'binData' is not base64: {e}")))?;
            candidates.push(WirePayload::FlatBinary(Bytes::from(bytes)));
        }

        let payload = match candidates.len() {
            0 => return Err(GatewayError::missing("data")),
            1 => candidates.remove(0),
            _ => {
                return Err(GatewayError::malformed(
                    "exactly one of tensor, ndarray, binTensor, jsonData or binData is allowed",
                ));
            }
        };

        Ok(Self {
            payload,
            names,
            meta,
        })
    }

    /// Renders the envelope as JSON.
    pub fn to_value(&self) -> Value {
        if let WirePayload::V2(v2) = &self.payload {
            return serde_json::to_value(v2).unwrap_or_else(|_| json!({}));
        }

        let mut out = Map::new();
        let mut data = Map::new();
        if let Some(names) = &self.names {
            data.insert("names".to_string(), json!(names));
        }
        match &self.payload {
            WirePayload::Tensor(t) => {
                data.insert("tensor".to_string(), serde_json::to_value(t).unwrap_or(Value::Null));
            }
            WirePayload::Ndarray(n) => {
                data.insert("ndarray".to_string(), n.clone());
            }
            WirePayload::BinaryTensor(b) => {
                data.insert("binTensor".to_string(), serde_json::to_value(b).unwrap_or(Value::Null));
            }
            WirePayload::FlatBinary(bytes) => {
                out.insert("binData".to_string(), Value::String(BASE64.encode(bytes)));
            }
            WirePayload::Json(j) => {
                out.insert("jsonData".to_string(), j.clone());
            }
            WirePayload::V2(_) => {}
        }
        if !data.is_empty() {
            out.insert("data".to_string(), Value::Object(data));
        }
        if !self.meta.is_empty() {
            out.insert("meta".to_string(), serde_json::to_value(&self.meta).unwrap_or(Value::Null));
        }
        Value::Object(out)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        serde_json::to_vec(&self.to_value()).unwrap_or_default()
    }
}

/// Decodes the numeric payload of an envelope.
///
/// `names`, when present and non-empty, must match the last axis.
pub fn decode(envelope: &WireEnvelope) -> Result<Decoded, GatewayError> {
    let (array, frame_names) = match &envelope.payload {
        WirePayload::Tensor(t) => (t.decode()?, None),
        WirePayload::Ndarray(n) => (decode_ndarray(n)?, None),
        WirePayload::BinaryTensor(b) => (b.decode()?, None),
        WirePayload::V2(v) => (v.decode()?, None),
        WirePayload::FlatBinary(frame) => {
            let (array, names) = columnar::decode_data(frame)?;
            (array, Some(names))
        }
        WirePayload::Json(_) => {
            return Err(GatewayError::malformed("jsonData carries no numeric array"));
        }
    };

    let names = envelope.names.clone().or(frame_names).unwrap_or_default();
    if !names.is_empty() && names.len() != array.columns() {
        return Err(GatewayError::malformed(format!(
            "{} names supplied for {} columns",
            names.len(),
            array.columns()
        )));
    }
    Ok(Decoded { array, names })
}

/// Encodes an array in the requested dialect. Empty multi-dimensional
/// arrays requested as `ndarray` are written as tensors so their shape
/// survives.
///
/// # Errors
///
/// `MalformedPayload` when a flat binary frame cannot hold the array.
pub fn encode(array: &CanonicalArray, names: &[String], kind: PayloadKind) -> Result<WireEnvelope, GatewayError> {
    let names_field = (!names.is_empty()).then(|| names.to_vec());
    let (payload, names_field) = match kind.numeric_response() {
        PayloadKind::Tensor | PayloadKind::Json => {
            (WirePayload::Tensor(TensorPayload::encode(array)), names_field)
        }
        // Nested lists lose inner dimensions once the leading one is 0.
        PayloadKind::Ndarray if array.rows() == 0 && array.ndim() > 1 => {
            (WirePayload::Tensor(TensorPayload::encode(array)), names_field)
        }
        PayloadKind::Ndarray => (WirePayload::Ndarray(array.to_json_nested()), names_field),
        PayloadKind::BinaryTensor => (
            WirePayload::BinaryTensor(BinaryTensorPayload::encode(array)),
            names_field,
        ),
        PayloadKind::V2 => (WirePayload::V2(V2Payload::encode(array)), None),
        PayloadKind::FlatBinary => (
            WirePayload::FlatBinary(columnar::encode_data(array, names)?),
            None,
        ),
    };
    Ok(WireEnvelope {
        payload,
        names: names_field,
        meta: Meta::default(),
    })
}

/// Encodes `array` in the dialect of `template`, ignoring its contents.
pub fn encode_like(
    array: &CanonicalArray,
    names: &[String],
    template: &WireEnvelope,
) -> Result<WireEnvelope, GatewayError> {
    encode(array, names, template.kind())
}
