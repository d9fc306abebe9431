//! Open inference (V2) dialect.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::array::{CanonicalArray, DType, Element, element_count};
use crate::error::GatewayError;

/// A V2 request or response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct V2Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<V2Tensor>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<V2Tensor>,
}

/// One named tensor. Fields are optional on the wire so absence is
/// reported as a missing field rather than a parse failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct V2Tensor {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<usize>>,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl V2Payload {
    /// Decodes the single input tensor, or the single output tensor of a
    /// response body.
    pub fn decode(&self) -> Result<CanonicalArray, GatewayError> {
        let tensors = if self.inputs.is_empty() {
            &self.outputs
        } else {
            &self.inputs
        };
        match tensors.as_slice() {
            [] => Err(GatewayError::missing("inputs")),
            [tensor] => tensor.decode(),
            many => Err(GatewayError::malformed(format!(
                "expected a single input tensor, got {}",
                many.len()
            ))),
        }
    }

    /// Builds a response body holding `array` as `output-0`.
    pub fn encode(array: &CanonicalArray) -> Self {
        Self {
            outputs: vec![V2Tensor::encode("output-0", array)],
            ..Self::default()
        }
    }
}

impl V2Tensor {
    pub fn decode(&self) -> Result<CanonicalArray, GatewayError> {
        let datatype = self
            .datatype
            .as_deref()
            .ok_or_else(|| GatewayError::missing("datatype"))?;
        let shape = self
            .shape
            .as_deref()
            .ok_or_else(|| GatewayError::missing("shape"))?;
        if self.data.is_null() {
            return Err(GatewayError::missing("data"));
        }

        let dtype = DType::from_v2(datatype)?;
        let mut flat = Vec::new();
        flatten(&self.data, &mut flat);
        let expected = element_count(shape)?;
        if flat.len() != expected {
            return Err(GatewayError::malformed(format!(
                "tensor '{}' has shape {shape:?} but {} values",
                self.name,
                flat.len()
            )));
        }

        match dtype {
            DType::Bool => build::<bool>(shape, &flat, datatype),
            DType::U8 => build::<u8>(shape, &flat, datatype),
            DType::U16 => build::<u16>(shape, &flat, datatype),
            DType::U32 => build::<u32>(shape, &flat, datatype),
            DType::U64 => build::<u64>(shape, &flat, datatype),
            DType::I8 => build::<i8>(shape, &flat, datatype),
            DType::I16 => build::<i16>(shape, &flat, datatype),
            DType::I32 => build::<i32>(shape, &flat, datatype),
            DType::I64 => build::<i64>(shape, &flat, datatype),
            DType::F16 | DType::F32 => build::<f32>(shape, &flat, datatype),
            DType::F64 => build::<f64>(shape, &flat, datatype),
        }
    }

    pub fn encode(name: &str, array: &CanonicalArray) -> Self {
        Self {
            name: name.to_string(),
            datatype: Some(array.dtype().v2_name().to_string()),
            shape: Some(array.shape().to_vec()),
            data: Value::Array(array.to_json_values()),
            parameters: None,
        }
    }
}

fn flatten<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| flatten(item, out)),
        scalar => out.push(scalar),
    }
}

fn build<T: Element>(shape: &[usize], flat: &[&Value], datatype: &str) -> Result<CanonicalArray, GatewayError> {
    let values = flat
        .iter()
        .map(|v| {
            T::from_json(v).ok_or_else(|| {
                GatewayError::malformed(format!("value {v} is not a valid {datatype}"))
            })
        })
        .collect::<Result<Vec<T>, _>>()?;
    CanonicalArray::from_shape_vec(shape, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> V2Payload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_decode_int32_input() {
        let p = payload(json!({
            "inputs": [{"name": "x", "datatype": "INT32", "shape": [2, 2], "data": [1, 2, 3, 4]}]
        }));
        let a = p.decode().unwrap();
        assert_eq!(a.dtype(), DType::I32);
        assert_eq!(a.shape(), &[2, 2]);
    }

    #[test]
    fn test_nested_data_is_flattened() {
        let p = payload(json!({
            "inputs": [{"name": "x", "datatype": "FP32", "shape": [2, 2], "data": [[1, 2], [3, 4]]}]
        }));
        assert_eq!(p.decode().unwrap().to_f64_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_fp16_widens() {
        let p = payload(json!({
            "inputs": [{"name": "x", "datatype": "FP16", "shape": [1], "data": [0.5]}]
        }));
        assert_eq!(p.decode().unwrap().dtype(), DType::F32);
    }

    #[test]
    fn test_out_of_range_integer_rejected() {
        let p = payload(json!({
            "inputs": [{"name": "x", "datatype": "UINT8", "shape": [1], "data": [300]}]
        }));
        assert!(matches!(p.decode(), Err(GatewayError::MalformedPayload { .. })));
    }

    #[test]
    fn test_missing_fields() {
        let no_shape = payload(json!({"inputs": [{"name": "x", "datatype": "FP32", "data": [1]}]}));
        assert_eq!(no_shape.decode().unwrap_err(), GatewayError::missing("shape"));

        let no_data = payload(json!({"inputs": [{"name": "x", "datatype": "FP32", "shape": [1]}]}));
        assert_eq!(no_data.decode().unwrap_err(), GatewayError::missing("data"));

        assert_eq!(V2Payload::default().decode().unwrap_err(), GatewayError::missing("inputs"));
    }

    #[test]
    fn test_bytes_rejected() {
        let p = payload(json!({
            "inputs": [{"name": "x", "datatype": "BYTES", "shape": [1], "data": ["a"]}]
        }));
        assert!(matches!(p.decode(), Err(GatewayError::UnsupportedDatatype { .. })));
    }

    #[test]
    fn test_multiple_inputs_rejected() {
        let t = json!({"name": "x", "datatype": "FP32", "shape": [1], "data": [1]});
        let p = payload(json!({"inputs": [t.clone(), t]}));
        assert!(matches!(p.decode(), Err(GatewayError::MalformedPayload { .. })));
    }

    #[test]
    fn test_encode_prefers_fp32_name() {
        let a = CanonicalArray::from_shape_vec(&[2], vec![1.0f32, 2.0]).unwrap();
        let p = V2Payload::encode(&a);
        assert_eq!(p.outputs[0].datatype.as_deref(), Some("FP32"));
        assert_eq!(p.outputs[0].name, "output-0");
        assert_eq!(p.decode().unwrap(), a);
    }
}
