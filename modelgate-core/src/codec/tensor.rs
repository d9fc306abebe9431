//! `tensor` and `ndarray` dialects.

use serde::{Deserialize, Deserializer, Serialize, Serializer, de, ser::SerializeSeq};
use serde_json::Value;

use crate::array::{CanonicalArray, Element, float_to_json, json_float};
use crate::error::GatewayError;

/// Flat `f64` values with an optional shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<usize>>,

    #[serde(serialize_with = "serialize_compact", deserialize_with = "deserialize_values")]
    pub values: Vec<f64>,
}

/// Integral values are written without a decimal point so a re-encoded
/// tensor matches its input text.
fn serialize_compact<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
    const EXACT: f64 = 9_007_199_254_740_992.0;

    let mut seq = serializer.serialize_seq(Some(values.len()))?;
    for &v in values {
        let integral = v.fract() == 0.0 && v.abs() < EXACT && (v != 0.0 || v.is_sign_positive());
        if integral {
            seq.serialize_element(&(v as i64))?;
        } else if v.is_finite() {
            seq.serialize_element(&v)?;
        } else {
            seq.serialize_element(&float_to_json(v))?;
        }
    }
    seq.end()
}

fn deserialize_values<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
    Vec::<Value>::deserialize(deserializer)?
        .iter()
        .map(|v| json_float(v).ok_or_else(|| de::Error::custom(format!("invalid tensor value {v}"))))
        .collect()
}

impl TensorPayload {
    pub fn decode(&self) -> Result<CanonicalArray, GatewayError> {
        let shape = self
            .shape
            .clone()
            .unwrap_or_else(|| vec![self.values.len()]);
        CanonicalArray::from_shape_vec(&shape, self.values.clone())
    }

    pub fn encode(array: &CanonicalArray) -> Self {
        Self {
            shape: Some(array.shape().to_vec()),
            values: array.to_f64_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leaf {
    Bool,
    Int,
    /// Integer above `i64::MAX`.
    BigInt,
    Float,
}

/// Decodes nested JSON lists.
///
/// Element type: all booleans give `Bool`, all integers give `I64` (`U64`
/// when one exceeds `i64::MAX` and none is negative), and any float gives
/// `F64`. Ragged rows and non-numeric leaves are rejected.
pub fn decode_ndarray(value: &Value) -> Result<CanonicalArray, GatewayError> {
    let shape = infer_shape(value);
    let mut leaves = Vec::new();
    collect_leaves(value, &shape, 0, &mut leaves)?;

    let mut kind: Option<Leaf> = None;
    for leaf in &leaves {
        let this = match leaf {
            Value::Bool(_) => Leaf::Bool,
            Value::Number(n) if n.is_i64() => Leaf::Int,
            Value::Number(n) if n.is_u64() => Leaf::BigInt,
            Value::Number(_) => Leaf::Float,
            Value::String(_) if json_float(leaf).is_some() => Leaf::Float,
            other => {
                return Err(GatewayError::malformed(format!(
                    "ndarray contains non-numeric value {other}"
                )));
            }
        };
        kind = Some(match (kind, this) {
            (None, k) => k,
            (Some(a), b) if a == b => a,
            (Some(Leaf::Int | Leaf::BigInt), Leaf::Int | Leaf::BigInt) => Leaf::BigInt,
            (Some(Leaf::Int | Leaf::BigInt | Leaf::Float), Leaf::Int | Leaf::BigInt | Leaf::Float) => {
                Leaf::Float
            }
            _ => return Err(GatewayError::malformed("ndarray mixes booleans and numbers")),
        });
    }

    match kind {
        Some(Leaf::Bool) => typed::<bool>(&shape, &leaves),
        Some(Leaf::Int) => typed::<i64>(&shape, &leaves),
        // Negative values next to a big one only fit a float.
        Some(Leaf::BigInt) => typed::<u64>(&shape, &leaves).or_else(|_| typed::<f64>(&shape, &leaves)),
        Some(Leaf::Float) | None => typed::<f64>(&shape, &leaves),
    }
}

fn typed<T: Element>(shape: &[usize], leaves: &[&Value]) -> Result<CanonicalArray, GatewayError> {
    let values = leaves
        .iter()
        .map(|v| {
            T::from_json(v).ok_or_else(|| {
                GatewayError::malformed(format!("value {v} is not a valid {}", T::DTYPE))
            })
        })
        .collect::<Result<Vec<T>, _>>()?;
    CanonicalArray::from_shape_vec(shape, values)
}

fn infer_shape(value: &Value) -> Vec<usize> {
    let mut shape = Vec::new();
    let mut cursor = value;
    while let Value::Array(items) = cursor {
        shape.push(items.len());
        match items.first() {
            Some(first) => cursor = first,
            None => break,
        }
    }
    shape
}

fn collect_leaves<'a>(
    value: &'a Value,
    shape: &[usize],
    depth: usize,
    out: &mut Vec<&'a Value>,
) -> Result<(), GatewayError> {
    match (value, shape.get(depth)) {
        (Value::Array(items), Some(&len)) if items.len() == len => {
            for item in items {
                collect_leaves(item, shape, depth + 1, out)?;
            }
            Ok(())
        }
        (Value::Array(_), _) => Err(GatewayError::malformed("ndarray rows are not rectangular")),
        (_, None) => {
            out.push(value);
            Ok(())
        }
        (_, Some(_)) => Err(GatewayError::malformed("ndarray rows are not rectangular")),
    }
}
