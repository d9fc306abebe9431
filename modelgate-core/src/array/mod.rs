//! Canonical in-memory array.
//!
//! Every wire payload decodes into a [`CanonicalArray`]: a dense,
//! row-major, typed n-dimensional array backed by `ndarray`. Arrays are
//! always rank 1 or higher; scalars are promoted to shape `[1]`.

mod dtype;
mod element;

pub use dtype::{DType, f16_bits_to_f32};
pub use element::{Element, float_to_json, json_float};

use bytes::BufMut;
use ndarray::{Array1, ArrayD, Axis, IxDyn};
use serde_json::Value;

use crate::error::GatewayError;

/// Dense typed array. The variant is the element type.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalArray {
    Bool(ArrayD<bool>),
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
    U32(ArrayD<u32>),
    U64(ArrayD<u64>),
    I8(ArrayD<i8>),
    I16(ArrayD<i16>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

macro_rules! each_variant {
    ($array:expr, $a:ident => $body:expr) => {
        match $array {
            CanonicalArray::Bool($a) => $body,
            CanonicalArray::U8($a) => $body,
            CanonicalArray::U16($a) => $body,
            CanonicalArray::U32($a) => $body,
            CanonicalArray::U64($a) => $body,
            CanonicalArray::I8($a) => $body,
            CanonicalArray::I16($a) => $body,
            CanonicalArray::I32($a) => $body,
            CanonicalArray::I64($a) => $body,
            CanonicalArray::F32($a) => $body,
            CanonicalArray::F64($a) => $body,
        }
    };
}

/// Product of a shape, rejecting overflow.
pub fn element_count(shape: &[usize]) -> Result<usize, GatewayError> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| GatewayError::malformed(format!("shape {shape:?} overflows")))
}

impl CanonicalArray {
    /// Builds an array from row-major values. An empty shape is treated
    /// as `[1]`.
    pub fn from_shape_vec<T: Element>(shape: &[usize], values: Vec<T>) -> Result<Self, GatewayError> {
        let shape: &[usize] = if shape.is_empty() { &[1] } else { shape };
        let expected = element_count(shape)?;
        if expected != values.len() {
            return Err(GatewayError::malformed(format!(
                "shape {shape:?} expects {expected} elements but {} were supplied",
                values.len()
            )));
        }
        let array = ArrayD::from_shape_vec(IxDyn(shape), values)
            .map_err(|e| GatewayError::malformed(e.to_string()))?;
        Ok(T::wrap(array))
    }

    /// Wraps an existing ndarray, promoting rank 0 to rank 1.
    pub fn from_array<T: Element>(array: ArrayD<T>) -> Self {
        if array.ndim() == 0 {
            let values: Vec<T> = array.iter().copied().collect();
            return T::wrap(Array1::from(values).into_dyn());
        }
        T::wrap(array)
    }

    /// Empty `F64` array of shape `[0]`.
    pub fn empty() -> Self {
        Self::F64(Array1::<f64>::from(Vec::new()).into_dyn())
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::Bool(_) => DType::Bool,
            Self::U8(_) => DType::U8,
            Self::U16(_) => DType::U16,
            Self::U32(_) => DType::U32,
            Self::U64(_) => DType::U64,
            Self::I8(_) => DType::I8,
            Self::I16(_) => DType::I16,
            Self::I32(_) => DType::I32,
            Self::I64(_) => DType::I64,
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        each_variant!(self, a => a.shape())
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn len(&self) -> usize {
        each_variant!(self, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the leading axis.
    pub fn rows(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }

    /// Size of the trailing axis, used for column names.
    pub fn columns(&self) -> usize {
        self.shape().last().copied().unwrap_or(0)
    }

    /// Values in row-major order, widened to `f64`.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        each_variant!(self, a => a.iter().map(|x| x.to_f64()).collect())
    }

    pub fn to_f64_array(&self) -> ArrayD<f64> {
        each_variant!(self, a => a.mapv(|x| x.to_f64()))
    }

    /// Values in row-major order as JSON scalars.
    pub fn to_json_values(&self) -> Vec<Value> {
        each_variant!(self, a => a.iter().map(|x| x.to_json()).collect())
    }

    /// Nested JSON lists following the array's shape.
    pub fn to_json_nested(&self) -> Value {
        nest(&self.to_json_values(), self.shape())
    }

    /// Appends the little-endian encoding of every element.
    pub fn write_le<B: BufMut>(&self, buf: &mut B) {
        each_variant!(self, a => {
            for x in a.iter() {
                x.put_le(buf);
            }
        })
    }

    /// Decodes little-endian bytes. Half floats widen to `F32`.
    pub fn from_le_bytes(dtype: DType, shape: &[usize], bytes: &[u8]) -> Result<Self, GatewayError> {
        let count = element_count(shape)?;
        let expected = count
            .checked_mul(dtype.size_bytes())
            .ok_or_else(|| GatewayError::malformed(format!("shape {shape:?} overflows")))?;
        if bytes.len() != expected {
            return Err(GatewayError::malformed(format!(
                "{count} {dtype} elements need {expected} bytes, got {}",
                bytes.len()
            )));
        }

        let mut buf = bytes;
        match dtype {
            DType::Bool => read_le::<bool>(shape, count, &mut buf),
            DType::U8 => read_le::<u8>(shape, count, &mut buf),
            DType::U16 => read_le::<u16>(shape, count, &mut buf),
            DType::U32 => read_le::<u32>(shape, count, &mut buf),
            DType::U64 => read_le::<u64>(shape, count, &mut buf),
            DType::I8 => read_le::<i8>(shape, count, &mut buf),
            DType::I16 => read_le::<i16>(shape, count, &mut buf),
            DType::I32 => read_le::<i32>(shape, count, &mut buf),
            DType::I64 => read_le::<i64>(shape, count, &mut buf),
            DType::F16 => {
                let values = (0..count)
                    .map(|_| f16_bits_to_f32(bytes::Buf::get_u16_le(&mut buf)))
                    .collect();
                Self::from_shape_vec(shape, values)
            }
            DType::F32 => read_le::<f32>(shape, count, &mut buf),
            DType::F64 => read_le::<f64>(shape, count, &mut buf),
        }
    }

    /// Narrows `F64` to `F32` and `I64` to `I32`. Integers saturate.
    pub fn narrowed(self) -> Self {
        match self {
            Self::F64(a) => Self::F32(a.mapv(|x| x as f32)),
            Self::I64(a) => Self::I32(
                a.mapv(|x| x.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32),
            ),
            other => other,
        }
    }

    /// Stacks `other` under `self` along the leading axis.
    pub fn concat_rows(&self, other: &Self) -> Result<Self, GatewayError> {
        macro_rules! stack {
            ($($variant:ident),*) => {
                match (self, other) {
                    $(
                        (Self::$variant(a), Self::$variant(b)) => {
                            ndarray::concatenate(Axis(0), &[a.view(), b.view()])
                                .map(Self::$variant)
                                .map_err(|e| GatewayError::malformed(format!(
                                    "cannot stack {:?} onto {:?}: {e}",
                                    b.shape(),
                                    a.shape()
                                )))
                        }
                    )*
                    _ => Err(GatewayError::malformed(format!(
                        "cannot stack {} rows onto {} rows",
                        other.dtype(),
                        self.dtype()
                    ))),
                }
            };
        }
        stack!(Bool, U8, U16, U32, U64, I8, I16, I32, I64, F32, F64)
    }
}

fn read_le<T: Element>(shape: &[usize], count: usize, buf: &mut &[u8]) -> Result<CanonicalArray, GatewayError> {
    let values: Vec<T> = (0..count).map(|_| T::get_le(buf)).collect();
    CanonicalArray::from_shape_vec(shape, values)
}

/// Rebuilds nested JSON lists from row-major values.
pub(crate) fn nest(values: &[Value], shape: &[usize]) -> Value {
    match shape.split_first() {
        None => values.first().cloned().unwrap_or(Value::Null),
        Some((_, [])) => Value::Array(values.to_vec()),
        Some((&n, rest)) => {
            let stride: usize = rest.iter().product();
            if stride == 0 {
                return Value::Array((0..n).map(|_| nest(&[], rest)).collect());
            }
            Value::Array(values.chunks(stride).map(|c| nest(c, rest)).collect())
        }
    }
}

impl<T: Element> From<ArrayD<T>> for CanonicalArray {
    fn from(array: ArrayD<T>) -> Self {
        Self::from_array(array)
    }
}
