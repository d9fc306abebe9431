//! Scalar element types a canonical array can hold.

use std::fmt;

use bytes::{Buf, BufMut};
use ndarray::ArrayD;
use serde_json::Value;

use super::{CanonicalArray, DType};

/// A scalar type with a fixed wire representation.
pub trait Element: Copy + PartialEq + fmt::Debug + Send + Sync + 'static {
    const DTYPE: DType;

    fn to_f64(self) -> f64;

    fn to_json(self) -> Value;

    /// Range-checked conversion from a JSON scalar.
    fn from_json(value: &Value) -> Option<Self>;

    fn put_le<B: BufMut>(self, buf: &mut B);

    /// Reads one element. Callers check the remaining length first.
    fn get_le<B: Buf>(buf: &mut B) -> Self;

    fn wrap(array: ArrayD<Self>) -> CanonicalArray;
}

/// Integer view of a JSON number. Floats count when they have no
/// fractional part.
fn json_integer(value: &Value) -> Option<i128> {
    if let Some(i) = value.as_i64() {
        return Some(i128::from(i));
    }
    if let Some(u) = value.as_u64() {
        return Some(i128::from(u));
    }
    let f = value.as_f64()?;
    (f.fract() == 0.0 && f.abs() < 1.9e19).then_some(f as i128)
}

/// JSON form of a float. Non-finite values become the `"NaN"`,
/// `"Infinity"` and `"-Infinity"` strings since JSON numbers cannot hold
/// them.
pub fn float_to_json(value: f64) -> Value {
    if value.is_nan() {
        Value::from("NaN")
    } else if value == f64::INFINITY {
        Value::from("Infinity")
    } else if value == f64::NEG_INFINITY {
        Value::from("-Infinity")
    } else {
        Value::from(value)
    }
}

/// Float view of a JSON scalar, accepting the non-finite tokens written
/// by [`float_to_json`].
pub fn json_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => non_finite_token(s),
        _ => None,
    }
}

fn non_finite_token(token: &str) -> Option<f64> {
    match token {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        _ => None,
    }
}

macro_rules! integer_element {
    ($t:ty, $dtype:ident, $put:ident, $get:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$dtype;

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn to_json(self) -> Value {
                Value::from(self)
            }

            fn from_json(value: &Value) -> Option<Self> {
                json_integer(value).and_then(|i| <$t>::try_from(i).ok())
            }

            fn put_le<B: BufMut>(self, buf: &mut B) {
                buf.$put(self)
            }

            fn get_le<B: Buf>(buf: &mut B) -> Self {
                buf.$get()
            }

            fn wrap(array: ArrayD<Self>) -> CanonicalArray {
                CanonicalArray::$dtype(array)
            }
        }
    };
}

integer_element!(u8, U8, put_u8, get_u8);
integer_element!(u16, U16, put_u16_le, get_u16_le);
integer_element!(u32, U32, put_u32_le, get_u32_le);
integer_element!(u64, U64, put_u64_le, get_u64_le);
integer_element!(i8, I8, put_i8, get_i8);
integer_element!(i16, I16, put_i16_le, get_i16_le);
integer_element!(i32, I32, put_i32_le, get_i32_le);
integer_element!(i64, I64, put_i64_le, get_i64_le);

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    fn to_json(self) -> Value {
        float_to_json(f64::from(self))
    }

    fn from_json(value: &Value) -> Option<Self> {
        json_float(value).map(|f| f as f32)
    }

    fn put_le<B: BufMut>(self, buf: &mut B) {
        buf.put_f32_le(self)
    }

    fn get_le<B: Buf>(buf: &mut B) -> Self {
        buf.get_f32_le()
    }

    fn wrap(array: ArrayD<Self>) -> CanonicalArray {
        CanonicalArray::F32(array)
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;

    fn to_f64(self) -> f64 {
        self
    }

    fn to_json(self) -> Value {
        float_to_json(self)
    }

    fn from_json(value: &Value) -> Option<Self> {
        json_float(value)
    }

    fn put_le<B: BufMut>(self, buf: &mut B) {
        buf.put_f64_le(self)
    }

    fn get_le<B: Buf>(buf: &mut B) -> Self {
        buf.get_f64_le()
    }

    fn wrap(array: ArrayD<Self>) -> CanonicalArray {
        CanonicalArray::F64(array)
    }
}

impl Element for bool {
    const DTYPE: DType = DType::Bool;

    fn to_f64(self) -> f64 {
        if self { 1.0 } else { 0.0 }
    }

    fn to_json(self) -> Value {
        Value::Bool(self)
    }

    fn from_json(value: &Value) -> Option<Self> {
        value.as_bool()
    }

    fn put_le<B: BufMut>(self, buf: &mut B) {
        buf.put_u8(u8::from(self))
    }

    fn get_le<B: Buf>(buf: &mut B) -> Self {
        buf.get_u8() != 0
    }

    fn wrap(array: ArrayD<Self>) -> CanonicalArray {
        CanonicalArray::Bool(array)
    }
}
