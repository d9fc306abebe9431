//! Element datatypes and the V2 datatype name table.

use std::fmt;

use crate::error::GatewayError;

/// Element type of a canonical array.
///
/// `F16` only exists on the wire. Arrays never store half floats; decoding
/// widens them to `F32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F16,
    F32,
    F64,
}

impl DType {
    /// Resolves a V2 datatype name. `BYTES` and unknown names are rejected.
    pub fn from_v2(name: &str) -> Result<Self, GatewayError> {
        let dtype = match name {
            "BOOL" => Self::Bool,
            "UINT8" => Self::U8,
            "UINT16" => Self::U16,
            "UINT32" => Self::U32,
            "UINT64" => Self::U64,
            "INT8" => Self::I8,
            "INT16" => Self::I16,
            "INT32" => Self::I32,
            "INT64" => Self::I64,
            "FP16" => Self::F16,
            "FP32" => Self::F32,
            "FP64" => Self::F64,
            other => {
                return Err(GatewayError::UnsupportedDatatype {
                    datatype: other.to_string(),
                });
            }
        };
        Ok(dtype)
    }

    pub fn v2_name(self) -> &'static str {
        match self {
            Self::Bool => "BOOL",
            Self::U8 => "UINT8",
            Self::U16 => "UINT16",
            Self::U32 => "UINT32",
            Self::U64 => "UINT64",
            Self::I8 => "INT8",
            Self::I16 => "INT16",
            Self::I32 => "INT32",
            Self::I64 => "INT64",
            Self::F16 => "FP16",
            Self::F32 => "FP32",
            Self::F64 => "FP64",
        }
    }

    /// Width of one element in the little-endian binary layout.
    pub fn size_bytes(self) -> usize {
        match self {
            Self::Bool | Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 | Self::F16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }

    /// Type the array is stored as after decoding.
    pub fn storage(self) -> Self {
        match self {
            Self::F16 => Self::F32,
            other => other,
        }
    }

    /// Type produced by the binary tensor decoder, which narrows
    /// 64-bit floats and signed integers.
    pub fn narrowed(self) -> Self {
        match self {
            Self::F64 | Self::F16 => Self::F32,
            Self::I64 => Self::I32,
            other => other,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F16 | Self::F32 | Self::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.v2_name())
    }
}

/// Widens an IEEE 754 half-precision bit pattern to `f32`.
pub fn f16_bits_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15) << 31;
    let exponent = u32::from((bits >> 10) & 0x1f);
    let fraction = u32::from(bits & 0x03ff);

    let out = match (exponent, fraction) {
        (0, 0) => sign,
        (0, _) => {
            // Subnormal: shift until the implicit bit appears.
            let mut exp: i32 = -14;
            let mut frac = fraction;
            while frac & 0x0400 == 0 {
                frac <<= 1;
                exp -= 1;
            }
            frac &= 0x03ff;
            sign | (((exp + 127) as u32) << 23) | (frac << 13)
        }
        (0x1f, 0) => sign | 0x7f80_0000,
        (0x1f, _) => sign | 0x7fc0_0000 | (fraction << 13),
        _ => sign | ((exponent + 112) << 23) | (fraction << 13),
    };
    f32::from_bits(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v2_table_round_trips_names() {
        for name in [
            "BOOL", "UINT8", "UINT16", "UINT32", "UINT64", "INT8", "INT16", "INT32", "INT64",
            "FP16", "FP32", "FP64",
        ] {
            assert_eq!(DType::from_v2(name).unwrap().v2_name(), name);
        }
    }

    #[test]
    fn test_bytes_is_unsupported() {
        let err = DType::from_v2("BYTES").unwrap_err();
        assert_eq!(
            err,
            GatewayError::UnsupportedDatatype {
                datatype: "BYTES".to_string()
            }
        );
        assert!(DType::from_v2("fp32").is_err());
    }

    #[test]
    fn test_storage_and_narrowing() {
        assert_eq!(DType::F16.storage(), DType::F32);
        assert_eq!(DType::F64.storage(), DType::F64);
        assert_eq!(DType::F64.narrowed(), DType::F32);
        assert_eq!(DType::I64.narrowed(), DType::I32);
        assert_eq!(DType::U64.narrowed(), DType::U64);
    }

    #[test]
    fn test_half_widening() {
        assert_eq!(f16_bits_to_f32(0x3c00), 1.0);
        assert_eq!(f16_bits_to_f32(0xc000), -2.0);
        assert_eq!(f16_bits_to_f32(0x7bff), 65504.0);
        assert_eq!(f16_bits_to_f32(0x0000), 0.0);
        assert_eq!(f16_bits_to_f32(0x0001), 2f32.powi(-24));
        assert_eq!(f16_bits_to_f32(0x0200), 2f32.powi(-15));
        assert_eq!(f16_bits_to_f32(0x7c00), f32::INFINITY);
        assert!(f16_bits_to_f32(0x7e00).is_nan());
    }
}
