//! Raw little-endian tensors (`binTensor`).

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::array::{CanonicalArray, DType};
use crate::error::GatewayError;

/// Datatype, shape and packed little-endian contents.
///
/// In JSON the contents travel base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryTensorPayload {
    pub datatype: String,
    pub shape: Vec<usize>,
    #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
    pub contents: Vec<u8>,
}

fn to_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(bytes))
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let text = String::deserialize(deserializer)?;
    BASE64.decode(text.as_bytes()).map_err(serde::de::Error::custom)
}

impl BinaryTensorPayload {
    /// Decodes the contents. `FP64` narrows to `FP32`, `INT64` to `INT32`
    /// and `FP16` widens to `FP32`; other types keep their width.
    pub fn decode(&self) -> Result<CanonicalArray, GatewayError> {
        let dtype = DType::from_v2(&self.datatype)?;
        let array = CanonicalArray::from_le_bytes(dtype, &self.shape, &self.contents)?;
        Ok(array.narrowed())
    }

    pub fn encode(array: &CanonicalArray) -> Self {
        let mut contents = Vec::with_capacity(array.len() * array.dtype().size_bytes());
        array.write_le(&mut contents);
        Self {
            datatype: array.dtype().v2_name().to_string(),
            shape: array.shape().to_vec(),
            contents,
        }
    }
}
