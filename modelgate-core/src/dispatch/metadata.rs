//! Model metadata served at `GET /metadata`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub datatype: String,
    /// `-1` marks a variable dimension.
    pub shape: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub name: String,
    pub versions: Vec<String>,
    pub platform: String,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

/// Splits `repo:tag` on the last `:` that follows the last `/`, so
/// registry ports are not mistaken for tags.
pub fn split_image_tag(image: &str) -> (String, String) {
    let slash = image.rfind('/').map_or(0, |i| i + 1);
    match image[slash..].rfind(':') {
        Some(i) => {
            let at = slash + i;
            (image[..at].to_string(), image[at + 1..].to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}

impl ModelMetadata {
    /// Defaults derived from the unit image, if any.
    pub fn defaults(component_name: &str, image: Option<&str>) -> Self {
        let (name, version) = match image {
            Some(image) if !image.is_empty() => split_image_tag(image),
            _ => (component_name.to_string(), String::new()),
        };
        Self {
            name,
            versions: if version.is_empty() { Vec::new() } else { vec![version] },
            platform: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Overlays component-supplied keys on `defaults` and validates the
    /// result.
    pub fn merge(defaults: &Self, supplied: Value) -> Result<Self, GatewayError> {
        let Value::Object(supplied) = supplied else {
            return Err(GatewayError::InvalidMetadata {
                details: "metadata must be an object".to_string(),
            });
        };

        let mut merged = match serde_json::to_value(defaults) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        merged.extend(supplied);

        let merged = Value::Object(merged);
        validate_shape(&merged)?;
        serde_json::from_value(merged).map_err(|e| GatewayError::InvalidMetadata {
            details: e.to_string(),
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

fn validate_shape(value: &Value) -> Result<(), GatewayError> {
    let invalid = |details: String| GatewayError::InvalidMetadata { details };

    if !value["versions"].is_array() {
        return Err(invalid("'versions' must be a list".to_string()));
    }
    for key in ["inputs", "outputs"] {
        let Some(specs) = value[key].as_array() else {
            return Err(invalid(format!("'{key}' must be a list")));
        };
        for spec in specs {
            for field in ["name", "datatype", "shape"] {
                if spec.get(field).is_none() {
                    return Err(invalid(format!("'{key}' entry is missing '{field}'")));
                }
            }
        }
    }
    Ok(())
}
