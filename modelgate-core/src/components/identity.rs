use crate::array::CanonicalArray;
use crate::codec::Meta;
use crate::dispatch::{
    Component, ComponentResult, InputTransformer, ModelResponse, OutputTransformer, Predictor,
};

/// Returns its input unchanged on every verb.
#[derive(Debug, Clone)]
pub struct Identity {
    name: String,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn echo(features: &CanonicalArray, names: &[String]) -> ModelResponse {
        ModelResponse::from(features.clone()).with_names(names.to_vec())
    }
}

impl Predictor for Identity {
    fn predict(&self, features: &CanonicalArray, names: &[String], _meta: &Meta) -> ComponentResult<ModelResponse> {
        Ok(Self::echo(features, names))
    }
}

impl InputTransformer for Identity {
    fn transform_input(&self, features: &CanonicalArray, names: &[String], _meta: &Meta) -> ComponentResult<ModelResponse> {
        Ok(Self::echo(features, names))
    }
}

impl OutputTransformer for Identity {
    fn transform_output(&self, features: &CanonicalArray, names: &[String], _meta: &Meta) -> ComponentResult<ModelResponse> {
        Ok(Self::echo(features, names))
    }
}

impl Component for Identity {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_predictor(&self) -> Option<&dyn Predictor> {
        Some(self)
    }

    fn as_input_transformer(&self) -> Option<&dyn InputTransformer> {
        Some(self)
    }

    fn as_output_transformer(&self) -> Option<&dyn OutputTransformer> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echoes_input() {
        let x = CanonicalArray::from_shape_vec(&[1, 2], vec![1i64, 2]).unwrap();
        let names = vec!["a".to_string(), "b".to_string()];
        let out = Identity::new("id").predict(&x, &names, &Meta::default()).unwrap();
        assert_eq!(out.array(), Some(&x));
        assert_eq!(out.names, names);
    }
}
