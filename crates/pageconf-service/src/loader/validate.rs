use serde_json::Value;
use thiserror::Error;

use crate::config::ValidationConfig;

/// Why a fetched payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(String),
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("missing required field `{0}`")]
    MissingField(String),
}

/// Checks a freshly fetched payload before it is cached and returned.
pub trait ConfigValidator: Send + Sync + 'static {
    fn validate(&self, payload: &Value) -> Result<(), ValidationError>;
}

/// Requires the payload to be a JSON object containing all `required_fields`.
///
/// A field that is present but `null` counts as missing.
#[derive(Debug, Clone, Default)]
pub struct StructuralValidator {
    required_fields: Vec<String>,
}

impl StructuralValidator {
    pub fn new(required_fields: Vec<String>) -> Self {
        Self { required_fields }
    }

    pub fn from_config(config: &ValidationConfig) -> Self {
        Self::new(config.required_fields.clone())
    }
}

impl ConfigValidator for StructuralValidator {
    fn validate(&self, payload: &Value) -> Result<(), ValidationError> {
        let object = match payload {
            Value::Object(object) => object,
            Value::Null => return Err(ValidationError::NotAnObject("null")),
            Value::Bool(_) => return Err(ValidationError::NotAnObject("a boolean")),
            Value::Number(_) => return Err(ValidationError::NotAnObject("a number")),
            Value::String(_) => return Err(ValidationError::NotAnObject("a string")),
            Value::Array(_) => return Err(ValidationError::NotAnObject("an array")),
        };

        for field in &self.required_fields {
            if object.get(field).is_none_or(Value::is_null) {
                return Err(ValidationError::MissingField(field.clone()));
            }
        }
        Ok(())
    }
}
