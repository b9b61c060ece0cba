use serde_json::{Map, Value};

/// Schema check failure for an inbound payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("\"{0}\" is required")]
    MissingField(String),

    #[error("\"{field}\" must be {expected}")]
    InvalidType {
        field: String,
        expected: &'static str,
    },
}

pub(crate) fn require_object<'a>(
    value: &'a Value,
    field: &str,
) -> Result<&'a Map<String, Value>, ValidationError> {
    match value.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field.to_string())),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(ValidationError::InvalidType {
            field: field.to_string(),
            expected: "an object",
        }),
    }
}

pub(crate) fn require_array<'a>(
    value: &'a Value,
    field: &str,
) -> Result<&'a Vec<Value>, ValidationError> {
    match value.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field.to_string())),
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(ValidationError::InvalidType {
            field: field.to_string(),
            expected: "an array",
        }),
    }
}

/// Numeric ids arrive either as JSON numbers or as numeric strings.
pub(crate) fn require_id(value: &Value, field: &str) -> Result<i64, ValidationError> {
    let invalid = || ValidationError::InvalidType {
        field: field.to_string(),
        expected: "a number",
    };
    match value.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field.to_string())),
        Some(Value::Number(n)) => n.as_i64().ok_or_else(invalid),
        Some(Value::String(s)) => s.trim().parse().map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}
