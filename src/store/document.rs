use serde_json::{Map, Value};

use crate::core::error::Result;

pub const DEFAULT_FLAG_FIELD: &str = "privilegedModeAccepted";

/// The shared settings document. Only the flag field is ever interpreted;
/// every other key is carried through untouched, in its original order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagDocument {
    fields: Map<String, Value>,
}

impl FlagDocument {
    pub fn parse(content: &[u8]) -> Result<Self> {
        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        let value: Value = serde_json::from_slice(content)?;
        Ok(Self::from_value(value))
    }

    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(fields) => Self { fields },
            other => {
                tracing::warn!(
                    kind = json_kind(&other),
                    "Settings document root is not an object, starting from an empty document"
                );
                Self::default()
            }
        }
    }

    #[must_use]
    pub fn flag(&self, field: &str) -> bool {
        self.fields
            .get(field)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_flag(&mut self, field: &str, value: bool) {
        self.fields.insert(field.to_string(), Value::Bool(value));
    }

    #[must_use]
    pub const fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn to_pretty_string(&self) -> Result<String> {
        let mut content = serde_json::to_string_pretty(&self.fields)?;
        content.push('\n');
        Ok(content)
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
