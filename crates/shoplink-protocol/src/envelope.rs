//! The `{ type, payload }` envelope carried by every realtime frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// One realtime message.
///
/// The wire form is a JSON object with a string `type` and an optional,
/// free-form `payload`. A missing payload decodes as `null`, and a `null`
/// payload is left out when encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// An envelope with no payload.
    pub fn bare(kind: impl Into<String>) -> Self {
        Self::new(kind, Value::Null)
    }

    /// Decode a text frame.
    ///
    /// Extra top-level fields are ignored; only `type` is required.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Decode an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::NotAnObject(json_kind(&value)));
        };

        let kind = match map.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(ProtocolError::MissingType),
        };
        let payload = map.remove("payload").unwrap_or(Value::Null);

        Ok(Self { kind, payload })
    }

    /// Encode to the wire form.
    pub fn to_text(&self) -> String {
        // A String key and a serde_json::Value cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
