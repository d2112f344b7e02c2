use serde_json::{Map, Value};

/// A server-owned entity, patch or option set: always a JSON object.
pub type Payload = Map<String, Value>;

/// Unwraps a JSON value into a payload. Non-objects yield `None`.
pub fn payload_from_value(value: Value) -> Option<Payload> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}
