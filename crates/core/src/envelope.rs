//! The response envelope
//!
//! Every public operation of the manager, and every collaborating function,
//! answers with the same shape: a status code, a message, an optional
//! payload, and an `extra` map for out-of-band hints. On the wire this is
//! the ordered list `[code, message, payload, extra]`; in code it is always
//! this struct.
//!
//! Two `extra` keys have defined meaning:
//! - `rollback: false` tells the request wrapper to skip rolling back the
//!   enclosing SQL transaction;
//! - `undo_data` carries the list of inverse calls produced by a dry-run
//!   probe.

use crate::codes;
use crate::error::CoreError;
use serde_json::{Map, Value};

/// A `{code, message, payload, extra}` response.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// HTTP-like status code; see [`crate::codes`].
    pub code: u16,
    /// Human-readable message.
    pub message: String,
    /// Optional result payload.
    pub payload: Option<Value>,
    /// Out-of-band hints (`rollback`, `undo_data`, ...).
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Build a response with no payload.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Envelope {
            code,
            message: message.into(),
            payload: None,
            extra: Map::new(),
        }
    }

    /// A plain `200 OK`.
    pub fn ok() -> Self {
        Envelope::new(codes::OK, "OK")
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Attach one `extra` entry.
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Whether the code is in the success range (2xx/3xx).
    pub fn is_success(&self) -> bool {
        codes::is_success(self.code)
    }

    /// The wrapper rollback hint: `false` only when `extra.rollback` is
    /// literally `false`.
    pub fn wants_sql_rollback(&self) -> bool {
        !matches!(self.extra.get("rollback"), Some(Value::Bool(false)))
    }

    /// The dry-run undo data, if any.
    pub fn undo_data(&self) -> Option<&Value> {
        self.extra.get("undo_data")
    }

    /// Encode as the wire list `[code, message, payload, extra]`.
    ///
    /// `payload` encodes as `null` when absent; `extra` is always present,
    /// possibly empty.
    pub fn to_wire(&self) -> Value {
        Value::Array(vec![
            Value::from(self.code),
            Value::from(self.message.clone()),
            self.payload.clone().unwrap_or(Value::Null),
            Value::Object(self.extra.clone()),
        ])
    }

    /// Decode the wire list form. Accepts 2..=4 elements; the code must be
    /// an integer in `100..=599`.
    pub fn from_wire(value: &Value) -> Result<Self, CoreError> {
        let items = value
            .as_array()
            .ok_or_else(|| CoreError::BadEnvelope("not a list".into()))?;
        if items.len() < 2 || items.len() > 4 {
            return Err(CoreError::BadEnvelope(format!(
                "expected 2..=4 elements, got {}",
                items.len()
            )));
        }
        let code = items[0]
            .as_u64()
            .filter(|c| (100..=599).contains(c))
            .ok_or_else(|| CoreError::BadEnvelope(format!("bad status code: {}", items[0])))?
            as u16;
        let message = items[1]
            .as_str()
            .ok_or_else(|| CoreError::BadEnvelope("message is not a string".into()))?
            .to_string();
        let payload = match items.get(2) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.clone()),
        };
        let extra = match items.get(3) {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                return Err(CoreError::BadEnvelope(format!(
                    "extra is not an object: {}",
                    other
                )))
            }
        };
        Ok(Envelope {
            code,
            message,
            payload,
            extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_round_trip() {
        let env = Envelope::new(200, "OK")
            .with_payload(json!(["t1", "t2"]))
            .with_extra("undo_data", json!([["setenv", {"key": "A"}]]));
        let back = Envelope::from_wire(&env.to_wire()).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_short_wire_forms() {
        let env = Envelope::from_wire(&json!([304, "No change"])).unwrap();
        assert_eq!(env.code, 304);
        assert!(env.payload.is_none());
        assert!(env.extra.is_empty());

        let env = Envelope::from_wire(&json!([200, "OK", null])).unwrap();
        assert!(env.payload.is_none());
    }

    #[test]
    fn test_bad_wire_forms() {
        assert!(Envelope::from_wire(&json!("nope")).is_err());
        assert!(Envelope::from_wire(&json!([200])).is_err());
        assert!(Envelope::from_wire(&json!([99, "too low"])).is_err());
        assert!(Envelope::from_wire(&json!([200, 5])).is_err());
        assert!(Envelope::from_wire(&json!([200, "OK", null, "extra"])).is_err());
    }

    #[test]
    fn test_rollback_hint() {
        assert!(Envelope::new(409, "duplicate").wants_sql_rollback());
        let env = Envelope::new(409, "duplicate").with_extra("rollback", json!(false));
        assert!(!env.wants_sql_rollback());
        // Any non-`false` value keeps the default.
        let env = Envelope::new(500, "boom").with_extra("rollback", json!("no"));
        assert!(env.wants_sql_rollback());
    }

    #[test]
    fn test_success_range() {
        assert!(Envelope::ok().is_success());
        assert!(Envelope::new(304, "No change").is_success());
        assert!(!Envelope::new(480, "wrong status").is_success());
    }
}
