//! Frame envelope and numeric helpers shared by every event.
//!
//! Every frame on the socket is `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound frame envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Outbound frame: an event name plus its payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundEvent {
    pub event: &'static str,
    pub data: Value,
}

impl OutboundEvent {
    pub fn new(event: &'static str, data: Value) -> Self {
        Self { event, data }
    }

    /// An event with no payload (`data: null`).
    pub fn bare(event: &'static str) -> Self {
        Self {
            event,
            data: Value::Null,
        }
    }

    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

/// Encode a float so integral values stay JSON integers.
///
/// Keeps relayed packets identical to what the sender produced when the
/// sender used integers.
pub fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.is_finite() && value.abs() < 9.0e15 {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
    }
}

pub(crate) fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

pub(crate) fn as_i64(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        let f = value.as_f64()?;
        (f.fract() == 0.0 && f.is_finite()).then_some(f as i64)
    })
}
