//! Device connectivity and the status payload decoder
//!
//! Status payloads come in several shapes. Rather than guessing inside the
//! handler, [`decode_status`] returns a tagged result and the reconciler
//! acts on it; `Invalid` is a deliberate, silent no-op.

use serde_json::Value;
use std::fmt;

/// Device-reported connectivity as seen by the dashboard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Connectivity {
    /// No status observed yet
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

impl Connectivity {
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Connectivity::Unknown => None,
            Connectivity::Connected => Some(true),
            Connectivity::Disconnected => Some(false),
        }
    }
}

impl From<bool> for Connectivity {
    fn from(connected: bool) -> Self {
        if connected {
            Connectivity::Connected
        } else {
            Connectivity::Disconnected
        }
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Connectivity::Unknown => "unknown",
            Connectivity::Connected => "connected",
            Connectivity::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// Outcome of decoding one status payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusDecode {
    /// `online` / `offline`, bare or as a JSON string
    Literal(bool),
    /// A JSON object carrying `status` or `connected`
    Structured(bool),
    Invalid,
}

impl StatusDecode {
    pub fn connectivity(self) -> Option<Connectivity> {
        match self {
            StatusDecode::Literal(connected) | StatusDecode::Structured(connected) => {
                Some(connected.into())
            }
            StatusDecode::Invalid => None,
        }
    }
}

pub fn decode_status(payload: &[u8]) -> StatusDecode {
    let Ok(text) = std::str::from_utf8(payload) else {
        return StatusDecode::Invalid;
    };
    let text = text.trim();

    if let Some(connected) = literal(text) {
        return StatusDecode::Literal(connected);
    }

    match serde_json::from_str::<Value>(text) {
        Ok(Value::String(inner)) => literal(inner.trim())
            .map(StatusDecode::Literal)
            .unwrap_or(StatusDecode::Invalid),
        Ok(Value::Object(fields)) => {
            // `status` wins; a null `status` falls through to `connected`
            let field = fields
                .get("status")
                .filter(|value| !value.is_null())
                .or_else(|| fields.get("connected"));
            field
                .and_then(boolean_like)
                .map(StatusDecode::Structured)
                .unwrap_or(StatusDecode::Invalid)
        }
        _ => StatusDecode::Invalid,
    }
}

fn literal(text: &str) -> Option<bool> {
    match text {
        "online" => Some(true),
        "offline" => Some(false),
        _ => None,
    }
}

fn boolean_like(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => number.as_f64().map(|n| n != 0.0),
        Value::String(text) => match text.as_str() {
            "true" | "online" => Some(true),
            "false" | "offline" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
