//! Canonical device identifiers
//!
//! User records carry the bound device in one of three shapes: a plain id,
//! a path such as `/devices/PAMITS001`, or a reference object with an `id`
//! field. Every boundary where stored data enters the bridge goes through
//! [`normalize`], which yields one canonical id or nothing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A normalized, non-empty device identifier without path separators
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Normalizes a plain or path-shaped string
    ///
    /// The last path segment wins; an empty last segment (`"a/"`, `""`)
    /// yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let last = raw.rsplit('/').next().unwrap_or(raw).trim();
        if last.is_empty() {
            None
        } else {
            Some(DeviceId(last.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DeviceId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DeviceId::parse(&value).ok_or_else(|| format!("'{}' is not a device id", value))
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

/// Derives the canonical device id from any stored shape
pub fn normalize(value: &Value) -> Option<DeviceId> {
    match value {
        Value::String(raw) => DeviceId::parse(raw),
        Value::Object(fields) => match fields.get("id") {
            Some(Value::String(id)) => DeviceId::parse(id),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_string_is_unchanged() {
        assert_eq!(normalize(&json!("PAMITS001")).unwrap().as_str(), "PAMITS001");
    }

    #[test]
    fn reference_shape_yields_its_id() {
        let reference = json!({ "id": "PAMITS002", "path": "devices/PAMITS002" });
        assert_eq!(normalize(&reference).unwrap().as_str(), "PAMITS002");
    }

    #[test]
    fn path_string_yields_last_segment() {
        assert_eq!(normalize(&json!("/devices/X/Y")).unwrap().as_str(), "Y");
        assert_eq!(normalize(&json!("/devices/PAMITS001")).unwrap().as_str(), "PAMITS001");
    }

    #[test]
    fn other_shapes_yield_none() {
        assert_eq!(normalize(&json!(null)), None);
        assert_eq!(normalize(&json!(42)), None);
        assert_eq!(normalize(&json!(["a"])), None);
        assert_eq!(normalize(&json!({ "id": 7 })), None);
        assert_eq!(normalize(&json!({ "name": "x" })), None);
        assert_eq!(normalize(&json!("")), None);
        assert_eq!(normalize(&json!("/devices/")), None);
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in [json!("D1"), json!("/devices/D1"), json!({ "id": "D1" })] {
            let once = normalize(&raw).unwrap();
            let twice = normalize(&json!(once.as_str())).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn serde_round_trips_through_normalization() {
        let id: DeviceId = serde_json::from_value(json!("/devices/D9")).unwrap();
        assert_eq!(id.as_str(), "D9");
        assert_eq!(serde_json::to_value(&id).unwrap(), json!("D9"));
        assert!(serde_json::from_value::<DeviceId>(json!("")).is_err());
    }
}
