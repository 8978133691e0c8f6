use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

pub const DEFAULT_TURBIDITY_MIN_GOOD_V: f64 = 1.0;
pub const DEFAULT_R_RATIO_MIN: f64 = 0.35;

/// CPO classification limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Turbidity voltage below this is Bad
    pub turbidity_min_good_v: f64,
    /// R / (R + G + B) below this is Bad
    pub r_ratio_min: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            turbidity_min_good_v: DEFAULT_TURBIDITY_MIN_GOOD_V,
            r_ratio_min: DEFAULT_R_RATIO_MIN,
        }
    }
}

impl Thresholds {
    /// Reads a stored threshold document on top of `fallback`
    ///
    /// Values may be numbers or numeric strings. Older documents name the
    /// turbidity limit `turbidity_max_v`; it is used only when
    /// `turbidity_min_good_v` is absent.
    pub fn from_document(document: &Value, fallback: Thresholds) -> Self {
        let Value::Object(fields) = document else {
            warn!("Threshold document is not an object, using fallback");
            return fallback;
        };

        let turbidity = number_field(fields, "turbidity_min_good_v")
            .or_else(|| number_field(fields, "turbidity_max_v"))
            .unwrap_or(fallback.turbidity_min_good_v);

        Self {
            turbidity_min_good_v: turbidity,
            r_ratio_min: number_field(fields, "r_ratio_min").unwrap_or(fallback.r_ratio_min),
        }
    }
}

fn number_field(fields: &Map<String, Value>, key: &str) -> Option<f64> {
    match fields.get(key)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => match text.trim().parse::<f64>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Threshold {} is not numeric: {:?}", key, text);
                None
            }
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strings_and_numbers_are_accepted() {
        let thresholds = Thresholds::from_document(
            &json!({ "turbidity_min_good_v": "1.4", "r_ratio_min": 0.4 }),
            Thresholds::default(),
        );
        assert_eq!(thresholds.turbidity_min_good_v, 1.4);
        assert_eq!(thresholds.r_ratio_min, 0.4);
    }

    #[test]
    fn legacy_key_is_used_only_without_the_new_one() {
        let legacy = Thresholds::from_document(
            &json!({ "turbidity_max_v": 2.0 }),
            Thresholds::default(),
        );
        assert_eq!(legacy.turbidity_min_good_v, 2.0);
        assert_eq!(legacy.r_ratio_min, DEFAULT_R_RATIO_MIN);

        let both = Thresholds::from_document(
            &json!({ "turbidity_min_good_v": 1.2, "turbidity_max_v": 2.0 }),
            Thresholds::default(),
        );
        assert_eq!(both.turbidity_min_good_v, 1.2);
    }

    #[test]
    fn unusable_documents_fall_back() {
        let fallback = Thresholds::default();
        assert_eq!(Thresholds::from_document(&json!("x"), fallback), fallback);
        assert_eq!(
            Thresholds::from_document(&json!({ "r_ratio_min": "lots" }), fallback),
            fallback
        );
    }
}
