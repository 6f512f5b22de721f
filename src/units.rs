//! Blood glucose unit normalization
//!
//! Everything is stored in mmol/L. Readings reported in mg/dL are converted with
//! the molar-mass factor below, including values buried in schedule arrays and
//! per-schedule maps.

use serde_json::Value;

use crate::error::{IngestError, Result};

/// mg/dL per mmol/L of glucose
pub const GLUCOSE_MGDL_PER_MMOLL: f64 = 18.01559;

pub const MMOL_L: &str = "mmol/L";
pub const MG_DL: &str = "mg/dL";

/// Normalize spelling variants; anything else is rejected
pub fn normalize(units: &str) -> Option<&'static str> {
    match units.to_ascii_lowercase().as_str() {
        "mmol/l" => Some(MMOL_L),
        "mg/dl" => Some(MG_DL),
        _ => None,
    }
}

pub fn normalize_field(field: &str, units: Option<&Value>) -> Result<&'static str> {
    units
        .and_then(Value::as_str)
        .and_then(normalize)
        .ok_or_else(|| IngestError::invalid(field, format!("must be one of [{}, {}]", MMOL_L, MG_DL)))
}

pub fn mgdl_to_mmoll(value: f64) -> f64 {
    value / GLUCOSE_MGDL_PER_MMOLL
}

/// Convert a single numeric value in place; non-numbers are left alone
pub fn convert_value(value: &mut Value) {
    if let Some(n) = value.as_f64() {
        if let Some(converted) = serde_json::Number::from_f64(mgdl_to_mmoll(n)) {
            *value = Value::Number(converted);
        }
    }
}

/// Convert every numeric field named in `keys`, descending through arrays and
/// through object values that are not themselves converted.
pub fn convert_nested(value: &mut Value, keys: &[&str]) {
    match value {
        Value::Array(items) => {
            for item in items {
                convert_nested(item, keys);
            }
        }
        Value::Object(map) => {
            for (key, inner) in map.iter_mut() {
                if keys.contains(&key.as_str()) {
                    convert_value(inner);
                } else if inner.is_array() || inner.is_object() {
                    convert_nested(inner, keys);
                }
            }
        }
        _ => {}
    }
}
