//! Datum representation and shared field helpers
//!
//! A datum is kept as a JSON object end to end: the type catalogue is open-ended
//! and handlers only ever touch the fields their schema declares.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::{IngestError, Result};

/// One ingested telemetry record
pub type Datum = Map<String, Value>;

/// Field names assigned by the server, never by clients
pub mod fields {
    pub const TYPE: &str = "type";
    pub const TIME: &str = "time";
    pub const DEVICE_ID: &str = "deviceId";
    pub const SOURCE: &str = "source";
    pub const ID: &str = "id";
    pub const INTERNAL_ID: &str = "_id";
    pub const GROUP_ID: &str = "_groupId";
    pub const USER_ID: &str = "_userId";
    pub const SEQUENCE_ID: &str = "_sequenceId";
    pub const ACTIVE: &str = "_active";
    pub const CREATED_TIME: &str = "createdTime";
    pub const MODIFIED_TIME: &str = "modifiedTime";
    pub const ANNOTATIONS: &str = "annotations";
    pub const DEDUPLICATOR: &str = "_deduplicator";
    pub const PREVIOUS: &str = "previous";
}

/// Parse an ISO-8601 timestamp that carries an explicit offset or `Z`
pub fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // Offsets without a colon, e.g. 2014-01-01T00:00:00+0100
    for format in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%dT%H:%M%z"] {
        if let Ok(dt) = DateTime::parse_from_str(raw, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    None
}

/// Parse a local device time (no offset)
pub fn parse_device_time(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").ok()
}

/// Canonical storage form: UTC, millisecond precision, `Z` suffix
pub fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_string() -> String {
    format_time(&Utc::now())
}

pub fn get_str<'a>(datum: &'a Datum, key: &str) -> Option<&'a str> {
    datum.get(key).and_then(Value::as_str)
}

pub fn get_f64(datum: &Datum, key: &str) -> Option<f64> {
    datum.get(key).and_then(Value::as_f64)
}

/// Read a string field that validation has already guaranteed
pub fn require_str<'a>(datum: &'a Datum, key: &str) -> Result<&'a str> {
    get_str(datum, key).ok_or_else(|| IngestError::invalid(key, "is required"))
}

pub fn time_of(datum: &Datum) -> Result<DateTime<Utc>> {
    let raw = require_str(datum, fields::TIME)?;
    parse_time(raw).ok_or_else(|| IngestError::invalid(fields::TIME, "must be an ISO-8601 datetime with a timezone"))
}

/// Build a JSON number from an f64, rejecting non-finite values
pub fn number(value: f64) -> Result<Value> {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| IngestError::Validation {
            field: None,
            message: format!("non-finite number {}", value),
        })
}

/// Millisecond duration as a JSON integer
pub fn millis(value: i64) -> Value {
    Value::from(value)
}

pub fn has_annotation(datum: &Datum, code: &str) -> bool {
    datum
        .get(fields::ANNOTATIONS)
        .and_then(Value::as_array)
        .map(|list| list.iter().any(|a| a.get("code").and_then(Value::as_str) == Some(code)))
        .unwrap_or(false)
}

/// Attach an annotation unless one with the same code is already present
pub fn annotate(datum: &mut Datum, code: &str, context: Map<String, Value>) {
    if has_annotation(datum, code) {
        return;
    }
    let mut annotation = context;
    annotation.insert("code".to_string(), Value::from(code));

    let entry = datum
        .entry(fields::ANNOTATIONS)
        .or_insert_with(|| Value::Array(Vec::new()));
    if !entry.is_array() {
        *entry = Value::Array(Vec::new());
    }
    if let Value::Array(list) = entry {
        list.push(Value::Object(annotation));
    }
}

/// Drop every annotation with `code`; the field itself goes when it empties
pub fn remove_annotation(datum: &mut Datum, code: &str) {
    let now_empty = match datum.get_mut(fields::ANNOTATIONS) {
        Some(Value::Array(list)) => {
            list.retain(|a| a.get("code").and_then(Value::as_str) != Some(code));
            list.is_empty()
        }
        _ => false,
    };
    if now_empty {
        datum.remove(fields::ANNOTATIONS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_time_requires_offset() {
        assert!(parse_time("2014-01-01T00:00:00Z").is_some());
        assert!(parse_time("2014-01-01T00:00:00.123-08:00").is_some());
        assert!(parse_time("2014-01-01T00:00:00+0100").is_some());
        assert!(parse_time("2014-01-01T00:00:00").is_none());
        assert!(parse_time("yesterday").is_none());
    }

    #[test]
    fn test_format_time_normalizes_to_utc_millis() {
        let t = parse_time("2014-01-01T01:00:00+01:00").unwrap();
        assert_eq!(format_time(&t), "2014-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_annotate_is_idempotent_per_code() {
        let mut datum = json!({"type": "basal"}).as_object().unwrap().clone();
        annotate(&mut datum, "basal/mismatched-series", Map::new());
        annotate(&mut datum, "basal/mismatched-series", Map::new());
        assert_eq!(datum["annotations"].as_array().unwrap().len(), 1);
        assert!(has_annotation(&datum, "basal/mismatched-series"));

        remove_annotation(&mut datum, "basal/mismatched-series");
        assert!(!datum.contains_key("annotations"));
    }
}
