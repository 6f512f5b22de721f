//! Validation combinators
//!
//! Small predicates over an optional JSON value, composed into per-type field
//! schemas. A failing predicate yields a [`Violation`] naming the offending field
//! path; the registry turns it into an [`IngestError::Validation`].

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::datum::{parse_device_time, parse_time};
use crate::error::IngestError;

/// A single failed check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted field path, filled in as the violation bubbles out of nested schemas
    pub field: Option<String>,
    pub message: String,
}

impl Violation {
    pub fn new(message: impl Into<String>) -> Self {
        Self { field: None, message: message.into() }
    }

    /// Tag with `name` unless a nested schema already named the field
    fn within(mut self, name: &str) -> Self {
        if self.field.is_none() {
            self.field = Some(name.to_string());
        }
        self
    }

    fn prefixed(mut self, label: &str) -> Self {
        self.field = Some(match self.field {
            Some(field) => format!("{}.{}", label, field),
            None => label.to_string(),
        });
        self
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{} {}", field, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl From<Violation> for IngestError {
    fn from(v: Violation) -> Self {
        IngestError::Validation { field: v.field, message: v.message }
    }
}

pub type CheckResult = std::result::Result<(), Violation>;

/// A composable predicate over an optional value
#[derive(Clone)]
pub struct Check(Arc<dyn Fn(Option<&Value>) -> CheckResult + Send + Sync>);

impl Check {
    pub fn new(f: impl Fn(Option<&Value>) -> CheckResult + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn check(&self, value: Option<&Value>) -> CheckResult {
        (self.0)(value)
    }
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Check")
    }
}

/// Null counts as absent everywhere
fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn required(value: Option<&Value>) -> std::result::Result<&Value, Violation> {
    present(value).ok_or_else(|| Violation::new("is required"))
}

/// Ordered map of field name to check
#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    fields: Vec<(String, Check)>,
}

impl FieldSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the check for `name`
    pub fn field(mut self, name: &str, check: Check) -> Self {
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = check,
            None => self.fields.push((name.to_string(), check)),
        }
        self
    }

    /// Combine two schemas; checks in `other` win on name clashes
    pub fn merge(&self, other: &FieldSchema) -> FieldSchema {
        other
            .fields
            .iter()
            .fold(self.clone(), |acc, (name, check)| acc.field(name, check.clone()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Validate an object, stopping at the first failing field
    pub fn validate(&self, object: &Map<String, Value>) -> CheckResult {
        for (name, check) in &self.fields {
            check.check(object.get(name)).map_err(|v| v.within(name))?;
        }
        Ok(())
    }
}

// =============================================================================
// Logical combinators
// =============================================================================

/// All checks must pass; stops at the first failure
pub fn and(checks: Vec<Check>) -> Check {
    Check::new(move |value| {
        for check in &checks {
            check.check(value)?;
        }
        Ok(())
    })
}

/// At least one check must pass; otherwise every branch's message is reported
pub fn or(checks: Vec<Check>) -> Check {
    Check::new(move |value| {
        let mut failures = Vec::with_capacity(checks.len());
        for check in &checks {
            match check.check(value) {
                Ok(()) => return Ok(()),
                Err(v) => failures.push(v),
            }
        }
        let field = failures.iter().find_map(|v| v.field.clone());
        let message = failures
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(" OR ");
        Err(Violation { field, message })
    })
}

/// Absent (or null) values pass without running `check`
pub fn if_exists(check: Check) -> Check {
    Check::new(move |value| match present(value) {
        Some(v) => check.check(Some(v)),
        None => Ok(()),
    })
}

/// Value must not be supplied at all
pub fn absent() -> Check {
    Check::new(|value| match value {
        None => Ok(()),
        Some(_) => Err(Violation::new("is a server-assigned field and must not be supplied")),
    })
}

// =============================================================================
// Type predicates
// =============================================================================

pub fn string() -> Check {
    Check::new(|value| match required(value)? {
        Value::String(_) => Ok(()),
        _ => Err(Violation::new("should be a string")),
    })
}

pub fn number() -> Check {
    Check::new(|value| match required(value)? {
        Value::Number(_) => Ok(()),
        _ => Err(Violation::new("should be a number")),
    })
}

pub fn boolean() -> Check {
    Check::new(|value| match required(value)? {
        Value::Bool(_) => Ok(()),
        _ => Err(Violation::new("should be a boolean")),
    })
}

pub fn array() -> Check {
    Check::new(|value| match required(value)? {
        Value::Array(_) => Ok(()),
        _ => Err(Violation::new("should be an array")),
    })
}

pub fn object() -> Check {
    Check::new(|value| match required(value)? {
        Value::Object(_) => Ok(()),
        _ => Err(Violation::new("should be an object")),
    })
}

/// ISO-8601 timestamp with an explicit offset or `Z`
pub fn iso_datetime() -> Check {
    Check::new(|value| match required(value)? {
        Value::String(s) if parse_time(s).is_some() => Ok(()),
        _ => Err(Violation::new("should be an ISO-8601 datetime with a timezone")),
    })
}

/// Local device time without an offset
pub fn device_time() -> Check {
    Check::new(|value| match required(value)? {
        Value::String(s) if parse_device_time(s).is_some() => Ok(()),
        _ => Err(Violation::new("should be a local datetime of the form YYYY-MM-DDThh:mm:ss")),
    })
}

// =============================================================================
// Membership and comparison
// =============================================================================

/// Value must equal one of `allowed` (the `in` combinator)
pub fn one_of(allowed: &[&str]) -> Check {
    let allowed: Vec<String> = allowed.iter().map(|s| s.to_string()).collect();
    Check::new(move |value| {
        let v = required(value)?;
        if v.as_str().map(|s| allowed.iter().any(|a| a == s)).unwrap_or(false) {
            Ok(())
        } else {
            Err(Violation::new(format!("should be one of [{}]", allowed.join(", "))))
        }
    })
}

pub fn equals(expected: Value) -> Check {
    Check::new(move |value| {
        if present(value) == Some(&expected) {
            Ok(())
        } else {
            Err(Violation::new(format!("should be {}", expected)))
        }
    })
}

fn compare(label: &'static str, bound: f64, ok: fn(f64, f64) -> bool) -> Check {
    Check::new(move |value| {
        let n = required(value)?
            .as_f64()
            .ok_or_else(|| Violation::new("should be a number"))?;
        if ok(n, bound) {
            Ok(())
        } else {
            Err(Violation::new(format!("should be {} {}", label, bound)))
        }
    })
}

pub fn greater_than(bound: f64) -> Check {
    compare(">", bound, |n, b| n > b)
}

pub fn greater_or_equal(bound: f64) -> Check {
    compare(">=", bound, |n, b| n >= b)
}

pub fn less_than(bound: f64) -> Check {
    compare("<", bound, |n, b| n < b)
}

pub fn less_or_equal(bound: f64) -> Check {
    compare("<=", bound, |n, b| n <= b)
}

/// Inclusive numeric range
pub fn in_range(low: f64, high: f64) -> Check {
    and(vec![number(), greater_or_equal(low), less_or_equal(high)])
}

/// Shorthand used by most schemas: a number that is at least zero
pub fn non_negative() -> Check {
    and(vec![number(), greater_or_equal(0.0)])
}

// =============================================================================
// Nested structures
// =============================================================================

/// Validate a nested object, reporting failures as `label.field`
pub fn ensure_schema(label: &str, schema: FieldSchema) -> Check {
    let label = label.to_string();
    Check::new(move |value| {
        let object = match required(value).map_err(|v| v.prefixed(&label))? {
            Value::Object(o) => o,
            _ => return Err(Violation::new("should be an object").prefixed(&label)),
        };
        schema.validate(object).map_err(|v| v.prefixed(&label))
    })
}

/// Every element of an array must pass `item`
pub fn array_of(item: Check) -> Check {
    Check::new(move |value| {
        let items = match required(value)? {
            Value::Array(items) => items,
            _ => return Err(Violation::new("should be an array")),
        };
        for (index, element) in items.iter().enumerate() {
            item.check(Some(element)).map_err(|v| Violation {
                field: v.field,
                message: format!("[{}] {}", index, v.message),
            })?;
        }
        Ok(())
    })
}

/// Every value of an object keyed by arbitrary names must pass `item`
pub fn object_values(item: Check) -> Check {
    Check::new(move |value| {
        let map = match required(value)? {
            Value::Object(map) => map,
            _ => return Err(Violation::new("should be an object")),
        };
        for (key, element) in map {
            item.check(Some(element)).map_err(|v| v.prefixed(key))?;
        }
        Ok(())
    })
}

// =============================================================================
// Base schema
// =============================================================================

/// Checks applied to every datum regardless of type
pub fn base_schema() -> FieldSchema {
    FieldSchema::new()
        .field("type", string())
        .field("time", iso_datetime())
        .field("timezoneOffset", if_exists(in_range(-1440.0, 1440.0)))
        .field("deviceTime", if_exists(device_time()))
        .field("conversionOffset", if_exists(number()))
        .field("deviceId", string())
        .field("source", if_exists(string()))
        .field("uploadId", if_exists(string()))
        .field("_active", absent())
        .field("_sequenceId", absent())
}
