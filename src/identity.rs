//! Datum identity and cross-system deduplication hashes
//!
//! Two independent schemes:
//!
//! - **Storage identity**: `id` is a SHA-1 over the type's ordered id fields and
//!   `_id` is the same digest over `(id, groupId)`. Both are base32hex, lowercase,
//!   32 characters. Re-ingesting a datum recomputes the same `_id`, which is what
//!   makes storage idempotent.
//! - **Dedup hash**: a SHA-256 over a separately registered field list, base64
//!   encoded. It has to match hashes computed by another platform byte for byte,
//!   so field order, time truncation and value re-quantization are fixed.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use data_encoding::BASE32HEX_NOPAD;
use serde_json::Value;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::datum::{fields, parse_time, Datum};
use crate::error::{IngestError, Result};
use crate::units::GLUCOSE_MGDL_PER_MMOLL;

/// Fields every dedup hash starts with, in this order
pub const DEDUP_PREFIX: [&str; 4] = [fields::USER_ID, fields::DEVICE_ID, fields::TIME, fields::TYPE];

/// Longest glucose value string hashed verbatim
const MAX_VERBATIM_VALUE_LEN: usize = 7;

/// String form of a field as it enters a hash
fn field_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// SHA-1 over each part followed by `_`, base32hex encoded
pub fn generate_id<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update(b"_");
    }
    BASE32HEX_NOPAD.encode(&hasher.finalize()).to_ascii_lowercase()
}

/// Primary id from the datum's declared id fields
pub fn datum_id(datum: &Datum, id_fields: &[&str]) -> Result<String> {
    let mut parts = Vec::with_capacity(id_fields.len());
    for field in id_fields {
        let part = datum
            .get(*field)
            .and_then(field_string)
            .ok_or_else(|| IngestError::invalid(*field, "is required to generate an id"))?;
        parts.push(part);
    }
    Ok(generate_id(&parts))
}

/// Storage key scoped to a group
pub fn internal_id(id: &str, group_id: &str) -> String {
    generate_id(&[id, group_id])
}

/// Set `id` and `_id` on a datum whose `_groupId` is already present
pub fn attach_ids(datum: &mut Datum, id_fields: &[&str]) -> Result<()> {
    let group_id = datum
        .get(fields::GROUP_ID)
        .and_then(Value::as_str)
        .ok_or_else(|| IngestError::invalid(fields::GROUP_ID, "must be set before ids are generated"))?
        .to_string();
    let id = datum_id(datum, id_fields)?;
    datum.insert(fields::INTERNAL_ID.to_string(), Value::from(internal_id(&id, &group_id)));
    datum.insert(fields::ID.to_string(), Value::from(id));
    Ok(())
}

/// Fields hashed for one type, beyond the common prefix
#[derive(Debug, Clone)]
struct DedupFields {
    extras: Vec<String>,
    /// Glucose values get re-quantized before hashing
    glucose_value: bool,
}

/// Per-type dedup hash field lists
#[derive(Debug, Clone, Default)]
pub struct DedupHashRegistry {
    types: HashMap<String, DedupFields>,
}

impl DedupHashRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The field lists reconciled with the external platform
    pub fn standard() -> Result<Self> {
        let mut registry = Self::new();
        registry.register_glucose("cbg", &["units", "value"])?;
        registry.register_glucose("smbg", &["units", "value"])?;
        registry.register("bloodKetone", &["units", "value"])?;
        registry.register("basal", &["deliveryType", "duration"])?;
        registry.register("bolus", &["subType", "normal", "extended"])?;
        registry.register("deviceEvent", &["subType"])?;
        registry.register("wizard", &["bolus"])?;
        registry.register("food", &[])?;
        registry.register("pumpSettings", &[])?;
        registry.register("cgmSettings", &[])?;
        Ok(registry)
    }

    pub fn register(&mut self, datum_type: &str, extras: &[&str]) -> Result<()> {
        self.insert(datum_type, extras, false)
    }

    pub fn register_glucose(&mut self, datum_type: &str, extras: &[&str]) -> Result<()> {
        self.insert(datum_type, extras, true)
    }

    fn insert(&mut self, datum_type: &str, extras: &[&str], glucose_value: bool) -> Result<()> {
        if self.types.contains_key(datum_type) {
            return Err(IngestError::Registration(format!(
                "dedup hash fields already registered for type {}",
                datum_type
            )));
        }
        self.types.insert(
            datum_type.to_string(),
            DedupFields {
                extras: extras.iter().map(|s| s.to_string()).collect(),
                glucose_value,
            },
        );
        Ok(())
    }

    pub fn is_registered(&self, datum_type: &str) -> bool {
        self.types.contains_key(datum_type)
    }

    /// Ordered field list hashed for `datum_type`
    pub fn fields_for(&self, datum_type: &str) -> Option<Vec<String>> {
        self.types.get(datum_type).map(|spec| {
            DEDUP_PREFIX
                .iter()
                .map(|s| s.to_string())
                .chain(spec.extras.iter().cloned())
                .collect()
        })
    }

    /// Compute the dedup hash; `None` when the type has no registered fields.
    /// Optional extras that are absent are skipped; prefix fields are required.
    pub fn hash(&self, datum: &Datum) -> Result<Option<String>> {
        let datum_type = datum.get(fields::TYPE).and_then(Value::as_str).unwrap_or_default();
        let spec = match self.types.get(datum_type) {
            Some(spec) => spec,
            None => return Ok(None),
        };

        let mut parts = Vec::with_capacity(DEDUP_PREFIX.len() + spec.extras.len());
        for field in DEDUP_PREFIX {
            let raw = datum
                .get(field)
                .and_then(field_string)
                .ok_or_else(|| IngestError::invalid(field, "is required to generate a dedup hash"))?;
            parts.push(if field == fields::TIME { truncate_time(&raw)? } else { raw });
        }
        for field in &spec.extras {
            let raw = match datum.get(field).and_then(field_string) {
                Some(raw) => raw,
                None => continue,
            };
            if spec.glucose_value && field == "value" {
                parts.push(requantize_glucose(&raw)?);
            } else {
                parts.push(raw);
            }
        }
        Ok(Some(generate_dedup_hash(&parts)))
    }
}

/// SHA-256 over each part followed by `|`, standard base64
pub fn generate_dedup_hash<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update(b"|");
    }
    BASE64.encode(hasher.finalize())
}

/// Whole seconds, `Z` suffixed
fn truncate_time(raw: &str) -> Result<String> {
    let time = parse_time(raw)
        .ok_or_else(|| IngestError::invalid(fields::TIME, "must be an ISO-8601 datetime with a timezone"))?;
    Ok(time.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

/// Long values are pushed through mg/dL and back at 5 decimal places
fn requantize_glucose(raw: &str) -> Result<String> {
    if raw.len() <= MAX_VERBATIM_VALUE_LEN {
        return Ok(raw.to_string());
    }
    let value: f64 = raw
        .parse()
        .map_err(|_| IngestError::invalid("value", "should be a number"))?;
    let mgdl = (value * GLUCOSE_MGDL_PER_MMOLL + 0.5).floor();
    Ok(format!("{:.5}", mgdl / GLUCOSE_MGDL_PER_MMOLL))
}
