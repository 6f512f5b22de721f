//! Device events
//!
//! Most sub-types are stored as reported. Pump suspends and resumes arrive as
//! two separate `status` events; a resume that points at its suspend is folded
//! into it, giving one suspend with a measured duration.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::{group_of, reference, with_id, TransformContext};
use crate::datum::{annotate, fields, get_str, millis, remove_annotation, time_of, Datum};
use crate::error::Result;
use crate::registry::{DatumType, Transform, TypeRegistry, TypeSpec};
use crate::validation::{
    device_time, ensure_schema, if_exists, non_negative, number, object, one_of, string, FieldSchema,
};

pub const UNKNOWN_PREVIOUS: &str = "status/unknown-previous";
pub const INCOMPLETE_TUPLE: &str = "status/incomplete-tuple";

const SUSPENDED: &str = "suspended";
const RESUMED: &str = "resumed";

const ID_FIELDS: [&str; 4] = ["type", "subType", "deviceId", "time"];

fn status_spec() -> TypeSpec {
    TypeSpec::new(
        FieldSchema::new()
            .field("status", one_of(&[SUSPENDED, RESUMED]))
            .field("reason", if_exists(object()))
            .field("payload", if_exists(object()))
            .field("duration", if_exists(non_negative()))
            .field("previous", if_exists(reference())),
        &ID_FIELDS,
        Transform::StatusTuple,
    )
}

fn calibration_spec() -> TypeSpec {
    TypeSpec::new(
        FieldSchema::new().field("value", number()).field("units", string()),
        &ID_FIELDS,
        Transform::GlucoseUnits,
    )
}

pub(crate) fn register(registry: &mut TypeRegistry) -> Result<()> {
    let sub_types = ["status", "calibration", "alarm", "reservoirChange", "prime", "timeChange"];
    registry.register_common(
        DatumType::DeviceEvent,
        FieldSchema::new().field("subType", one_of(&sub_types)),
    )?;
    registry.register_sub_type(DatumType::DeviceEvent, "status", status_spec())?;
    registry.register_sub_type(DatumType::DeviceEvent, "calibration", calibration_spec())?;
    registry.register_sub_type(
        DatumType::DeviceEvent,
        "alarm",
        TypeSpec::new(
            FieldSchema::new()
                .field("alarmType", string())
                .field("status", if_exists(reference())),
            &ID_FIELDS,
            Transform::Identity,
        ),
    )?;
    registry.register_sub_type(
        DatumType::DeviceEvent,
        "reservoirChange",
        TypeSpec::new(
            FieldSchema::new().field("status", if_exists(reference())),
            &ID_FIELDS,
            Transform::Identity,
        ),
    )?;
    registry.register_sub_type(
        DatumType::DeviceEvent,
        "prime",
        TypeSpec::new(
            FieldSchema::new()
                .field("primeTarget", one_of(&["cannula", "tubing"]))
                .field("volume", if_exists(non_negative())),
            &ID_FIELDS,
            Transform::Identity,
        ),
    )?;
    registry.register_sub_type(
        DatumType::DeviceEvent,
        "timeChange",
        TypeSpec::new(
            FieldSchema::new().field(
                "change",
                ensure_schema(
                    "change",
                    FieldSchema::new()
                        .field("from", device_time())
                        .field("to", device_time())
                        .field("agent", if_exists(string())),
                ),
            ),
            &ID_FIELDS,
            Transform::Identity,
        ),
    )?;

    // Legacy alias kept for older uploaders
    registry.register_common(
        DatumType::DeviceMeta,
        FieldSchema::new().field("subType", one_of(&["status", "calibration"])),
    )?;
    registry.register_sub_type(DatumType::DeviceMeta, "status", status_spec())?;
    registry.register_sub_type(DatumType::DeviceMeta, "calibration", calibration_spec())
}

/// Pair a status event with the one it refers to
pub(crate) async fn pair_status(mut datum: Datum, ctx: &TransformContext<'_>) -> Result<Vec<Datum>> {
    let previous = datum.remove(fields::PREVIOUS);
    let status = get_str(&datum, "status").unwrap_or(SUSPENDED).to_string();

    let reference = match previous {
        Some(reference) => reference,
        None => {
            let code = if status == RESUMED { UNKNOWN_PREVIOUS } else { INCOMPLETE_TUPLE };
            annotate(&mut datum, code, Map::new());
            return Ok(vec![datum]);
        }
    };

    let group_id = group_of(&datum)?;
    let (previous_id, found) = ctx.fetch_reference(fields::PREVIOUS, &reference, &group_id).await?;
    let expected = if status == RESUMED { SUSPENDED } else { RESUMED };
    let stored = match found {
        Some(stored) if get_str(&stored, "status") == Some(expected) => stored,
        _ => {
            annotate(&mut datum, UNKNOWN_PREVIOUS, with_id(&previous_id));
            if status == SUSPENDED {
                annotate(&mut datum, INCOMPLETE_TUPLE, Map::new());
            }
            return Ok(vec![datum]);
        }
    };

    if status == SUSPENDED {
        // The resume is already stored; this suspend stays open until a resume names it
        annotate(&mut datum, INCOMPLETE_TUPLE, Map::new());
        return Ok(vec![datum]);
    }

    let corrected = close_suspend(&stored, &datum, time_of(&datum)?)?;
    if corrected == stored {
        return Ok(Vec::new());
    }
    Ok(vec![corrected])
}

/// The stored suspend completed by `resume`
fn close_suspend(suspend: &Datum, resume: &Datum, resumed_at: DateTime<Utc>) -> Result<Datum> {
    let mut corrected = suspend.clone();
    let duration = (resumed_at - time_of(suspend)?).num_milliseconds().max(0);
    corrected.insert("duration".to_string(), millis(duration));

    for field in ["reason", "payload"] {
        if let Some(merged) = overlay(suspend.get(field), resume.get(field)) {
            corrected.insert(field.to_string(), merged);
        }
    }
    remove_annotation(&mut corrected, INCOMPLETE_TUPLE);
    Ok(corrected)
}

/// Keys of `base` with those of `top` laid over them
fn overlay(base: Option<&Value>, top: Option<&Value>) -> Option<Value> {
    let mut merged = match base {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    if let Some(Value::Object(map)) = top {
        for (key, value) in map {
            merged.insert(key.clone(), value.clone());
        }
    }
    if merged.is_empty() {
        None
    } else {
        Some(Value::Object(merged))
    }
}
