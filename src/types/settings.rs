//! Pump and CGM settings snapshots
//!
//! Settings carry glucose values inside schedule arrays, either as a single
//! array or as a map of named schedules. Both shapes are accepted and converted
//! in place.

use serde_json::Value;

use crate::datum::Datum;
use crate::error::Result;
use crate::registry::{DatumType, Transform, TypeRegistry, TypeSpec};
use crate::units::{self, MG_DL, MMOL_L};
use crate::validation::{
    array_of, boolean, ensure_schema, if_exists, non_negative, number, object_values, or, string, Check,
    FieldSchema,
};

const ID_FIELDS: [&str; 3] = ["type", "deviceId", "time"];

const SENSITIVITY_KEYS: [&str; 1] = ["amount"];
const BG_TARGET_KEYS: [&str; 4] = ["target", "low", "high", "range"];
const ALERTS: [&str; 2] = ["highAlerts", "lowAlerts"];

fn segment(schema: FieldSchema) -> Check {
    ensure_schema("segment", schema.field("start", non_negative()))
}

/// A schedule given either as one array or as a map of named arrays
fn schedule(item: Check) -> Check {
    or(vec![array_of(item.clone()), object_values(array_of(item))])
}

fn alert() -> Check {
    ensure_schema(
        "alert",
        FieldSchema::new()
            .field("enabled", boolean())
            .field("level", if_exists(number()))
            .field("snooze", if_exists(non_negative())),
    )
}

pub(crate) fn register(registry: &mut TypeRegistry) -> Result<()> {
    registry.register(
        DatumType::PumpSettings,
        TypeSpec::new(
            FieldSchema::new()
                .field("activeSchedule", string())
                .field(
                    "units",
                    ensure_schema(
                        "units",
                        FieldSchema::new().field("carb", string()).field("bg", string()),
                    ),
                )
                .field(
                    "basalSchedules",
                    if_exists(object_values(array_of(segment(
                        FieldSchema::new().field("rate", non_negative()),
                    )))),
                )
                .field(
                    "carbRatio",
                    if_exists(schedule(segment(FieldSchema::new().field("amount", non_negative())))),
                )
                .field(
                    "insulinSensitivity",
                    if_exists(schedule(segment(FieldSchema::new().field("amount", number())))),
                )
                .field("bgTarget", if_exists(schedule(segment(FieldSchema::new())))),
            &ID_FIELDS,
            Transform::PumpSettingsUnits,
        ),
    )?;
    registry.register(
        DatumType::CgmSettings,
        TypeSpec::new(
            FieldSchema::new()
                .field("units", string())
                .field("transmitterId", if_exists(string()))
                .field("highAlerts", if_exists(alert()))
                .field("lowAlerts", if_exists(alert())),
            &ID_FIELDS,
            Transform::CgmSettingsUnits,
        ),
    )
}

pub(crate) fn normalize_pump_settings(mut datum: Datum) -> Result<Vec<Datum>> {
    let bg_units = units::normalize_field("units.bg", datum.get("units").and_then(|u| u.get("bg")))?;
    if bg_units == MG_DL {
        if let Some(sensitivity) = datum.get_mut("insulinSensitivity") {
            units::convert_nested(sensitivity, &SENSITIVITY_KEYS);
        }
        if let Some(target) = datum.get_mut("bgTarget") {
            units::convert_nested(target, &BG_TARGET_KEYS);
        }
    }
    if let Some(Value::Object(unit_map)) = datum.get_mut("units") {
        unit_map.insert("bg".to_string(), Value::from(MMOL_L));
    }
    Ok(vec![datum])
}

pub(crate) fn normalize_cgm_settings(mut datum: Datum) -> Result<Vec<Datum>> {
    let bg_units = units::normalize_field("units", datum.get("units"))?;
    if bg_units == MG_DL {
        for field in ALERTS {
            if let Some(level) = datum.get_mut(field).and_then(|a| a.get_mut("level")) {
                units::convert_value(level);
            }
        }
    }
    datum.insert("units".to_string(), Value::from(MMOL_L));
    Ok(vec![datum])
}
