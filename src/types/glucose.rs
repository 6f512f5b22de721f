//! Glucose and ketone readings

use serde_json::Value;

use crate::datum::Datum;
use crate::error::{IngestError, Result};
use crate::registry::{DatumType, Transform, TypeRegistry, TypeSpec};
use crate::units::{self, MG_DL, MMOL_L};
use crate::validation::{if_exists, non_negative, one_of, string, FieldSchema};

const ID_FIELDS: [&str; 3] = ["type", "deviceId", "time"];

fn reading() -> FieldSchema {
    FieldSchema::new()
        .field("value", non_negative())
        .field("units", string())
}

pub(crate) fn register(registry: &mut TypeRegistry) -> Result<()> {
    registry.register(DatumType::Cbg, TypeSpec::new(reading(), &ID_FIELDS, Transform::GlucoseUnits))?;
    registry.register(
        DatumType::Smbg,
        TypeSpec::new(
            reading().field("subType", if_exists(one_of(&["manual", "linked"]))),
            &ID_FIELDS,
            Transform::GlucoseUnits,
        ),
    )?;
    registry.register(
        DatumType::BloodKetone,
        TypeSpec::new(reading(), &ID_FIELDS, Transform::KetoneUnits),
    )
}

/// Normalize `units` and, for mg/dL, convert `value` to mmol/L.
/// Returns whether a conversion happened.
pub fn normalize_glucose_units(datum: &mut Datum) -> Result<bool> {
    let normalized = units::normalize_field("units", datum.get("units"))?;
    datum.insert("units".to_string(), Value::from(MMOL_L));
    if normalized != MG_DL {
        return Ok(false);
    }
    if let Some(value) = datum.get_mut("value") {
        units::convert_value(value);
    }
    Ok(true)
}

pub(crate) fn normalize_reading(mut datum: Datum) -> Result<Vec<Datum>> {
    normalize_glucose_units(&mut datum)?;
    Ok(vec![datum])
}

/// Ketones have no mg/dL form
pub(crate) fn normalize_ketone(mut datum: Datum) -> Result<Vec<Datum>> {
    match units::normalize_field("units", datum.get("units"))? {
        MMOL_L => {
            datum.insert("units".to_string(), Value::from(MMOL_L));
            Ok(vec![datum])
        }
        _ => Err(IngestError::invalid("units", format!("must be {}", MMOL_L))),
    }
}
