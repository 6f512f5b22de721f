//! Bolus wizard and food entries

use serde_json::Value;

use super::{bolus, group_of, reference, TransformContext};
use crate::datum::{fields, get_str, Datum};
use crate::error::{IngestError, Result};
use crate::registry::{normalize_time, DatumType, Transform, TypeRegistry, TypeSpec};
use crate::units::{self, MG_DL, MMOL_L};
use crate::validation::{if_exists, non_negative, number, object, string, FieldSchema};

const ID_FIELDS: [&str; 3] = ["type", "deviceId", "time"];

/// Blood glucose fields of a wizard record that follow its `units`
const BG_FIELDS: [&str; 2] = ["bgInput", "insulinSensitivity"];
const BG_TARGET_KEYS: [&str; 4] = ["target", "low", "high", "range"];

pub(crate) fn register(registry: &mut TypeRegistry) -> Result<()> {
    registry.register(
        DatumType::Wizard,
        TypeSpec::new(
            FieldSchema::new()
                .field("units", string())
                .field("bgInput", if_exists(number()))
                .field("insulinSensitivity", if_exists(number()))
                .field("carbInput", if_exists(non_negative()))
                .field("insulinCarbRatio", if_exists(non_negative()))
                .field("insulinOnBoard", if_exists(number()))
                .field("bgTarget", if_exists(object()))
                .field("recommended", if_exists(object()))
                .field("bolus", if_exists(reference())),
            &ID_FIELDS,
            Transform::Wizard,
        ),
    )?;
    registry.register(
        DatumType::Food,
        TypeSpec::new(
            FieldSchema::new().field("carbs", non_negative()),
            &ID_FIELDS,
            Transform::Identity,
        ),
    )
}

/// Convert wizard glucose inputs to mmol/L. An inline bolus is emitted as a
/// datum of its own, ahead of the wizard, which keeps only its id.
pub(crate) async fn normalize_wizard(mut datum: Datum, ctx: &TransformContext<'_>) -> Result<Vec<Datum>> {
    let normalized = units::normalize_field("units", datum.get("units"))?;
    if normalized == MG_DL {
        for field in BG_FIELDS {
            if let Some(value) = datum.get_mut(field) {
                units::convert_value(value);
            }
        }
        if let Some(target) = datum.get_mut("bgTarget") {
            units::convert_nested(target, &BG_TARGET_KEYS);
        }
    }
    datum.insert("units".to_string(), Value::from(MMOL_L));

    let inline = match datum.get("bolus") {
        Some(Value::Object(inline)) => Some(inline.clone()),
        _ => None,
    };
    let mut outputs = Vec::new();
    if let Some(inline) = inline {
        let id = ctx.reference_id("bolus", &Value::Object(inline.clone()), &group_of(&datum)?)?;
        // an inline datum that already carries an id is only a reference
        if !inline.contains_key(fields::ID) {
            outputs = bolus::complete(inline_bolus(inline, &datum, ctx)?, ctx).await?;
        }
        datum.insert("bolus".to_string(), Value::from(id));
    }
    outputs.push(datum);
    Ok(outputs)
}

/// An inline bolus validated on its own and owned like the wizard carrying it
fn inline_bolus(mut bolus: Datum, wizard: &Datum, ctx: &TransformContext<'_>) -> Result<Datum> {
    if get_str(&bolus, fields::TYPE) != Some("bolus") {
        return Err(IngestError::invalid("bolus", "should be a bolus when given inline"));
    }
    for owner in [fields::GROUP_ID, fields::USER_ID] {
        if let Some(value) = wizard.get(owner) {
            bolus.insert(owner.to_string(), value.clone());
        }
    }
    ctx.registry.validate(&bolus)?;
    normalize_time(&mut bolus)?;
    Ok(bolus)
}
