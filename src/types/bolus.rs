//! Boluses
//!
//! A pump may report a bolus when it starts and again once it finishes (or is
//! cancelled). The completion record points back at the start with `previous`;
//! it only ever corrects the stored bolus and is never stored itself.

use serde_json::Value;

use super::{group_of, reference, TransformContext};
use crate::datum::{fields, get_f64, require_str, Datum};
use crate::error::{IngestError, Result};
use crate::registry::{DatumType, Transform, TypeRegistry, TypeSpec};
use crate::validation::{if_exists, non_negative, one_of, FieldSchema};

const ID_FIELDS: [&str; 4] = ["type", "subType", "deviceId", "time"];

/// Delivered-amount fields a completion may correct, per sub-type
fn completion_fields(sub_type: &str) -> &'static [&'static str] {
    match sub_type {
        "normal" => &["normal"],
        "square" => &["extended", "duration"],
        "dual/square" => &["normal", "extended", "duration"],
        _ => &[],
    }
}

fn expected_field(field: &str) -> String {
    let mut chars = field.chars();
    match chars.next() {
        Some(first) => format!("expected{}{}", first.to_ascii_uppercase(), chars.as_str()),
        None => String::new(),
    }
}

fn amounts(fields: &[&str]) -> FieldSchema {
    fields.iter().fold(FieldSchema::new(), |schema, field| {
        schema
            .field(field, non_negative())
            .field(&expected_field(field), if_exists(non_negative()))
    })
}

pub(crate) fn register(registry: &mut TypeRegistry) -> Result<()> {
    registry.register_common(
        DatumType::Bolus,
        FieldSchema::new()
            .field("subType", one_of(&["normal", "square", "dual/square"]))
            .field("previous", if_exists(reference())),
    )?;
    for sub_type in ["normal", "square", "dual/square"] {
        registry.register_sub_type(
            DatumType::Bolus,
            sub_type,
            TypeSpec::new(amounts(completion_fields(sub_type)), &ID_FIELDS, Transform::BolusCompletion),
        )?;
    }
    Ok(())
}

/// Fold a completion record into the bolus it refers to
pub(crate) async fn complete(mut datum: Datum, ctx: &TransformContext<'_>) -> Result<Vec<Datum>> {
    let previous = match datum.remove(fields::PREVIOUS) {
        Some(previous) => previous,
        None => return Ok(vec![datum]),
    };
    let group_id = group_of(&datum)?;
    let (previous_id, found) = ctx.fetch_reference(fields::PREVIOUS, &previous, &group_id).await?;
    let mut prior = found.ok_or_else(|| IngestError::not_found("Previous bolus", previous_id))?;

    let mut changed = false;
    for field in completion_fields(require_str(&datum, "subType")?) {
        let delivered = match datum.get(*field) {
            Some(value) => value,
            None => continue,
        };
        if get_f64(&prior, field) == delivered.as_f64() {
            continue;
        }
        let expected = expected_field(field);
        if !prior.contains_key(&expected) {
            let reported = prior.get(*field).cloned().unwrap_or(Value::Null);
            prior.insert(expected, reported);
        }
        prior.insert(field.to_string(), delivered.clone());
        changed = true;
    }

    Ok(if changed { vec![prior] } else { Vec::new() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::testing::{run, stored, FakeLookup};
    use serde_json::json;

    fn dual(normal: f64, extended: f64, duration: i64) -> Value {
        json!({
            "type": "bolus",
            "subType": "dual/square",
            "normal": normal,
            "extended": extended,
            "duration": duration,
            "deviceId": "pump-1",
            "time": "2014-01-01T08:00:00.000Z",
            "_groupId": "g1"
        })
    }

    #[test]
    fn test_expected_field_names() {
        assert_eq!(expected_field("normal"), "expectedNormal");
        assert_eq!(expected_field("duration"), "expectedDuration");
    }

    #[tokio::test]
    async fn test_bolus_without_previous_passes_through() {
        let out = run(&FakeLookup::default(), dual(2.0, 1.0, 3_600_000)).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["subType"], "dual/square");
    }

    #[tokio::test]
    async fn test_cancelled_bolus_corrects_prior() {
        let prior = stored(dual(2.0, 1.0, 3_600_000));
        let lookup = FakeLookup::with(vec![prior.clone()]);

        let mut completion = dual(2.0, 0.4, 1_440_000);
        completion["previous"] = prior["id"].clone();

        let out = run(&lookup, completion).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["id"], prior["id"]);
        assert_eq!(out[0]["extended"], json!(0.4));
        assert_eq!(out[0]["expectedExtended"], json!(1.0));
        assert_eq!(out[0]["duration"], 1_440_000);
        assert_eq!(out[0]["expectedDuration"], 3_600_000);
        assert!(!out[0].contains_key("expectedNormal"));
    }

    #[tokio::test]
    async fn test_identical_completion_is_empty() {
        let prior = stored(dual(2.0, 1.0, 3_600_000));
        let lookup = FakeLookup::with(vec![prior.clone()]);

        let mut completion = dual(2.0, 1.0, 3_600_000);
        completion["previous"] = Value::Object(prior);

        assert!(run(&lookup, completion).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_previous_bolus() {
        let mut completion = dual(2.0, 1.0, 3_600_000);
        completion["previous"] = json!("nope");
        let err = run(&FakeLookup::default(), completion).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_square_requires_duration() {
        let raw = json!({
            "type": "bolus", "subType": "square", "extended": 1.5,
            "deviceId": "pump-1", "time": "2014-01-01T08:00:00Z", "_groupId": "g1"
        });
        let err = run(&FakeLookup::default(), raw).await.unwrap_err();
        assert_eq!(err.error_field(), Some("duration"));
    }
}
