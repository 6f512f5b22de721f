//! Notes
//!
//! A note may be attached to another event with `reference`. It is then filed
//! at the referenced event's time; the time it was written moves to
//! `displayTime`.

use serde_json::Value;

use super::{group_of, reference, TransformContext};
use crate::datum::{fields, Datum};
use crate::error::{IngestError, Result};
use crate::registry::{DatumType, Transform, TypeRegistry, TypeSpec};
use crate::validation::{if_exists, iso_datetime, string, FieldSchema};

/// `time` moves to the referenced event, so the text keeps notes on one event apart
const ID_FIELDS: [&str; 4] = ["type", "deviceId", "time", "text"];

pub(crate) fn register(registry: &mut TypeRegistry) -> Result<()> {
    registry.register(
        DatumType::Note,
        TypeSpec::new(
            FieldSchema::new()
                .field("text", string())
                .field("shortText", if_exists(string()))
                .field("creatorId", if_exists(string()))
                .field("reference", if_exists(reference()))
                .field("displayTime", if_exists(iso_datetime())),
            &ID_FIELDS,
            Transform::NoteReference,
        ),
    )
}

pub(crate) async fn resolve_reference(mut datum: Datum, ctx: &TransformContext<'_>) -> Result<Vec<Datum>> {
    let reference = match datum.get("reference") {
        Some(Value::Null) | None => return Ok(vec![datum]),
        Some(reference) => reference.clone(),
    };
    let group_id = group_of(&datum)?;
    let (id, found) = ctx.fetch_reference("reference", &reference, &group_id).await?;
    let target = found.ok_or_else(|| IngestError::not_found("Referenced datum", id.clone()))?;
    let target_time = target
        .get(fields::TIME)
        .cloned()
        .ok_or_else(|| IngestError::invalid("reference", "points at a datum without a time"))?;

    if let Some(written) = datum.insert(fields::TIME.to_string(), target_time) {
        datum.insert("displayTime".to_string(), written);
    }
    datum.insert("reference".to_string(), Value::from(id));
    Ok(vec![datum])
}

#[cfg(test)]
mod tests {
    use crate::types::testing::{run, stored, FakeLookup};
    use serde_json::json;

    fn note(reference: serde_json::Value) -> serde_json::Value {
        json!({
            "type": "note",
            "text": "pizza, went high",
            "reference": reference,
            "deviceId": "blip",
            "time": "2014-01-01T20:15:00+01:00",
            "_groupId": "g1"
        })
    }

    #[tokio::test]
    async fn test_reference_moves_note() {
        let meal = stored(json!({
            "type": "food", "carbs": 80,
            "deviceId": "pump-1", "time": "2014-01-01T18:00:00Z", "_groupId": "g1"
        }));
        let lookup = FakeLookup::with(vec![meal.clone()]);

        let out = run(&lookup, note(meal["id"].clone())).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["time"], "2014-01-01T18:00:00.000Z");
        assert_eq!(out[0]["displayTime"], "2014-01-01T19:15:00.000Z");
        assert_eq!(out[0]["reference"], meal["id"]);
    }

    #[tokio::test]
    async fn test_inline_reference_canonicalized() {
        let meal = stored(json!({
            "type": "food", "carbs": 80,
            "deviceId": "pump-1", "time": "2014-01-01T18:00:00Z", "_groupId": "g1"
        }));
        let lookup = FakeLookup::with(vec![meal.clone()]);
        let inline = json!({"type": "food", "deviceId": "pump-1", "time": "2014-01-01T18:00:00Z"});

        let out = run(&lookup, note(inline)).await.unwrap();
        assert_eq!(out[0]["reference"], meal["id"]);
    }

    #[tokio::test]
    async fn test_notes_on_one_event_keep_distinct_ids() {
        let meal = stored(json!({
            "type": "food", "carbs": 80,
            "deviceId": "pump-1", "time": "2014-01-01T18:00:00Z", "_groupId": "g1"
        }));
        let lookup = FakeLookup::with(vec![meal.clone()]);

        let first = run(&lookup, note(meal["id"].clone())).await.unwrap();
        let mut other = note(meal["id"].clone());
        other["text"] = json!("bolused late");
        let second = run(&lookup, other).await.unwrap();

        assert_eq!(first[0]["time"], second[0]["time"]);
        assert_ne!(first[0]["_id"], second[0]["_id"]);
    }

    #[tokio::test]
    async fn test_unresolvable_reference() {
        let err = run(&FakeLookup::default(), note(json!("missing"))).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_note_without_reference() {
        let out = run(&FakeLookup::default(), note(serde_json::Value::Null)).await.unwrap();
        assert_eq!(out[0]["time"], "2014-01-01T19:15:00.000Z");
        assert!(!out[0].contains_key("displayTime"));
    }
}
