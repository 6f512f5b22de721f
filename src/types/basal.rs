//! Basal delivery
//!
//! Basals form a series per device: each interval runs until the next one
//! starts. A new interval can carry a `previous` reference, in which case the
//! previous interval's duration is repaired to end exactly where this one starts.
//! Without a reference the latest stored interval is only checked, and flagged
//! when the two do not line up.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

use super::{group_of, reference, with_id, TransformContext};
use crate::datum::{annotate, fields, get_f64, has_annotation, millis, number, time_of, Datum};
use crate::error::{IngestError, Result};
use crate::registry::{DatumType, Transform, TypeRegistry, TypeSpec};
use crate::store::PriorQuery;
use crate::validation::{
    ensure_schema, equals, if_exists, in_range, non_negative, one_of, string, FieldSchema,
};

pub const MISMATCHED_SERIES: &str = "basal/mismatched-series";
pub const UNKNOWN_PREVIOUS: &str = "basal/unknown-previous";

const ID_FIELDS: [&str; 4] = ["type", "deliveryType", "deviceId", "time"];

/// Longest interval a single basal record may claim, one week
pub const MAX_DURATION_MS: f64 = 604_800_000.0;

fn suppressed() -> FieldSchema {
    FieldSchema::new()
        .field("type", if_exists(equals(Value::from("basal"))))
        .field("deliveryType", one_of(&["scheduled", "temp"]))
        .field("rate", if_exists(non_negative()))
}

pub(crate) fn register(registry: &mut TypeRegistry) -> Result<()> {
    registry.register_common(
        DatumType::Basal,
        FieldSchema::new()
            .field("deliveryType", one_of(&["scheduled", "temp", "suspend"]))
            .field("duration", if_exists(in_range(0.0, MAX_DURATION_MS)))
            .field("expectedDuration", if_exists(in_range(0.0, MAX_DURATION_MS)))
            .field("previous", if_exists(reference())),
    )?;

    registry.register_sub_type(
        DatumType::Basal,
        "scheduled",
        TypeSpec::new(
            FieldSchema::new()
                .field("duration", non_negative())
                .field("rate", non_negative())
                .field("scheduleName", if_exists(string())),
            &ID_FIELDS,
            Transform::BasalSeries,
        ),
    )?;

    registry.register_sub_type(
        DatumType::Basal,
        "temp",
        TypeSpec::new(
            FieldSchema::new()
                .field("duration", non_negative())
                .field("rate", if_exists(non_negative()))
                .field("percent", if_exists(non_negative()))
                .field("suppressed", if_exists(ensure_schema("suppressed", suppressed()))),
            &ID_FIELDS,
            Transform::TempBasal,
        ),
    )?;

    registry.register_sub_type(
        DatumType::Basal,
        "suspend",
        TypeSpec::new(
            FieldSchema::new().field("suppressed", if_exists(ensure_schema("suppressed", suppressed()))),
            &ID_FIELDS,
            Transform::BasalSeries,
        ),
    )
}

/// Fill in `rate` from `percent × suppressed.rate` when it was not reported
pub(crate) fn derive_temp_rate(mut datum: Datum) -> Result<Datum> {
    if datum.get("rate").map(Value::is_number).unwrap_or(false) {
        return Ok(datum);
    }
    let percent = get_f64(&datum, "percent");
    let suppressed_rate = datum
        .get("suppressed")
        .and_then(|s| s.get("rate"))
        .and_then(Value::as_f64);
    match (percent, suppressed_rate) {
        (Some(percent), Some(rate)) => {
            datum.insert("rate".to_string(), number(percent * rate)?);
            Ok(datum)
        }
        _ => Err(IngestError::invalid(
            "rate",
            "is required unless both percent and suppressed.rate are given",
        )),
    }
}

/// Repair or check the interval that precedes `datum`
pub(crate) async fn link_series(mut datum: Datum, ctx: &TransformContext<'_>) -> Result<Vec<Datum>> {
    let previous = datum.remove(fields::PREVIOUS);
    let group_id = group_of(&datum)?;
    let start = time_of(&datum)?;

    if let Some(reference) = previous {
        let (previous_id, found) = ctx.fetch_reference(fields::PREVIOUS, &reference, &group_id).await?;
        return match found {
            Some(previous) => match repaired_duration(&previous, start)? {
                Some(corrected) => Ok(vec![corrected, datum]),
                None => Ok(vec![datum]),
            },
            None => {
                annotate(&mut datum, UNKNOWN_PREVIOUS, with_id(&previous_id));
                Ok(vec![datum])
            }
        };
    }

    let query = match PriorQuery::for_datum(&datum, start) {
        Some(query) => query,
        None => return Ok(vec![datum]),
    };
    match ctx.lookup.get_datum_before(&query).await? {
        Some(mut prior) if !ends_at(&prior, start)? && !has_annotation(&prior, MISMATCHED_SERIES) => {
            annotate(&mut prior, MISMATCHED_SERIES, Map::new());
            Ok(vec![prior, datum])
        }
        _ => Ok(vec![datum]),
    }
}

/// Previous interval with its duration cut to `next_start`, if it differs
fn repaired_duration(previous: &Datum, next_start: DateTime<Utc>) -> Result<Option<Datum>> {
    let actual = (next_start - time_of(previous)?).num_milliseconds();
    if actual < 0 {
        return Err(IngestError::invalid(
            fields::PREVIOUS,
            "must not start after the datum that references it",
        ));
    }
    if get_f64(previous, "duration") == Some(actual as f64) {
        return Ok(None);
    }

    let mut corrected = previous.clone();
    if !corrected.contains_key("expectedDuration") {
        if let Some(reported) = previous.get("duration") {
            corrected.insert("expectedDuration".to_string(), reported.clone());
        }
    }
    corrected.insert("duration".to_string(), millis(actual));
    Ok(Some(corrected))
}

/// Whether `prior` ends exactly at `start`; unknown durations are not judged.
/// A duration too large to place on the timeline never ends at `start`.
fn ends_at(prior: &Datum, start: DateTime<Utc>) -> Result<bool> {
    let duration = match get_f64(prior, "duration") {
        Some(d) => d,
        None => return Ok(true),
    };
    let begin = time_of(prior)?;
    // float to int casts saturate, so an absurd duration lands on try_milliseconds' None
    let end = Duration::try_milliseconds(duration.round() as i64).and_then(|d| begin.checked_add_signed(d));
    Ok(end == Some(start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::testing::{run, stored, FakeLookup};
    use serde_json::json;

    fn scheduled(time: &str, duration: i64) -> Value {
        json!({
            "type": "basal",
            "deliveryType": "scheduled",
            "scheduleName": "Standard",
            "rate": 0.75,
            "duration": duration,
            "deviceId": "pump-1",
            "time": time,
            "_groupId": "g1"
        })
    }

    #[tokio::test]
    async fn test_previous_duration_repaired() {
        let previous = stored(scheduled("2014-01-01T00:00:00.000Z", 7_200_000));
        let lookup = FakeLookup::with(vec![previous.clone()]);

        let mut next = scheduled("2014-01-01T01:00:00.000Z", 7_200_000);
        next["previous"] = Value::Object(previous.clone());

        let out = run(&lookup, next).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["id"], previous["id"]);
        assert_eq!(out[0]["duration"], 3_600_000);
        assert_eq!(out[0]["expectedDuration"], 7_200_000);
        assert_eq!(out[1]["time"], "2014-01-01T01:00:00.000Z");
        assert!(!out[1].contains_key("previous"));
        assert!(out[1].contains_key("_id"));
    }

    #[tokio::test]
    async fn test_previous_by_id_already_correct() {
        let previous = stored(scheduled("2014-01-01T00:00:00.000Z", 3_600_000));
        let lookup = FakeLookup::with(vec![previous.clone()]);

        let mut next = scheduled("2014-01-01T01:00:00.000Z", 3_600_000);
        next["previous"] = previous["id"].clone();

        let out = run(&lookup, next).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["time"], "2014-01-01T01:00:00.000Z");
    }

    #[tokio::test]
    async fn test_unknown_previous_annotated() {
        let lookup = FakeLookup::default();
        let mut next = scheduled("2014-01-01T01:00:00.000Z", 3_600_000);
        next["previous"] = json!("abcdef");

        let out = run(&lookup, next).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["annotations"], json!([{"code": UNKNOWN_PREVIOUS, "id": "abcdef"}]));
    }

    #[tokio::test]
    async fn test_mismatched_series_annotates_prior() {
        let mut lookup = FakeLookup::default();
        lookup.prior = Some(stored(scheduled("2014-01-01T00:00:00.000Z", 1_800_000)));

        let out = run(&lookup, scheduled("2014-01-01T01:00:00.000Z", 3_600_000)).await.unwrap();
        assert_eq!(out.len(), 2);
        assert!(has_annotation(&out[0], MISMATCHED_SERIES));
        // no precise repair without an explicit reference
        assert_eq!(out[0]["duration"], 1_800_000);
    }

    #[tokio::test]
    async fn test_matching_series_left_alone() {
        let mut lookup = FakeLookup::default();
        lookup.prior = Some(stored(scheduled("2014-01-01T00:00:00.000Z", 3_600_000)));

        let out = run(&lookup, scheduled("2014-01-01T01:00:00.000Z", 3_600_000)).await.unwrap();
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn test_already_annotated_prior_skipped() {
        let mut prior = stored(scheduled("2014-01-01T00:00:00.000Z", 1_800_000));
        annotate(&mut prior, MISMATCHED_SERIES, Map::new());
        let mut lookup = FakeLookup::default();
        lookup.prior = Some(prior);

        let out = run(&lookup, scheduled("2014-01-01T01:00:00.000Z", 3_600_000)).await.unwrap();
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn test_overlong_stored_duration_flags_prior() {
        let mut lookup = FakeLookup::default();
        lookup.prior = Some(stored(json!({
            "type": "basal",
            "deliveryType": "scheduled",
            "rate": 0.75,
            "duration": 1e18,
            "deviceId": "pump-1",
            "time": "2014-01-01T00:00:00.000Z",
            "_groupId": "g1"
        })));

        let out = run(&lookup, scheduled("2014-01-01T01:00:00.000Z", 3_600_000)).await.unwrap();
        assert_eq!(out.len(), 2);
        assert!(has_annotation(&out[0], MISMATCHED_SERIES));
    }

    #[tokio::test]
    async fn test_duration_beyond_a_week_rejected() {
        let lookup = FakeLookup::default();
        let mut raw = scheduled("2014-01-01T00:00:00.000Z", 0);
        raw["duration"] = json!(1e18);
        let err = run(&lookup, raw).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.error_field(), Some("duration"));
    }

    #[tokio::test]
    async fn test_temp_rate_derived_from_percent() {
        let lookup = FakeLookup::default();
        let temp = json!({
            "type": "basal",
            "deliveryType": "temp",
            "percent": 0.5,
            "suppressed": {"type": "basal", "deliveryType": "scheduled", "rate": 1.5},
            "duration": 1_800_000,
            "deviceId": "pump-1",
            "time": "2014-01-01T02:00:00.000Z",
            "_groupId": "g1"
        });
        let out = run(&lookup, temp).await.unwrap();
        assert_eq!(out[0]["rate"], json!(0.75));
    }

    #[tokio::test]
    async fn test_temp_without_rate_rejected() {
        let lookup = FakeLookup::default();
        let temp = json!({
            "type": "basal",
            "deliveryType": "temp",
            "percent": 0.5,
            "duration": 1_800_000,
            "deviceId": "pump-1",
            "time": "2014-01-01T02:00:00.000Z",
            "_groupId": "g1"
        });
        let err = run(&lookup, temp).await.unwrap_err();
        assert_eq!(err.error_field(), Some("rate"));
    }

    #[tokio::test]
    async fn test_scheduled_requires_duration() {
        let lookup = FakeLookup::default();
        let mut raw = scheduled("2014-01-01T00:00:00.000Z", 0);
        raw.as_object_mut().unwrap().remove("duration");
        let err = run(&lookup, raw).await.unwrap_err();
        assert_eq!(err.error_field(), Some("duration"));
    }
}
