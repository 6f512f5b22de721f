//! Per-type schemas and transforms
//!
//! Each submodule registers its handlers in [`register_all`], the single place
//! a new type gets wired in. Transforms are selected by the closed
//! [`Transform`] enum and matched exhaustively in [`apply`].

pub mod basal;
pub mod bolus;
pub mod device_event;
pub mod glucose;
pub mod meal;
pub mod note;
pub mod settings;
pub mod upload;

use serde_json::{Map, Value};

use crate::config::IngestConfig;
use crate::datum::{fields, Datum};
use crate::error::{IngestError, Result};
use crate::registry::{Transform, TypeRegistry};
use crate::store::DatumLookup;
use crate::validation::{object, or, string, Check};

/// Everything a transform may consult
pub struct TransformContext<'a> {
    pub registry: &'a TypeRegistry,
    pub lookup: &'a dyn DatumLookup,
    pub config: &'a IngestConfig,
}

impl<'a> TransformContext<'a> {
    /// Id named by a reference field: either the id itself or an inline datum
    pub fn reference_id(&self, field: &str, reference: &Value, group_id: &str) -> Result<String> {
        match reference {
            Value::String(id) => Ok(id.clone()),
            Value::Object(inline) => {
                if let Some(id) = inline.get(fields::ID).and_then(Value::as_str) {
                    return Ok(id.to_string());
                }
                let mut inline = inline.clone();
                inline.insert(fields::GROUP_ID.to_string(), Value::from(group_id));
                self.registry.compute_id(&inline)
            }
            _ => Err(IngestError::invalid(field, "should be an id or an inline datum")),
        }
    }

    /// Resolve a reference against the store; the id is returned even when
    /// nothing is stored under it so callers can annotate with it
    pub async fn fetch_reference(
        &self,
        field: &str,
        reference: &Value,
        group_id: &str,
    ) -> Result<(String, Option<Datum>)> {
        let id = self.reference_id(field, reference, group_id)?;
        let found = self.lookup.get_datum(&id, group_id).await?;
        Ok((id, found))
    }
}

/// Schema check for `previous`/`reference` style fields
pub(crate) fn reference() -> Check {
    or(vec![string(), object()])
}

/// Annotation context carrying an unresolved id
pub(crate) fn with_id(id: &str) -> Map<String, Value> {
    let mut context = Map::new();
    context.insert(fields::ID.to_string(), Value::from(id));
    context
}

pub(crate) fn group_of(datum: &Datum) -> Result<String> {
    crate::datum::require_str(datum, fields::GROUP_ID).map(String::from)
}

/// Run the transform selected for a handler
pub async fn apply(transform: Transform, datum: Datum, ctx: &TransformContext<'_>) -> Result<Vec<Datum>> {
    match transform {
        Transform::Identity => Ok(vec![datum]),
        Transform::BasalSeries => basal::link_series(datum, ctx).await,
        Transform::TempBasal => basal::link_series(basal::derive_temp_rate(datum)?, ctx).await,
        Transform::BolusCompletion => bolus::complete(datum, ctx).await,
        Transform::StatusTuple => device_event::pair_status(datum, ctx).await,
        Transform::GlucoseUnits => glucose::normalize_reading(datum),
        Transform::KetoneUnits => glucose::normalize_ketone(datum),
        Transform::Wizard => meal::normalize_wizard(datum, ctx).await,
        Transform::NoteReference => note::resolve_reference(datum, ctx).await,
        Transform::PumpSettingsUnits => settings::normalize_pump_settings(datum),
        Transform::CgmSettingsUnits => settings::normalize_cgm_settings(datum),
        Transform::UploadVersion => upload::check_version(datum, ctx),
    }
}

/// Install every standard handler
pub fn register_all(registry: &mut TypeRegistry) -> Result<()> {
    basal::register(registry)?;
    bolus::register(registry)?;
    device_event::register(registry)?;
    glucose::register(registry)?;
    meal::register(registry)?;
    note::register(registry)?;
    settings::register(registry)?;
    upload::register(registry)?;
    Ok(())
}
