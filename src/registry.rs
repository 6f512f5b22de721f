//! Type Registry
//!
//! Dispatch table from datum type (and, for some types, a secondary
//! discriminator) to the handler that validates, transforms and identifies it.
//! The registry is built once at a single registration point
//! ([`TypeRegistry::standard`]) and passed by reference from then on.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::config::IngestConfig;
use crate::datum::{fields, format_time, get_str, parse_time, Datum};
use crate::error::{IngestError, Result};
use crate::identity;
use crate::store::DatumLookup;
use crate::types::{self, TransformContext};
use crate::validation::{base_schema, FieldSchema};

/// Every datum type the engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DatumType {
    Basal,
    Bolus,
    Cbg,
    Smbg,
    BloodKetone,
    Wizard,
    Food,
    Note,
    DeviceEvent,
    /// Legacy name for a subset of device events
    DeviceMeta,
    PumpSettings,
    CgmSettings,
    Upload,
}

impl DatumType {
    pub const ALL: [DatumType; 13] = [
        DatumType::Basal,
        DatumType::Bolus,
        DatumType::Cbg,
        DatumType::Smbg,
        DatumType::BloodKetone,
        DatumType::Wizard,
        DatumType::Food,
        DatumType::Note,
        DatumType::DeviceEvent,
        DatumType::DeviceMeta,
        DatumType::PumpSettings,
        DatumType::CgmSettings,
        DatumType::Upload,
    ];

    /// Wire name of the type
    pub fn as_str(&self) -> &'static str {
        match self {
            DatumType::Basal => "basal",
            DatumType::Bolus => "bolus",
            DatumType::Cbg => "cbg",
            DatumType::Smbg => "smbg",
            DatumType::BloodKetone => "bloodKetone",
            DatumType::Wizard => "wizard",
            DatumType::Food => "food",
            DatumType::Note => "note",
            DatumType::DeviceEvent => "deviceEvent",
            DatumType::DeviceMeta => "deviceMeta",
            DatumType::PumpSettings => "pumpSettings",
            DatumType::CgmSettings => "cgmSettings",
            DatumType::Upload => "upload",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == raw)
    }

    /// Field that selects the sub-handler, for types that have one
    pub fn secondary_field(&self) -> Option<&'static str> {
        match self {
            DatumType::Basal => Some("deliveryType"),
            DatumType::Bolus | DatumType::DeviceEvent | DatumType::DeviceMeta => Some("subType"),
            DatumType::Cbg
            | DatumType::Smbg
            | DatumType::BloodKetone
            | DatumType::Wizard
            | DatumType::Food
            | DatumType::Note
            | DatumType::PumpSettings
            | DatumType::CgmSettings
            | DatumType::Upload => None,
        }
    }
}

impl fmt::Display for DatumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Post-validation behavior of a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Identity,
    /// Scheduled and suspend basals: repair or annotate the previous interval
    BasalSeries,
    /// Temp basals: derive the rate, then as [`Transform::BasalSeries`]
    TempBasal,
    BolusCompletion,
    StatusTuple,
    GlucoseUnits,
    KetoneUnits,
    Wizard,
    NoteReference,
    PumpSettingsUnits,
    CgmSettingsUnits,
    UploadVersion,
}

/// What a caller supplies to register a handler
#[derive(Debug, Clone)]
pub struct TypeSpec {
    pub schema: FieldSchema,
    pub id_fields: Vec<&'static str>,
    pub transform: Transform,
}

impl TypeSpec {
    pub fn new(schema: FieldSchema, id_fields: &[&'static str], transform: Transform) -> Self {
        Self {
            schema,
            id_fields: id_fields.to_vec(),
            transform,
        }
    }
}

/// A registered handler
#[derive(Debug, Clone)]
pub struct TypeHandler {
    pub datum_type: DatumType,
    pub sub_type: Option<String>,
    pub schema: FieldSchema,
    pub id_fields: Vec<&'static str>,
    pub transform: Transform,
}

impl TypeHandler {
    /// Human-readable key, e.g. `basal/temp`
    pub fn key(&self) -> String {
        match &self.sub_type {
            Some(sub) => format!("{}/{}", self.datum_type, sub),
            None => self.datum_type.to_string(),
        }
    }
}

/// The dispatch table
pub struct TypeRegistry {
    base: FieldSchema,
    /// Schema shared by every branch of a sub-dispatched type
    common: HashMap<DatumType, FieldSchema>,
    handlers: HashMap<(DatumType, Option<String>), TypeHandler>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Empty registry carrying only the base checks
    pub fn new() -> Self {
        Self {
            base: base_schema(),
            common: HashMap::new(),
            handlers: HashMap::new(),
        }
    }

    /// Registry with every standard handler installed
    pub fn standard() -> Result<Self> {
        let mut registry = Self::new();
        types::register_all(&mut registry)?;
        Ok(registry)
    }

    /// Register a type without a secondary discriminator
    pub fn register(&mut self, datum_type: DatumType, spec: TypeSpec) -> Result<()> {
        if let Some(field) = datum_type.secondary_field() {
            return Err(IngestError::Registration(format!(
                "{} dispatches on {}; register its sub-types instead",
                datum_type, field
            )));
        }
        self.install(datum_type, None, spec)
    }

    /// Schema enforced on every sub-type of `datum_type`
    pub fn register_common(&mut self, datum_type: DatumType, schema: FieldSchema) -> Result<()> {
        if datum_type.secondary_field().is_none() {
            return Err(IngestError::Registration(format!("{} has no sub-types", datum_type)));
        }
        if self.common.contains_key(&datum_type) {
            return Err(IngestError::Registration(format!(
                "common schema for {} already registered",
                datum_type
            )));
        }
        self.common.insert(datum_type, schema);
        Ok(())
    }

    pub fn register_sub_type(&mut self, datum_type: DatumType, sub_type: &str, spec: TypeSpec) -> Result<()> {
        if datum_type.secondary_field().is_none() {
            return Err(IngestError::Registration(format!("{} has no sub-types", datum_type)));
        }
        self.install(datum_type, Some(sub_type.to_string()), spec)
    }

    fn install(&mut self, datum_type: DatumType, sub_type: Option<String>, spec: TypeSpec) -> Result<()> {
        let handler = TypeHandler {
            datum_type,
            sub_type,
            schema: spec.schema,
            id_fields: spec.id_fields,
            transform: spec.transform,
        };
        if handler.id_fields.is_empty() {
            return Err(IngestError::Registration(format!("{} declares no id fields", handler.key())));
        }
        let slot = (datum_type, handler.sub_type.clone());
        if self.handlers.contains_key(&slot) {
            return Err(IngestError::Registration(format!("{} already registered", handler.key())));
        }
        self.handlers.insert(slot, handler);
        Ok(())
    }

    /// Registered sub-types of `datum_type`, sorted
    pub fn sub_types(&self, datum_type: DatumType) -> Vec<&str> {
        let mut subs: Vec<&str> = self
            .handlers
            .keys()
            .filter(|(t, _)| *t == datum_type)
            .filter_map(|(_, sub)| sub.as_deref())
            .collect();
        subs.sort_unstable();
        subs
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Find the handler for a datum by type, then secondary discriminator
    pub fn resolve(&self, datum: &Datum) -> Result<&TypeHandler> {
        let raw_type = get_str(datum, fields::TYPE)
            .ok_or_else(|| IngestError::invalid(fields::TYPE, "should be a string"))?;
        let datum_type = DatumType::parse(raw_type)
            .ok_or_else(|| IngestError::invalid(fields::TYPE, format!("Unknown type[{}]", raw_type)))?;

        let sub_type = match datum_type.secondary_field() {
            Some(field) => {
                let raw = get_str(datum, field).ok_or_else(|| {
                    IngestError::invalid(field, format!("should be one of [{}]", self.sub_types(datum_type).join(", ")))
                })?;
                Some(raw.to_string())
            }
            None => None,
        };

        let secondary = datum_type.secondary_field();
        self.handlers
            .get(&(datum_type, sub_type.clone()))
            .ok_or_else(|| match (secondary, sub_type) {
                (Some(field), Some(sub)) => IngestError::invalid(
                    field,
                    format!("Unknown {}[{}] for type {}", field, sub, datum_type),
                ),
                _ => IngestError::invalid(fields::TYPE, format!("Unknown type[{}]", raw_type)),
            })
    }

    /// Run base, common and handler schemas in that order
    pub fn validate(&self, datum: &Datum) -> Result<&TypeHandler> {
        if get_str(datum, fields::GROUP_ID).is_none() {
            return Err(IngestError::invalid(fields::GROUP_ID, "must be set before validation"));
        }
        self.base.validate(datum)?;
        let handler = self.resolve(datum)?;
        if let Some(common) = self.common.get(&handler.datum_type) {
            common.validate(datum)?;
        }
        handler.schema.validate(datum)?;
        Ok(handler)
    }

    /// Validate, normalize, transform and identify one raw datum
    pub async fn handle(
        &self,
        mut datum: Datum,
        lookup: &dyn DatumLookup,
        config: &IngestConfig,
    ) -> Result<Vec<Datum>> {
        let transform = self.validate(&datum)?.transform;
        normalize_time(&mut datum)?;

        let ctx = TransformContext {
            registry: self,
            lookup,
            config,
        };
        let mut outputs = types::apply(transform, datum, &ctx).await?;
        for output in outputs.iter_mut() {
            self.attach_ids(output)?;
        }
        Ok(outputs)
    }

    /// Set `id`/`_id` from the datum's own handler's id fields
    pub fn attach_ids(&self, datum: &mut Datum) -> Result<()> {
        let handler = self.resolve(datum)?;
        identity::attach_ids(datum, &handler.id_fields)
    }

    /// Id a datum would be stored under, without validating it
    pub fn compute_id(&self, datum: &Datum) -> Result<String> {
        let handler = self.resolve(datum)?;
        let mut normalized = datum.clone();
        normalize_time(&mut normalized)?;
        identity::datum_id(&normalized, &handler.id_fields)
    }
}

/// Rewrite `time` to UTC with millisecond precision
pub fn normalize_time(datum: &mut Datum) -> Result<()> {
    let raw = get_str(datum, fields::TIME)
        .ok_or_else(|| IngestError::invalid(fields::TIME, "is required"))?;
    let time = parse_time(raw)
        .ok_or_else(|| IngestError::invalid(fields::TIME, "must be an ISO-8601 datetime with a timezone"))?;
    datum.insert(fields::TIME.to_string(), Value::from(format_time(&time)));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::{number, string};
    use serde_json::json;

    fn datum(value: Value) -> Datum {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_standard_registry_covers_every_type() {
        let registry = TypeRegistry::standard().unwrap();
        assert_eq!(registry.sub_types(DatumType::Basal), vec!["scheduled", "suspend", "temp"]);
        assert_eq!(registry.sub_types(DatumType::Bolus), vec!["dual/square", "normal", "square"]);
        assert!(registry.sub_types(DatumType::DeviceEvent).contains(&"status"));
        assert!(registry.handler_count() > DatumType::ALL.len());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = TypeRegistry::new();
        let spec = TypeSpec::new(FieldSchema::new().field("value", number()), &["type", "deviceId", "time"], Transform::Identity);
        registry.register(DatumType::Cbg, spec.clone()).unwrap();
        assert!(matches!(
            registry.register(DatumType::Cbg, spec),
            Err(IngestError::Registration(_))
        ));
    }

    #[test]
    fn test_empty_id_fields_rejected() {
        let mut registry = TypeRegistry::new();
        let spec = TypeSpec::new(FieldSchema::new(), &[], Transform::Identity);
        assert!(registry.register(DatumType::Food, spec).is_err());
    }

    #[test]
    fn test_sub_typed_types_cannot_register_directly() {
        let mut registry = TypeRegistry::new();
        let spec = TypeSpec::new(FieldSchema::new(), &["type"], Transform::Identity);
        assert!(registry.register(DatumType::Basal, spec).is_err());
    }

    #[test]
    fn test_registration_order_does_not_matter() {
        let spec = TypeSpec::new(FieldSchema::new().field("alarmType", string()), &["type", "subType", "deviceId", "time"], Transform::Identity);
        let mut a = TypeRegistry::new();
        a.register_sub_type(DatumType::DeviceEvent, "alarm", spec.clone()).unwrap();
        a.register_common(DatumType::DeviceEvent, FieldSchema::new().field("subType", string())).unwrap();

        let mut b = TypeRegistry::new();
        b.register_common(DatumType::DeviceEvent, FieldSchema::new().field("subType", string())).unwrap();
        b.register_sub_type(DatumType::DeviceEvent, "alarm", spec).unwrap();

        let d = datum(json!({
            "type": "deviceEvent", "subType": "alarm", "alarmType": "low_insulin",
            "deviceId": "pump", "time": "2014-01-01T00:00:00Z", "_groupId": "g"
        }));
        assert_eq!(a.validate(&d).unwrap().key(), b.validate(&d).unwrap().key());
    }

    #[test]
    fn test_unknown_type_and_sub_type() {
        let registry = TypeRegistry::standard().unwrap();
        let unknown = datum(json!({"type": "grumpy", "deviceId": "d", "time": "2014-01-01T00:00:00Z", "_groupId": "g"}));
        let err = registry.validate(&unknown).unwrap_err();
        assert_eq!(err.error_field(), Some("type"));

        let bad_sub = datum(json!({"type": "bolus", "subType": "sideways", "deviceId": "d", "time": "2014-01-01T00:00:00Z", "_groupId": "g"}));
        let err = registry.validate(&bad_sub).unwrap_err();
        assert_eq!(err.error_field(), Some("subType"));
    }

    #[test]
    fn test_group_required_before_validation() {
        let registry = TypeRegistry::standard().unwrap();
        let d = datum(json!({"type": "cbg", "deviceId": "d", "time": "2014-01-01T00:00:00Z", "value": 5.5, "units": "mmol/L"}));
        assert_eq!(registry.validate(&d).unwrap_err().error_field(), Some("_groupId"));
    }

    #[test]
    fn test_common_schema_enforced_on_branch() {
        let registry = TypeRegistry::standard().unwrap();
        let d = datum(json!({
            "type": "basal", "deliveryType": "scheduled", "rate": 1.0, "duration": 3600000,
            "previous": 12, "deviceId": "d", "time": "2014-01-01T00:00:00Z", "_groupId": "g"
        }));
        assert_eq!(registry.validate(&d).unwrap_err().error_field(), Some("previous"));
    }

    #[test]
    fn test_compute_id_normalizes_time() {
        let registry = TypeRegistry::standard().unwrap();
        let a = datum(json!({"type": "cbg", "deviceId": "d", "time": "2014-01-01T01:00:00+01:00"}));
        let b = datum(json!({"type": "cbg", "deviceId": "d", "time": "2014-01-01T00:00:00.000Z"}));
        assert_eq!(registry.compute_id(&a).unwrap(), registry.compute_id(&b).unwrap());
    }
}
