//! Batch ingestion
//!
//! Runs a caller's batch through the registry, the identity stage and the
//! versioned store one record at a time, in submission order. Each record's
//! writes finish before the next record is transformed, so a record may refer
//! back to one submitted earlier in the same batch.
//!
//! Duplicates are benign and only reported. The first hard error stops the
//! batch; records before it stay stored. Summary invalidation runs once at the
//! end over whatever was persisted.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::datum::{fields, Datum};
use crate::error::{ErrorBody, IngestError, Result};
use crate::identity::DedupHashRegistry;
use crate::registry::TypeRegistry;
use crate::store::{Collection, VersionedStore};
use crate::summary::{SummaryPolicy, SummarySink, SummaryUpdate};

/// Who a batch is stored for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOwner {
    pub group_id: String,
    /// Needed for dedup hashes and summaries; legacy groups may lack one
    pub user_id: Option<String>,
}

impl BatchOwner {
    pub fn new(group_id: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            group_id: group_id.into(),
            user_id,
        }
    }
}

/// What happened to one submitted record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordOutcome {
    /// Rows written, corrected previous records included
    pub stored: Vec<Datum>,
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordError {
    pub index: usize,
    #[serde(flatten)]
    pub body: ErrorBody,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub persisted: usize,
    pub duplicates: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordError>,
    pub stored: Vec<Datum>,
    pub summary_updates: Vec<SummaryUpdate>,
}

impl BatchResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// The ingest engine wired to a collection and a summary sink
pub struct Ingestor<C, S> {
    registry: TypeRegistry,
    hashes: DedupHashRegistry,
    store: VersionedStore<C>,
    sink: S,
    policy: SummaryPolicy,
    config: IngestConfig,
}

impl<C: Collection, S: SummarySink> Ingestor<C, S> {
    /// Engine with every standard type and dedup hash registered
    pub fn new(collection: C, sink: S, config: IngestConfig) -> Result<Self> {
        Self::with_registries(
            TypeRegistry::standard()?,
            DedupHashRegistry::standard()?,
            collection,
            sink,
            config,
        )
    }

    pub fn with_registries(
        registry: TypeRegistry,
        hashes: DedupHashRegistry,
        collection: C,
        sink: S,
        config: IngestConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry,
            hashes,
            store: VersionedStore::from_config(collection, &config.store),
            sink,
            policy: SummaryPolicy::from_config(&config.summary),
            config,
        })
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn hashes(&self) -> &DedupHashRegistry {
        &self.hashes
    }

    pub fn store(&self) -> &VersionedStore<C> {
        &self.store
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Accept a JSON array of records or a single record
    pub async fn ingest_value(&self, owner: &BatchOwner, payload: Value) -> Result<BatchResult> {
        let records = match payload {
            Value::Array(records) => records,
            Value::Object(record) => vec![Value::Object(record)],
            _ => {
                return Err(IngestError::Validation {
                    field: None,
                    message: "payload must be a datum or an array of datums".to_string(),
                })
            }
        };
        Ok(self.ingest(owner, records).await)
    }

    pub async fn ingest(&self, owner: &BatchOwner, records: Vec<Value>) -> BatchResult {
        let mut result = BatchResult::default();
        let submitted = records.len();

        for (index, raw) in records.into_iter().enumerate() {
            match self.ingest_record(owner, raw).await {
                Ok(outcome) => {
                    if outcome.duplicate {
                        result.duplicates.push(index);
                    }
                    result.persisted += outcome.stored.len();
                    result.stored.extend(outcome.stored);
                }
                Err(e) => {
                    warn!(index, error = %e, "record rejected, stopping batch");
                    result.error = Some(RecordError {
                        index,
                        body: e.to_body(),
                    });
                    break;
                }
            }
        }

        if let Some(user_id) = &owner.user_id {
            result.summary_updates = self.invalidate_summaries(user_id, &result).await;
        }

        info!(
            group_id = %owner.group_id,
            submitted,
            persisted = result.persisted,
            duplicates = result.duplicates.len(),
            failed = result.error.is_some(),
            "batch ingested"
        );
        result
    }

    /// Validate, transform, identify and store one record
    pub async fn ingest_record(&self, owner: &BatchOwner, raw: Value) -> Result<RecordOutcome> {
        let mut datum = match raw {
            Value::Object(datum) => datum,
            _ => {
                return Err(IngestError::Validation {
                    field: None,
                    message: "datum must be an object".to_string(),
                })
            }
        };
        datum.insert(fields::GROUP_ID.to_string(), Value::from(owner.group_id.clone()));
        if let Some(user_id) = &owner.user_id {
            datum.insert(fields::USER_ID.to_string(), Value::from(user_id.clone()));
        }

        let outputs = self.registry.handle(datum, &self.store, &self.config).await?;

        let mut outcome = RecordOutcome::default();
        for mut output in outputs {
            self.attach_dedup_hash(&mut output)?;
            match self.store.add_or_update_datum(output).await {
                Ok(stored) => outcome.stored.push(stored),
                Err(IngestError::Duplicate { id }) => {
                    debug!(id = %id, "duplicate datum skipped");
                    outcome.duplicate = true;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    /// `_deduplicator.hash` for owners with a user id and types with hash fields
    fn attach_dedup_hash(&self, datum: &mut Datum) -> Result<()> {
        if !datum.contains_key(fields::USER_ID) {
            return Ok(());
        }
        match self.hashes.hash(datum)? {
            Some(hash) => {
                let mut deduplicator = Map::new();
                deduplicator.insert("hash".to_string(), Value::from(hash));
                datum.insert(fields::DEDUPLICATOR.to_string(), Value::Object(deduplicator));
            }
            None => debug!(datum_type = ?datum.get(fields::TYPE), "no dedup hash fields registered"),
        }
        Ok(())
    }

    async fn invalidate_summaries(&self, user_id: &str, result: &BatchResult) -> Vec<SummaryUpdate> {
        let updates = self.policy.plan(user_id, &result.stored, result.persisted, Utc::now());
        let mut delivered = Vec::with_capacity(updates.len());
        for update in updates {
            match self
                .sink
                .mark_outdated(&update.user_id, update.summary_type, update.outdated_since, update.reason)
                .await
            {
                Ok(()) => delivered.push(update),
                Err(e) => warn!(
                    user_id,
                    summary_type = %update.summary_type,
                    error = %e,
                    "failed to mark summary outdated"
                ),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCollection;
    use crate::summary::MemorySummarySink;
    use serde_json::json;

    fn ingestor() -> Ingestor<MemoryCollection, MemorySummarySink> {
        Ingestor::new(MemoryCollection::new(), MemorySummarySink::new(), IngestConfig::default()).unwrap()
    }

    fn owner() -> BatchOwner {
        BatchOwner::new("g1", Some("u1".to_string()))
    }

    fn smbg(time: &str) -> Value {
        json!({
            "type": "smbg",
            "value": 5.9,
            "units": "mmol/L",
            "deviceId": "Contour7800-5455830",
            "time": time
        })
    }

    #[tokio::test]
    async fn test_single_object_accepted() {
        let engine = ingestor();
        let result = engine.ingest_value(&owner(), smbg("2018-01-11T13:25:00Z")).await.unwrap();
        assert!(result.is_ok());
        assert_eq!(result.persisted, 1);
        assert_eq!(result.stored[0]["_groupId"], "g1");
        assert_eq!(result.stored[0]["_userId"], "u1");
    }

    #[tokio::test]
    async fn test_scalar_payload_rejected() {
        let err = ingestor().ingest_value(&owner(), json!(42)).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_dedup_hash_attached() {
        let engine = ingestor();
        let owner = BatchOwner::new("g1", Some("1099e49b7e".to_string()));
        let result = engine.ingest_value(&owner, smbg("2018-01-11T13:25:00Z")).await.unwrap();
        // value goes in as a number, so it hashes as "5.9" just like the string form
        assert_eq!(
            result.stored[0]["_deduplicator"]["hash"],
            "yKCmHdSd0tJoOyTaNv7A2vR0c4qV69D6mZWRmoQxM6Y="
        );
    }

    #[tokio::test]
    async fn test_dedup_hash_covers_normalized_reading() {
        let engine = ingestor();
        let raw = json!({
            "type": "cbg",
            "value": 100,
            "units": "mg/dL",
            "deviceId": "dexcom-1",
            "time": "2018-01-11T13:25:00.000Z"
        });
        let outcome = engine.ingest_record(&owner(), raw.clone()).await.unwrap();
        let stored = &outcome.stored[0];
        assert_eq!(stored["units"], "mmol/L");

        let expected = engine.hashes().hash(stored).unwrap().unwrap();
        assert_eq!(stored["_deduplicator"]["hash"], json!(expected));

        let mut unnormalized = raw.as_object().unwrap().clone();
        unnormalized.insert("_userId".to_string(), json!("u1"));
        assert_ne!(engine.hashes().hash(&unnormalized).unwrap().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_no_hash_without_user() {
        let engine = ingestor();
        let anonymous = BatchOwner::new("g1", None);
        let result = engine.ingest_value(&anonymous, smbg("2018-01-11T13:25:00Z")).await.unwrap();
        assert!(!result.stored[0].contains_key("_deduplicator"));
        assert!(result.summary_updates.is_empty());
    }

    #[tokio::test]
    async fn test_duplicates_reported_by_index() {
        let engine = ingestor();
        let batch = json!([smbg("2018-01-11T13:25:00Z"), smbg("2018-01-11T13:25:00Z"), smbg("2018-01-11T13:30:00Z")]);
        let result = engine.ingest_value(&owner(), batch).await.unwrap();
        assert!(result.is_ok());
        assert_eq!(result.persisted, 2);
        assert_eq!(result.duplicates, vec![1]);
    }

    #[tokio::test]
    async fn test_first_error_stops_batch() {
        let engine = ingestor();
        let mut bad = smbg("2018-01-11T13:30:00Z");
        bad["_active"] = json!(true);
        let batch = json!([smbg("2018-01-11T13:25:00Z"), bad, smbg("2018-01-11T13:35:00Z")]);

        let result = engine.ingest_value(&owner(), batch).await.unwrap();
        let error = result.error.clone().unwrap();
        assert_eq!(error.index, 1);
        assert_eq!(error.body.status_code, 400);
        assert_eq!(error.body.error_field.as_deref(), Some("_active"));
        assert_eq!(result.persisted, 1);
        assert_eq!(engine.store().collection().len().await, 1);
    }

    #[tokio::test]
    async fn test_batch_result_wire_shape() {
        let engine = ingestor();
        let result = engine.ingest_value(&owner(), json!([{"type": "grumpy"}])).await.unwrap();
        let wire = serde_json::to_value(&result).unwrap();
        assert_eq!(wire["error"]["index"], 0);
        assert_eq!(wire["error"]["statusCode"], 400);
        assert_eq!(wire["persisted"], 0);
        assert!(wire.get("summaryUpdates").is_some());
    }
}
