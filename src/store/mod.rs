//! Versioned datum store
//!
//! Optimistic concurrency over a single document collection that offers no
//! transactions, only single-document atomic operations:
//!
//! ```text
//! live row      _id            _sequenceId = n,   _active = true
//! archives      _id_0 .. _id_{n-1}                _active = false
//! ```
//!
//! An update first inserts a copy of the current row under `<_id>_<n>`. That
//! insert is the claim on sequence `n`: a second updater racing for the same
//! sequence collides on the unique key and retries from a fresh read.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::datum::{fields, get_str, now_string, parse_time, Datum};
use crate::error::{IngestError, Result};
use crate::identity::internal_id;

pub use memory::MemoryCollection;

/// Failures reported by a collection backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("duplicate key {key}")]
    DuplicateKey { key: String },

    #[error("document has no {0} key")]
    MissingKey(&'static str),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// "Most recent active prior" lookup criteria
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorQuery {
    pub group_id: String,
    pub datum_type: String,
    pub device_id: String,
    /// `None` matches only documents without a source
    pub source: Option<String>,
    /// Exclusive upper bound on `time`
    pub before: DateTime<Utc>,
}

impl PriorQuery {
    /// Criteria matching the series `datum` belongs to, strictly before it
    pub fn for_datum(datum: &Datum, before: DateTime<Utc>) -> Option<Self> {
        Some(Self {
            group_id: get_str(datum, fields::GROUP_ID)?.to_string(),
            datum_type: get_str(datum, fields::TYPE)?.to_string(),
            device_id: get_str(datum, fields::DEVICE_ID)?.to_string(),
            source: get_str(datum, fields::SOURCE).map(String::from),
            before,
        })
    }

    pub fn matches(&self, doc: &Datum) -> bool {
        doc.get(fields::ACTIVE) == Some(&Value::Bool(true))
            && get_str(doc, fields::GROUP_ID) == Some(self.group_id.as_str())
            && get_str(doc, fields::TYPE) == Some(self.datum_type.as_str())
            && get_str(doc, fields::DEVICE_ID) == Some(self.device_id.as_str())
            && get_str(doc, fields::SOURCE) == self.source.as_deref()
            && get_str(doc, fields::TIME)
                .and_then(parse_time)
                .map(|t| t < self.before)
                .unwrap_or(false)
    }
}

/// Single-document atomic operations the store protocol is built on
#[async_trait]
pub trait Collection: Send + Sync {
    /// Insert keyed by `_id`; an existing key fails with [`StoreError::DuplicateKey`]
    async fn insert_one(&self, doc: Datum) -> StoreResult<()>;

    async fn find_one(&self, key: &str) -> StoreResult<Option<Datum>>;

    /// Replace the row at `key` only while its `_sequenceId` is `expected_sequence`
    async fn replace_if_sequence(&self, key: &str, expected_sequence: i64, doc: Datum) -> StoreResult<bool>;

    /// Latest matching document by `time`
    async fn find_latest_before(&self, query: &PriorQuery) -> StoreResult<Option<Datum>>;

    /// Remove every row of a group, archives included
    async fn delete_group(&self, group_id: &str) -> StoreResult<u64>;
}

/// Read access transforms need while resolving previous references
#[async_trait]
pub trait DatumLookup: Send + Sync {
    async fn get_datum(&self, id: &str, group_id: &str) -> Result<Option<Datum>>;

    async fn get_datum_before(&self, query: &PriorQuery) -> Result<Option<Datum>>;
}

/// Outcome of a keep-going bulk insert
#[derive(Debug, Default)]
pub struct BulkReport {
    pub inserted: usize,
    /// Input indexes whose `_id` already existed
    pub duplicates: Vec<usize>,
    pub errors: Vec<(usize, IngestError)>,
}

/// Archive key for a superseded generation
pub fn archive_key(key: &str, sequence: i64) -> String {
    format!("{}_{}", key, sequence)
}

fn sequence_of(doc: &Datum) -> i64 {
    doc.get(fields::SEQUENCE_ID).and_then(Value::as_i64).unwrap_or(0)
}

fn key_of(datum: &Datum) -> Result<String> {
    get_str(datum, fields::INTERNAL_ID)
        .map(String::from)
        .ok_or(IngestError::Upstream(StoreError::MissingKey(fields::INTERNAL_ID)))
}

/// Datum store with archive-before-activate updates
pub struct VersionedStore<C> {
    collection: C,
    max_update_attempts: u32,
}

impl<C: Collection> VersionedStore<C> {
    pub fn new(collection: C) -> Self {
        Self::from_config(collection, &StoreConfig::default())
    }

    pub fn from_config(collection: C, config: &StoreConfig) -> Self {
        Self {
            collection,
            max_update_attempts: config.update_max_attempts.max(1),
        }
    }

    pub fn with_max_update_attempts(mut self, attempts: u32) -> Self {
        self.max_update_attempts = attempts.max(1);
        self
    }

    pub fn collection(&self) -> &C {
        &self.collection
    }

    /// Store a brand-new datum as generation 0
    pub async fn insert_datum(&self, mut datum: Datum) -> Result<Datum> {
        let key = key_of(&datum)?;
        datum.insert(fields::CREATED_TIME.to_string(), Value::from(now_string()));
        datum.insert(fields::SEQUENCE_ID.to_string(), Value::from(0));
        datum.insert(fields::ACTIVE.to_string(), Value::Bool(true));

        match self.collection.insert_one(datum.clone()).await {
            Ok(()) => Ok(datum),
            Err(StoreError::DuplicateKey { .. }) => {
                debug!(key = %key, "datum already stored");
                Err(IngestError::Duplicate { id: key })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the live row for `datum._id`, archiving the current generation
    pub async fn update_datum(&self, datum: Datum) -> Result<Datum> {
        let key = key_of(&datum)?;

        for attempt in 1..=self.max_update_attempts {
            let current = self
                .collection
                .find_one(&key)
                .await?
                .ok_or_else(|| IngestError::not_found("Update target", key.clone()))?;
            let sequence = sequence_of(&current);

            let mut archived = current.clone();
            archived.insert(fields::INTERNAL_ID.to_string(), Value::from(archive_key(&key, sequence)));
            archived.insert(fields::ACTIVE.to_string(), Value::Bool(false));

            match self.collection.insert_one(archived).await {
                Ok(()) => {}
                Err(StoreError::DuplicateKey { .. }) => {
                    debug!(key = %key, sequence, attempt, "sequence already claimed, retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let mut next = datum.clone();
            next.insert(fields::INTERNAL_ID.to_string(), Value::from(key.clone()));
            if let Some(created) = current.get(fields::CREATED_TIME) {
                next.insert(fields::CREATED_TIME.to_string(), created.clone());
            }
            next.insert(fields::SEQUENCE_ID.to_string(), Value::from(sequence + 1));
            next.insert(fields::ACTIVE.to_string(), Value::Bool(true));
            next.insert(fields::MODIFIED_TIME.to_string(), Value::from(now_string()));

            if self.collection.replace_if_sequence(&key, sequence, next.clone()).await? {
                return Ok(next);
            }
            debug!(key = %key, sequence, attempt, "live row moved after archive, retrying");
        }

        warn!(key = %key, attempts = self.max_update_attempts, "update retries exhausted");
        Err(IngestError::Contention {
            id: key,
            attempts: self.max_update_attempts,
        })
    }

    /// Insert unless the datum was read back from the store
    pub async fn add_or_update_datum(&self, datum: Datum) -> Result<Datum> {
        if datum.contains_key(fields::CREATED_TIME) {
            self.update_datum(datum).await
        } else {
            self.insert_datum(datum).await
        }
    }

    /// Insert every datum; failures are reported per index and never stop the batch
    pub async fn store_data(&self, data: Vec<Datum>) -> BulkReport {
        let mut report = BulkReport::default();
        for (index, datum) in data.into_iter().enumerate() {
            match self.insert_datum(datum).await {
                Ok(_) => report.inserted += 1,
                Err(e) if e.is_duplicate() => report.duplicates.push(index),
                Err(e) => report.errors.push((index, e)),
            }
        }
        report
    }

    pub async fn get_datum(&self, id: &str, group_id: &str) -> Result<Option<Datum>> {
        let doc = self.collection.find_one(&internal_id(id, group_id)).await?;
        Ok(doc.filter(|d| d.get(fields::ACTIVE) == Some(&Value::Bool(true))))
    }

    pub async fn get_datum_before(&self, query: &PriorQuery) -> Result<Option<Datum>> {
        Ok(self.collection.find_latest_before(query).await?)
    }

    /// Maintenance only: drops every generation of every datum in the group
    pub async fn delete_data(&self, group_id: &str) -> Result<u64> {
        let removed = self.collection.delete_group(group_id).await?;
        debug!(group_id, removed, "deleted group data");
        Ok(removed)
    }
}

#[async_trait]
impl<C: Collection> DatumLookup for VersionedStore<C> {
    async fn get_datum(&self, id: &str, group_id: &str) -> Result<Option<Datum>> {
        VersionedStore::get_datum(self, id, group_id).await
    }

    async fn get_datum_before(&self, query: &PriorQuery) -> Result<Option<Datum>> {
        VersionedStore::get_datum_before(self, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::attach_ids;
    use serde_json::json;

    fn cbg(time: &str, value: f64) -> Datum {
        let mut d = json!({
            "type": "cbg",
            "deviceId": "dexcom-1",
            "time": time,
            "value": value,
            "units": "mmol/L",
            "_groupId": "g1"
        })
        .as_object()
        .unwrap()
        .clone();
        attach_ids(&mut d, &["type", "deviceId", "time"]).unwrap();
        d
    }

    #[tokio::test]
    async fn test_insert_stamps_generation_zero() {
        let store = VersionedStore::new(MemoryCollection::new());
        let stored = store.insert_datum(cbg("2014-01-01T00:00:00.000Z", 5.5)).await.unwrap();
        assert_eq!(stored["_sequenceId"], 0);
        assert_eq!(stored["_active"], true);
        assert!(stored.contains_key("createdTime"));
    }

    #[tokio::test]
    async fn test_insert_duplicate_is_classified() {
        let store = VersionedStore::new(MemoryCollection::new());
        let d = cbg("2014-01-01T00:00:00.000Z", 5.5);
        store.insert_datum(d.clone()).await.unwrap();
        let err = store.insert_datum(d).await.unwrap_err();
        assert!(err.is_duplicate());
    }

    #[tokio::test]
    async fn test_update_archives_previous_generation() {
        let store = VersionedStore::new(MemoryCollection::new());
        let stored = store.insert_datum(cbg("2014-01-01T00:00:00.000Z", 5.5)).await.unwrap();
        let key = stored["_id"].as_str().unwrap().to_string();

        let mut changed = stored.clone();
        changed.insert("value".to_string(), json!(6.1));
        let updated = store.update_datum(changed).await.unwrap();
        assert_eq!(updated["_sequenceId"], 1);
        assert_eq!(updated["createdTime"], stored["createdTime"]);
        assert!(updated.contains_key("modifiedTime"));

        let archive = store.collection().find_one(&archive_key(&key, 0)).await.unwrap().unwrap();
        assert_eq!(archive["_active"], false);
        assert_eq!(archive["value"], json!(5.5));

        let live = store.get_datum(stored["id"].as_str().unwrap(), "g1").await.unwrap().unwrap();
        assert_eq!(live["value"], json!(6.1));
    }

    #[tokio::test]
    async fn test_update_missing_target() {
        let store = VersionedStore::new(MemoryCollection::new());
        let err = store.update_datum(cbg("2014-01-01T00:00:00.000Z", 5.5)).await.unwrap_err();
        assert!(matches!(err, IngestError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_gives_up_when_sequence_is_always_claimed() {
        let store = VersionedStore::new(MemoryCollection::new()).with_max_update_attempts(3);
        let stored = store.insert_datum(cbg("2014-01-01T00:00:00.000Z", 5.5)).await.unwrap();
        let key = stored["_id"].as_str().unwrap().to_string();

        // Someone else holds the archive slot for generation 0 but never advanced the live row
        let mut squatter = stored.clone();
        squatter.insert("_id".to_string(), json!(archive_key(&key, 0)));
        store.collection().insert_one(squatter).await.unwrap();

        let err = store.update_datum(stored).await.unwrap_err();
        assert!(matches!(err, IngestError::Contention { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_store_data_keeps_going() {
        let store = VersionedStore::new(MemoryCollection::new());
        let a = cbg("2014-01-01T00:00:00.000Z", 5.5);
        let b = cbg("2014-01-01T00:05:00.000Z", 5.6);
        let mut no_key = a.clone();
        no_key.remove("_id");

        let report = store.store_data(vec![a.clone(), a, no_key, b]).await;
        assert_eq!(report.inserted, 2);
        assert_eq!(report.duplicates, vec![1]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, 2);
    }

    #[tokio::test]
    async fn test_get_datum_before_finds_latest_prior() {
        let store = VersionedStore::new(MemoryCollection::new());
        store.insert_datum(cbg("2014-01-01T00:00:00.000Z", 5.5)).await.unwrap();
        store.insert_datum(cbg("2014-01-01T00:05:00.000Z", 5.6)).await.unwrap();
        store.insert_datum(cbg("2014-01-01T00:10:00.000Z", 5.7)).await.unwrap();

        let query = PriorQuery {
            group_id: "g1".to_string(),
            datum_type: "cbg".to_string(),
            device_id: "dexcom-1".to_string(),
            source: None,
            before: parse_time("2014-01-01T00:10:00.000Z").unwrap(),
        };
        let prior = store.get_datum_before(&query).await.unwrap().unwrap();
        assert_eq!(prior["time"], "2014-01-01T00:05:00.000Z");

        let other_source = PriorQuery { source: Some("carelink".to_string()), ..query };
        assert!(store.get_datum_before(&other_source).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_data_removes_group() {
        let store = VersionedStore::new(MemoryCollection::new());
        let stored = store.insert_datum(cbg("2014-01-01T00:00:00.000Z", 5.5)).await.unwrap();
        store.update_datum(stored).await.unwrap();
        assert_eq!(store.delete_data("g1").await.unwrap(), 2);
        assert!(store.collection().is_empty().await);
    }
}
