//! In-memory collection
//!
//! Every operation takes the lock once, so each call is atomic on its own and
//! nothing spans calls, matching the guarantees of a document database without
//! transactions.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{Collection, PriorQuery, StoreError, StoreResult};
use crate::datum::{fields, get_str, parse_time, Datum};

#[derive(Debug, Default)]
pub struct MemoryCollection {
    docs: RwLock<BTreeMap<String, Datum>>,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row, archives included, ordered by key
    pub async fn documents(&self) -> Vec<Datum> {
        self.docs.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }
}

fn key_of(doc: &Datum) -> StoreResult<String> {
    get_str(doc, fields::INTERNAL_ID)
        .map(String::from)
        .ok_or(StoreError::MissingKey(fields::INTERNAL_ID))
}

#[async_trait]
impl Collection for MemoryCollection {
    async fn insert_one(&self, doc: Datum) -> StoreResult<()> {
        let key = key_of(&doc)?;
        let mut docs = self.docs.write().await;
        if docs.contains_key(&key) {
            return Err(StoreError::DuplicateKey { key });
        }
        docs.insert(key, doc);
        Ok(())
    }

    async fn find_one(&self, key: &str) -> StoreResult<Option<Datum>> {
        Ok(self.docs.read().await.get(key).cloned())
    }

    async fn replace_if_sequence(&self, key: &str, expected_sequence: i64, doc: Datum) -> StoreResult<bool> {
        let mut docs = self.docs.write().await;
        match docs.get_mut(key) {
            Some(current)
                if current.get(fields::SEQUENCE_ID).and_then(Value::as_i64).unwrap_or(0)
                    == expected_sequence =>
            {
                *current = doc;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_latest_before(&self, query: &PriorQuery) -> StoreResult<Option<Datum>> {
        let docs = self.docs.read().await;
        let latest = docs
            .values()
            .filter(|doc| query.matches(doc))
            .filter_map(|doc| {
                let time = get_str(doc, fields::TIME).and_then(parse_time)?;
                Some((time, doc))
            })
            .max_by_key(|(time, _)| *time)
            .map(|(_, doc)| doc.clone());
        Ok(latest)
    }

    async fn delete_group(&self, group_id: &str) -> StoreResult<u64> {
        let mut docs = self.docs.write().await;
        let before = docs.len();
        docs.retain(|_, doc| get_str(doc, fields::GROUP_ID) != Some(group_id));
        Ok((before - docs.len()) as u64)
    }
}
