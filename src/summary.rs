//! Summary invalidation
//!
//! After a batch is stored, downstream rollups covering the affected data are
//! marked outdated. Large uploads arrive in fixed-size chunks, so a batch whose
//! persisted count is an exact multiple of the chunk size probably has more
//! chunks behind it; those recomputes are pushed back by a buffer instead of
//! being scheduled immediately.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::SummaryConfig;
use crate::datum::{fields, get_str, parse_time, Datum};
use crate::error::Result;

/// Rollup categories that track ingested data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryType {
    Cgm,
    Bgm,
}

impl SummaryType {
    /// Category a datum type feeds, if any
    pub fn for_datum_type(datum_type: &str) -> Option<Self> {
        match datum_type {
            "cbg" => Some(SummaryType::Cgm),
            "smbg" => Some(SummaryType::Bgm),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryType::Cgm => "cgm",
            SummaryType::Bgm => "bgm",
        }
    }
}

impl fmt::Display for SummaryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutdatedReason {
    /// More chunks of the same upload are likely on their way
    LegacyDataAdded,
    LegacyUploadCompleted,
}

/// One "mark outdated" instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryUpdate {
    pub user_id: String,
    pub summary_type: SummaryType,
    pub outdated_since: DateTime<Utc>,
    pub reason: OutdatedReason,
}

/// Where outdated marks are delivered
#[async_trait]
pub trait SummarySink: Send + Sync {
    async fn mark_outdated(
        &self,
        user_id: &str,
        summary_type: SummaryType,
        outdated_since: DateTime<Utc>,
        reason: OutdatedReason,
    ) -> Result<()>;
}

/// Sink that only records what it was told
#[derive(Debug, Default)]
pub struct MemorySummarySink {
    updates: Mutex<Vec<SummaryUpdate>>,
}

impl MemorySummarySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn updates(&self) -> Vec<SummaryUpdate> {
        self.updates.lock().await.clone()
    }
}

#[async_trait]
impl SummarySink for MemorySummarySink {
    async fn mark_outdated(
        &self,
        user_id: &str,
        summary_type: SummaryType,
        outdated_since: DateTime<Utc>,
        reason: OutdatedReason,
    ) -> Result<()> {
        self.updates.lock().await.push(SummaryUpdate {
            user_id: user_id.to_string(),
            summary_type,
            outdated_since,
            reason,
        });
        Ok(())
    }
}

/// Decides which summaries a batch invalidates, and from when
#[derive(Debug, Clone)]
pub struct SummaryPolicy {
    buffer: Duration,
    batch_multiple: usize,
    past_window: Duration,
    future_window: Duration,
}

impl Default for SummaryPolicy {
    fn default() -> Self {
        Self::from_config(&SummaryConfig::default())
    }
}

impl SummaryPolicy {
    pub fn from_config(config: &SummaryConfig) -> Self {
        Self {
            buffer: Duration::seconds(config.buffer_secs as i64),
            batch_multiple: config.batch_multiple.max(1),
            past_window: Duration::days(config.past_window_days),
            future_window: Duration::days(config.future_window_days),
        }
    }

    pub fn reason(&self, persisted: usize) -> OutdatedReason {
        if persisted > 0 && persisted % self.batch_multiple == 0 {
            OutdatedReason::LegacyDataAdded
        } else {
            OutdatedReason::LegacyUploadCompleted
        }
    }

    pub fn outdated_since(&self, reason: OutdatedReason, now: DateTime<Utc>) -> DateTime<Utc> {
        match reason {
            OutdatedReason::LegacyDataAdded => now + self.buffer,
            OutdatedReason::LegacyUploadCompleted => now,
        }
    }

    /// Categories with at least one record inside the relevance window
    pub fn affected(&self, data: &[Datum], now: DateTime<Utc>) -> BTreeSet<SummaryType> {
        let earliest = now - self.past_window;
        let latest = now + self.future_window;
        data.iter()
            .filter_map(|datum| {
                let summary_type = get_str(datum, fields::TYPE).and_then(SummaryType::for_datum_type)?;
                let time = get_str(datum, fields::TIME).and_then(parse_time)?;
                (time >= earliest && time <= latest).then_some(summary_type)
            })
            .collect()
    }

    /// One update per affected category
    pub fn plan(&self, user_id: &str, data: &[Datum], persisted: usize, now: DateTime<Utc>) -> Vec<SummaryUpdate> {
        let reason = self.reason(persisted);
        let outdated_since = self.outdated_since(reason, now);
        self.affected(data, now)
            .into_iter()
            .map(|summary_type| SummaryUpdate {
                user_id: user_id.to_string(),
                summary_type,
                outdated_since,
                reason,
            })
            .collect()
    }
}
