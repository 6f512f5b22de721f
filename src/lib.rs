//! Device Datum Ingest Engine
//!
//! Validation, identity and versioned storage for medical-device telemetry
//! ("datums"): glucose readings, insulin delivery, pump settings and device
//! status changes.
//!
//! ## Features
//!
//! - **Per-Type Schemas**: Composable field checks, dispatched on `type` and a
//!   secondary discriminator such as `deliveryType` or `subType`
//! - **Series Repair**: Later records correct or annotate the earlier records
//!   they refer to
//! - **Content-Addressed Identity**: Re-ingesting a datum always yields the same
//!   storage key, so uploads are idempotent
//! - **Versioned Storage**: Optimistic concurrency over single-document atomic
//!   operations, with every superseded generation archived
//! - **Summary Invalidation**: Batches mark downstream rollups outdated
//!
//! ## Architecture
//!
//! ```text
//! raw batch ─▶ TypeRegistry ─▶ validation ─▶ transform ─▶ ids ─▶ VersionedStore
//!                                               │                     │
//!                                               └──── DatumLookup ◀───┘
//!                                  (once per batch) SummaryPolicy ─▶ SummarySink
//! ```

pub mod config;
pub mod datum;
pub mod error;
pub mod identity;
pub mod ingest;
pub mod registry;
pub mod store;
pub mod summary;
pub mod types;
pub mod units;
pub mod validation;
pub mod version;

pub use config::IngestConfig;
pub use datum::Datum;
pub use error::{ErrorBody, IngestError, Result};
pub use identity::{generate_dedup_hash, generate_id, DedupHashRegistry};
pub use ingest::{BatchOwner, BatchResult, Ingestor, RecordError, RecordOutcome};
pub use registry::{DatumType, Transform, TypeRegistry, TypeSpec};
pub use store::{Collection, DatumLookup, MemoryCollection, PriorQuery, StoreError, VersionedStore};
pub use summary::{MemorySummarySink, OutdatedReason, SummaryPolicy, SummarySink, SummaryType, SummaryUpdate};
pub use version::ClientVersion;
