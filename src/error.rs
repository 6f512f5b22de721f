//! Error types for the ingest engine

use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// Result type for ingest operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Ingest engine errors
#[derive(Error, Debug)]
pub enum IngestError {
    /// Malformed or out-of-range field. Never reaches the store.
    #[error("{}", validation_message(.field, .message))]
    Validation {
        field: Option<String>,
        message: String,
    },

    /// Structurally valid but rejected by policy (e.g. outdated uploader)
    #[error("{message}")]
    BusinessRule {
        code: String,
        field: String,
        message: String,
    },

    /// Content-addressed id collision; benign, the datum is already stored
    #[error("Duplicate datum: {id}")]
    Duplicate { id: String },

    /// Update retries exhausted; safe to retry the request
    #[error("Contention updating {id}: gave up after {attempts} attempts")]
    Contention { id: String, attempts: u32 },

    #[error("{what} not found: {id}")]
    NotFound { what: String, id: String },

    #[error("Store error: {0}")]
    Upstream(#[from] StoreError),

    /// Programming error while wiring handlers or hash fields
    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config_crate::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn validation_message(field: &Option<String>, message: &str) -> String {
    match field {
        Some(field) => format!("{} {}", field, message),
        None => message.to_string(),
    }
}

impl IngestError {
    /// Build a validation error tagged with a field path
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        IngestError::Validation {
            field: Some(field.into()),
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>, id: impl Into<String>) -> Self {
        IngestError::NotFound {
            what: what.into(),
            id: id.into(),
        }
    }

    /// HTTP-equivalent status code for the boundary layer
    pub fn status_code(&self) -> u16 {
        match self {
            IngestError::Validation { .. } | IngestError::BusinessRule { .. } => 400,
            IngestError::NotFound { .. } => 404,
            IngestError::Duplicate { .. } => 409,
            IngestError::Contention { .. } => 503,
            IngestError::Upstream(_)
            | IngestError::Registration(_)
            | IngestError::Config(_)
            | IngestError::Json(_) => 500,
        }
    }

    /// Machine-readable category, when one exists
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            IngestError::Validation { .. } => Some("validation"),
            IngestError::BusinessRule { .. } => Some("business"),
            IngestError::Duplicate { .. } => Some("duplicate"),
            IngestError::Contention { .. } => Some("contention"),
            IngestError::NotFound { .. } => Some("notFound"),
            _ => None,
        }
    }

    pub fn error_field(&self) -> Option<&str> {
        match self {
            IngestError::Validation { field, .. } => field.as_deref(),
            IngestError::BusinessRule { field, .. } => Some(field),
            _ => None,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, IngestError::Duplicate { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Contention { .. } | IngestError::Upstream(_))
    }

    /// Flatten into the wire shape returned per record
    pub fn to_body(&self) -> ErrorBody {
        let code = match self {
            IngestError::BusinessRule { code, .. } => Some(code.clone()),
            _ => None,
        };
        ErrorBody {
            status_code: self.status_code(),
            message: self.to_string(),
            error_code: self.error_code().map(String::from),
            code,
            error_field: self.error_field().map(String::from),
        }
    }
}

/// Structured per-record error as seen by callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub status_code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_field: Option<String>,
}
