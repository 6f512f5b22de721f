//! Configuration management for the ingest engine
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (ingest.toml)
//! - Environment variables (INGEST__*)
//!
//! ## Example config file (ingest.toml):
//! ```toml
//! [store]
//! update_max_attempts = 10
//!
//! [summary]
//! buffer_secs = 90
//! batch_multiple = 1000
//! max_request_secs = 60
//!
//! [upload]
//! uploader_name = "tidepool-uploader"
//! minimum_version = "0.99.0"
//! ```

use std::time::Duration;

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};
use crate::version::parse_minimum;

/// Main configuration for the ingest engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Versioned store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Summary invalidation settings
    #[serde(default)]
    pub summary: SummaryConfig,

    /// Upload record policy
    #[serde(default)]
    pub upload: UploadConfig,
}

/// Versioned store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Attempts at the archive-then-activate update before giving up
    #[serde(default = "default_update_max_attempts")]
    pub update_max_attempts: u32,
}

/// Summary invalidation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryConfig {
    /// Delay before recomputing when more chunks of an upload are expected
    #[serde(default = "default_buffer_secs")]
    pub buffer_secs: u64,

    /// Persisted counts that are multiples of this suggest a chunked upload
    #[serde(default = "default_batch_multiple")]
    pub batch_multiple: usize,

    /// Longest a single ingest request may run
    #[serde(default = "default_max_request_secs")]
    pub max_request_secs: u64,

    /// How far back a record may be and still mark a summary outdated
    #[serde(default = "default_past_window_days")]
    pub past_window_days: i64,

    /// How far ahead a record may be and still mark a summary outdated
    #[serde(default = "default_future_window_days")]
    pub future_window_days: i64,
}

/// Upload record configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Name the canonical uploader reports in its version string
    #[serde(default = "default_uploader_name")]
    pub uploader_name: String,

    /// Oldest canonical uploader accepted
    #[serde(default = "default_minimum_version")]
    pub minimum_version: String,
}

// Default value functions
fn default_update_max_attempts() -> u32 {
    10
}

fn default_buffer_secs() -> u64 {
    90
}

fn default_batch_multiple() -> usize {
    1000
}

fn default_max_request_secs() -> u64 {
    60
}

fn default_past_window_days() -> i64 {
    730
}

fn default_future_window_days() -> i64 {
    1
}

fn default_uploader_name() -> String {
    "tidepool-uploader".to_string()
}

fn default_minimum_version() -> String {
    "0.99.0".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            update_max_attempts: default_update_max_attempts(),
        }
    }
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            buffer_secs: default_buffer_secs(),
            batch_multiple: default_batch_multiple(),
            max_request_secs: default_max_request_secs(),
            past_window_days: default_past_window_days(),
            future_window_days: default_future_window_days(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            uploader_name: default_uploader_name(),
            minimum_version: default_minimum_version(),
        }
    }
}

impl SummaryConfig {
    pub fn buffer(&self) -> Duration {
        Duration::from_secs(self.buffer_secs)
    }
}

impl IngestConfig {
    /// Load configuration from default locations
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from a specific file
    pub fn load_from(config_path: Option<&str>) -> std::result::Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // Load from default locations
        let config_locations = ["ingest.toml", ".ingest.toml", "config/ingest.toml"];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // Load from XDG config directory
        if let Some(config_dir) = directories::ProjectDirs::from("org", "devicedata", "ingest") {
            let xdg_config = config_dir.config_dir().join("ingest.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        // Load from specified path
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Load from environment variables (INGEST__*)
        builder = builder.add_source(
            Environment::with_prefix("INGEST")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.store.update_max_attempts == 0 {
            return Err(IngestError::Registration(
                "store.update_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.summary.batch_multiple == 0 {
            return Err(IngestError::Registration(
                "summary.batch_multiple must be at least 1".to_string(),
            ));
        }
        // A chunked upload must never trigger more than one redundant recompute
        if self.summary.buffer_secs <= self.summary.max_request_secs {
            return Err(IngestError::Registration(format!(
                "summary.buffer_secs ({}) must exceed summary.max_request_secs ({})",
                self.summary.buffer_secs, self.summary.max_request_secs
            )));
        }
        parse_minimum(&self.upload.minimum_version).map_err(|e| {
            IngestError::Registration(format!("upload.minimum_version: {}", e))
        })?;
        Ok(())
    }
}
