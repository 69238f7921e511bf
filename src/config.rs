//! Export configuration using Figment
//!
//! Options are layered, lowest precedence first:
//! 1. Built-in defaults (`header = true`, `index_label = "time"`, `mode = "append"`,
//!    `flush = false`, `file_prefix = "{uid}-"`)
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `DAQ_EXPORT_`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! DAQ_EXPORT_INDEX_LABEL=timestamp
//! DAQ_EXPORT_FLUSH=true
//! DAQ_EXPORT_FILE_PREFIX="{plan_name}-{scan_id}-"
//! ```
//!
//! # Example
//!
//! ```no_run
//! use daq_csv_export::config::ExportConfig;
//!
//! let config = ExportConfig::load_from("export.toml")?;
//! println!("Index column: {}", config.index_label);
//! # Ok::<(), daq_csv_export::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Name of the trailing sequence-number column.
pub const SEQ_NUM_COLUMN: &str = "seq_num";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "DAQ_EXPORT_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The layered configuration could not be extracted.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// A value parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// How a stream's sink is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Refuse to open over an existing artifact; batches append to the new one.
    #[default]
    Append,
    /// Truncate an existing artifact of the same name on open.
    Truncate,
}

/// Options recognized by the exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Emit a header row on the first write to each stream.
    #[serde(default = "default_header")]
    pub header: bool,
    /// Name of the row-index column.
    #[serde(default = "default_index_label")]
    pub index_label: String,
    /// Open mode for stream sinks.
    #[serde(default)]
    pub mode: WriteMode,
    /// Sync each sink to durable storage after every batch.
    #[serde(default)]
    pub flush: bool,
    /// Filename prefix template, resolved against the run-start document.
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

fn default_header() -> bool {
    true
}

fn default_index_label() -> String {
    "time".to_string()
}

fn default_file_prefix() -> String {
    "{uid}-".to_string()
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            header: default_header(),
            index_label: default_index_label(),
            mode: WriteMode::default(),
            flush: false,
            file_prefix: default_file_prefix(),
        }
    }
}

impl ExportConfig {
    /// Load defaults overridden by `DAQ_EXPORT_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::extract(Self::base_figment())
    }

    /// Load defaults, then the TOML file at `path`, then environment overrides.
    ///
    /// A missing file is not an error; figment treats it as an empty layer.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX));
        Self::extract(figment)
    }

    fn base_figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default())).merge(Env::prefixed(ENV_PREFIX))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - `index_label` is non-empty and does not collide with `seq_num`
    /// - `file_prefix` contains no path separators
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.index_label.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "index_label cannot be empty".to_string(),
            ));
        }
        if self.index_label == SEQ_NUM_COLUMN {
            return Err(ConfigError::ValidationError(format!(
                "index_label cannot be '{SEQ_NUM_COLUMN}', it is reserved for sequence numbers"
            )));
        }
        if self.file_prefix.contains(['/', '\\']) {
            return Err(ConfigError::ValidationError(format!(
                "file_prefix '{}' must not contain path separators",
                self.file_prefix
            )));
        }
        Ok(())
    }

    /// Set whether header rows are written.
    pub fn with_header(mut self, header: bool) -> Self {
        self.header = header;
        self
    }

    /// Set the index column label.
    pub fn with_index_label(mut self, label: &str) -> Self {
        self.index_label = label.to_string();
        self
    }

    /// Set how existing artifacts are treated.
    pub fn with_mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set whether sinks are synced after every batch.
    pub fn with_flush(mut self, flush: bool) -> Self {
        self.flush = flush;
        self
    }

    /// Set the file prefix template.
    pub fn with_file_prefix(mut self, prefix: &str) -> Self {
        self.file_prefix = prefix.to_string();
        self
    }
}
