//! Custom error types for the exporter.
//!
//! This module defines the primary error type, `ExportError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures an export can hit, from malformed document streams to sinks that
//! cannot be created.
//!
//! ## Error Hierarchy
//!
//! `ExportError` consolidates two fatal families plus a few boundary errors:
//!
//! - **`Protocol`**: The document stream broke the run protocol: a second run-start,
//!   data referencing a descriptor that was never declared, data that still points at
//!   external storage, or batches whose parallel sequences disagree in length.
//!   Always fatal; the export aborts but every open sink is still closed.
//! - **`Resource`**: A sink could not be created, opened, or written (name collision,
//!   permission failure, disk full). Fatal for the stream and propagated after
//!   finalization.
//! - **`Config`**: Wraps `figment` loading failures and semantic validation errors.
//! - **`Template`**: The file prefix template could not be resolved against the
//!   run-start document.
//! - **`Source`**: The document source itself failed while being pulled.
//! - **`FinalizeFailed`**: More than one sink failed while being closed.
//!
//! By using `#[from]`, `ExportError` can be created from the narrower error types,
//! so handlers propagate with the `?` operator.

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the crate error type.
pub type ExportResult<T> = std::result::Result<T, ExportError>;

/// Top-level error returned by every export operation.
#[derive(Error, Debug)]
pub enum ExportError {
    /// The document stream violated the run protocol.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A destination sink could not be created or written.
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The file prefix template could not be rendered.
    #[error("Invalid file prefix template '{template}': {reason}")]
    Template {
        /// The template as configured.
        template: String,
        /// Why rendering failed.
        reason: String,
    },

    /// The document source failed while being pulled.
    #[error("Document source failed: {0}")]
    Source(String),

    /// Several sinks failed while being closed.
    #[error("Finalization failed with {} errors", .0.len())]
    FinalizeFailed(Vec<ExportError>),
}

impl ExportError {
    /// True for run-protocol violations.
    pub fn is_protocol(&self) -> bool {
        matches!(self, ExportError::Protocol(_))
    }

    /// True for sink creation or write failures.
    pub fn is_resource(&self) -> bool {
        match self {
            ExportError::Resource(_) => true,
            ExportError::FinalizeFailed(errors) => errors.iter().all(ExportError::is_resource),
            _ => false,
        }
    }
}

/// Violations of the start / descriptor / event / stop protocol.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("duplicate run-start: this exporter expects documents from one run only")]
    DuplicateRunStart,

    #[error("data references unknown descriptor '{descriptor}'")]
    UnknownDescriptor { descriptor: String },

    #[error("descriptor '{descriptor}' already declares stream '{existing}', cannot redeclare it as '{name}'")]
    DuplicateDescriptor {
        descriptor: String,
        existing: String,
        name: String,
    },

    #[error("'{document}' document received before the run-start")]
    MissingRunStart { document: String },

    #[error("descriptor '{descriptor}' has unfilled fields {fields:?}; resolve external data before export")]
    Unfilled {
        descriptor: String,
        fields: Vec<String>,
    },

    #[error("malformed data for descriptor '{descriptor}': {reason}")]
    MalformedBatch { descriptor: String, reason: String },

    #[error("invalid '{name}' document: {source}")]
    InvalidDocument {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures of the destination storage.
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("sink '{name}' already exists")]
    SinkExists { name: String },

    #[error("sink name '{name}' is not a plain file name")]
    InvalidName { name: String },

    #[error("failed to open sink '{name}': {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write sink '{name}': {source}")]
    Write {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode rows for sink '{name}': {source}")]
    Encode {
        name: String,
        #[source]
        source: csv::Error,
    },
}
