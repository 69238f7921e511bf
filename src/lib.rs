//! Core library for the daq-csv-export tool.
//!
//! Consumes the document stream of one experiment run (start, descriptors,
//! events, stop) and writes one CSV file per data stream plus a JSON sidecar
//! with the run's structural metadata. Used by the `daq-csv-export` binary and
//! by acquisition pipelines that want a durable snapshot of a run.

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod export;
pub mod metadata;

pub use config::ExportConfig;
pub use error::{ExportError, ExportResult};
pub use export::{export, export_documents, export_to_directory, try_export};
