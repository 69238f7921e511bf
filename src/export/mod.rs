//! Export entry points.
//!
//! Every entry point builds a [`Serializer`], routes the documents through it in
//! order, and closes it on every exit path: normal exhaustion, a source that
//! stops early, or a handler error. Files already written are flushed and closed
//! before any error is returned, so they remain readable (if truncated) CSVs.
//!
//! # Example
//!
//! ```rust
//! use daq_csv_export::config::ExportConfig;
//! use daq_csv_export::data::MemoryBufferManager;
//! use daq_csv_export::export::export;
//! use serde_json::json;
//!
//! let docs = vec![
//!     ("start".to_string(), json!({"uid": "u1", "time": 0.0})),
//!     ("descriptor".to_string(), json!({"uid": "d1", "name": "primary"})),
//!     ("event_page".to_string(), json!({
//!         "descriptor": "d1", "time": [0.1, 0.2], "seq_num": [1, 2],
//!         "data": {"x": [1, 2]}
//!     })),
//!     ("stop".to_string(), json!({"uid": "s1"})),
//! ];
//!
//! let manager = MemoryBufferManager::new();
//! let artifacts = export(docs, manager.clone(), ExportConfig::default())?;
//! assert_eq!(artifacts["stream_data"].len(), 1);
//! assert_eq!(
//!     manager.contents_string("u1-primary.csv").unwrap(),
//!     "time,x,seq_num\n0.1,1,1\n0.2,2,2\n"
//! );
//! # Ok::<(), daq_csv_export::error::ExportError>(())
//! ```

pub mod router;
pub mod serializer;
pub mod template;

pub use router::DocumentRouter;
pub use serializer::{RunState, Serializer};
pub use template::render_prefix;

use serde_json::Value;
use std::fmt::Display;
use std::path::Path;

use crate::config::ExportConfig;
use crate::data::{Artifacts, MultiFileManager, SinkManager};
use crate::error::{ExportError, ExportResult};
use crate::experiment::Document;

/// Export `(name, payload)` pairs through `manager`.
///
/// Returns the artifacts produced, keyed by label (`stream_data`, `run_metadata`).
pub fn export<I, M>(documents: I, manager: M, config: ExportConfig) -> ExportResult<Artifacts>
where
    I: IntoIterator<Item = (String, Value)>,
    M: SinkManager,
{
    try_export(
        documents.into_iter().map(Ok::<_, std::convert::Infallible>),
        manager,
        config,
    )
}

/// Export from a fallible source. A source error stops the export like a
/// handler error does.
pub fn try_export<I, E, M>(documents: I, manager: M, config: ExportConfig) -> ExportResult<Artifacts>
where
    I: IntoIterator<Item = Result<(String, Value), E>>,
    E: Display,
    M: SinkManager,
{
    let mut serializer = Serializer::new(manager, config)?;
    let routed = documents.into_iter().try_for_each(|item| {
        let (name, payload) = item.map_err(|e| ExportError::Source(e.to_string()))?;
        serializer.route_tagged(&name, payload)
    });
    finish(&mut serializer, routed)
}

/// Export typed documents.
pub fn export_documents<I, M>(documents: I, manager: M, config: ExportConfig) -> ExportResult<Artifacts>
where
    I: IntoIterator<Item = Document>,
    M: SinkManager,
{
    let mut serializer = Serializer::new(manager, config)?;
    let routed = documents
        .into_iter()
        .try_for_each(|doc| serializer.route(&doc));
    finish(&mut serializer, routed)
}

/// Export into files under `directory`.
pub fn export_to_directory<I>(
    documents: I,
    directory: impl AsRef<Path>,
    config: ExportConfig,
) -> ExportResult<Artifacts>
where
    I: IntoIterator<Item = (String, Value)>,
{
    export(
        documents,
        MultiFileManager::new(directory.as_ref()),
        config,
    )
}

fn finish<M: SinkManager>(
    serializer: &mut Serializer<M>,
    routed: ExportResult<()>,
) -> ExportResult<Artifacts> {
    let closed = serializer.close();
    match (routed, closed) {
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            tracing::warn!("Export failed and finalization also failed: {}", close_err);
            Err(e)
        }
        (Ok(()), Err(close_err)) => Err(close_err),
        (Ok(()), Ok(())) => Ok(serializer.artifacts().clone()),
    }
}
