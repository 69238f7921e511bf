//! Run metadata accumulated during an export.
//!
//! The `RunMetadata` struct collects the structural documents of a run while the
//! data documents stream past, and is written once at the end as a JSON sidecar
//! next to the CSV files:
//!
//! ```text
//! {"start": {...},
//!  "descriptors": {"<stream_name>": [{...}, {...}, ...], ...},
//!  "stop": {...}}
//! ```
//!
//! A stream declared by several descriptors (e.g. after a device was reconfigured
//! mid-run) keeps all of them, in declaration order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;

use crate::data::{OpenMode, Sink, SinkManager, RUN_METADATA};
use crate::error::{ExportResult, ResourceError};

/// Captures the structural documents of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// The run-start document.
    pub start: Option<Value>,
    /// Descriptor documents by stream name.
    pub descriptors: BTreeMap<String, Vec<Value>>,
    /// The run-stop document.
    pub stop: Option<Value>,
}

impl RunMetadata {
    /// Empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the run-start payload.
    pub fn record_start(&mut self, doc: Value) {
        self.start = Some(doc);
    }

    /// Append a descriptor payload under its stream name.
    pub fn record_descriptor(&mut self, stream_name: &str, doc: Value) {
        self.descriptors
            .entry(stream_name.to_string())
            .or_default()
            .push(doc);
    }

    /// Keep the run-stop payload.
    pub fn record_stop(&mut self, doc: Value) {
        self.stop = Some(doc);
    }

    /// Sidecar file name for a templated prefix.
    ///
    /// Trailing separators are dropped so `"u1-"` yields `u1_meta.json`; a prefix
    /// that is nothing but separators falls back to `fallback` (the run uid).
    pub fn sidecar_name(prefix: &str, fallback: &str) -> String {
        let base = prefix.trim_end_matches(['-', '_', '.', ' ']);
        let base = if base.is_empty() { fallback } else { base };
        format!("{base}_meta.json")
    }

    /// Serialize and write the sidecar through `manager` in a single write.
    pub fn write_sidecar<M: SinkManager + ?Sized>(
        &self,
        manager: &mut M,
        name: &str,
        mode: OpenMode,
    ) -> ExportResult<()> {
        let mut bytes = serde_json::to_vec_pretty(self).map_err(|e| ResourceError::Write {
            name: name.to_string(),
            source: e.into(),
        })?;
        bytes.push(b'\n');

        let mut sink = manager.open(RUN_METADATA, name, mode)?;
        sink.write_all(&bytes)
            .and_then(|_| sink.sync())
            .map_err(|source| ResourceError::Write {
                name: name.to_string(),
                source,
            })?;

        tracing::info!("Wrote run metadata '{}' ({} bytes)", name, bytes.len());
        Ok(())
    }
}
