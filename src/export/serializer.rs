//! Stream writer state: turns routed documents into per-stream CSV files.
//!
//! The serializer owns one sink per stream name, opened lazily on the first batch
//! that has at least one tabular field. Each stream gets exactly one header row,
//! written with its first non-empty batch; later batches append rows only.
//!
//! # Run State
//!
//! ```text
//! Idle ──start──> RunSeen ──descriptor──> StreamsDiscovered ⇄ Writing ──stop──> Stopped
//! ```
//!
//! A second run-start is rejected in every state. Documents arriving after
//! `Stopped` are dropped with a warning.
//!
//! # Limitations
//!
//! The first written batch fixes a stream's columns. Later batches are written in
//! that order: a missing field leaves its cell empty and a field outside the
//! established set is dropped with a warning.
//!
//! Fields whose per-row values are nested arrays (images, volumes) or objects are
//! left out of the CSV entirely. They are still described in the metadata sidecar.

use serde_json::Value;
use std::collections::HashMap;

use crate::config::{ExportConfig, WriteMode, SEQ_NUM_COLUMN};
use crate::data::{Artifacts, OpenMode, Sink, SinkManager, TableFragment};
use crate::error::{ExportError, ExportResult, ProtocolError, ResourceError};
use crate::experiment::{Column, DataBatch, Descriptor, RunStart, RunStop};
use crate::metadata::RunMetadata;

use super::router::DocumentRouter;
use super::template::{render_prefix, sanitize_file_name};

/// Lifecycle of the run being exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Nothing received yet
    Idle,
    /// Run-start accepted
    RunSeen,
    /// At least one descriptor declared since the last write
    StreamsDiscovered,
    /// Rows have been written
    Writing,
    /// Run-stop received; stream sinks are closed
    Stopped,
}

/// Open output for one stream.
struct StreamSink {
    name: String,
    sink: Box<dyn Sink>,
    has_header: bool,
    /// Data columns fixed by the first write, excluding index and `seq_num`
    columns: Vec<String>,
    rows_written: usize,
}

impl StreamSink {
    fn close(mut self) -> ExportResult<()> {
        self.sink.sync().map_err(|source| ResourceError::Write {
            name: self.name.clone(),
            source,
        })?;
        tracing::info!(
            "Closed stream file '{}' ({} rows)",
            self.name,
            self.rows_written
        );
        Ok(())
    }
}

/// Serialize a run's documents to one CSV per stream plus a JSON sidecar.
pub struct Serializer<M: SinkManager> {
    manager: M,
    config: ExportConfig,
    state: RunState,
    run_uid: Option<String>,
    file_prefix: String,
    stream_names: HashMap<String, String>,
    /// Open sinks keyed by stream name, in opening order
    streams: Vec<(String, StreamSink)>,
    metadata: RunMetadata,
    closed: bool,
}

impl<M: SinkManager> Serializer<M> {
    /// Create a serializer writing through `manager`; fails on invalid config.
    pub fn new(manager: M, config: ExportConfig) -> ExportResult<Self> {
        config.validate()?;
        Ok(Self {
            manager,
            config,
            state: RunState::Idle,
            run_uid: None,
            file_prefix: String::new(),
            stream_names: HashMap::new(),
            streams: Vec::new(),
            metadata: RunMetadata::new(),
            closed: false,
        })
    }

    /// Current position in the run lifecycle.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Artifacts created so far, by label.
    pub fn artifacts(&self) -> &Artifacts {
        self.manager.artifacts()
    }

    /// The underlying sink manager.
    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Documents accumulated for the metadata sidecar.
    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// Number of stream sinks currently open.
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    fn open_mode(&self) -> OpenMode {
        match self.config.mode {
            WriteMode::Append => OpenMode::CreateNew,
            WriteMode::Truncate => OpenMode::Truncate,
        }
    }

    fn accepts(&self, document: &str) -> bool {
        if self.state == RunState::Stopped {
            tracing::warn!("Ignoring '{}' document received after run-stop", document);
            return false;
        }
        true
    }

    fn require_start(&self, document: &str) -> ExportResult<()> {
        if self.state == RunState::Idle {
            return Err(ProtocolError::MissingRunStart {
                document: document.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn stream_index(&mut self, stream_name: &str) -> ExportResult<usize> {
        if let Some(index) = self.streams.iter().position(|(name, _)| name == stream_name) {
            return Ok(index);
        }

        let filename = format!(
            "{}{}.csv",
            self.file_prefix,
            sanitize_file_name(stream_name)
        );
        let sink = self
            .manager
            .open(crate::data::STREAM_DATA, &filename, self.open_mode())?;
        tracing::info!("Created stream file '{}' for '{}'", filename, stream_name);

        self.streams.push((
            stream_name.to_string(),
            StreamSink {
                name: filename,
                sink,
                has_header: false,
                columns: Vec::new(),
                rows_written: 0,
            },
        ));
        Ok(self.streams.len() - 1)
    }

    /// Flush and release every open stream sink.
    ///
    /// All sinks are closed even when some fail; the first failure is returned,
    /// or `FinalizeFailed` when several did.
    pub fn close_streams(&mut self) -> ExportResult<()> {
        let errors: Vec<ExportError> = self
            .streams
            .drain(..)
            .filter_map(|(_, stream)| stream.close().err())
            .collect();
        collapse(errors)
    }

    /// Close all sinks, then write the metadata sidecar. Idempotent.
    pub fn close(&mut self) -> ExportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut errors = Vec::new();
        if let Err(e) = self.close_streams() {
            errors.push(e);
        }

        match &self.run_uid {
            Some(run_uid) => {
                let name = RunMetadata::sidecar_name(&self.file_prefix, run_uid);
                let mode = self.open_mode();
                if let Err(e) = self.metadata.write_sidecar(&mut self.manager, &name, mode) {
                    errors.push(e);
                }
            }
            None => tracing::warn!("No run-start seen; skipping run metadata"),
        }

        if let Err(e) = self.manager.close() {
            errors.push(e);
        }
        collapse(errors)
    }
}

fn collapse(mut errors: Vec<ExportError>) -> ExportResult<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(ExportError::FinalizeFailed(errors)),
    }
}

fn to_json<T: serde::Serialize>(doc: &T, name: &str) -> ExportResult<serde_json::Value> {
    serde_json::to_value(doc).map_err(|source| {
        ProtocolError::InvalidDocument {
            name: name.to_string(),
            source,
        }
        .into()
    })
}

impl<M: SinkManager> DocumentRouter for Serializer<M> {
    fn start(&mut self, doc: &RunStart) -> ExportResult<()> {
        if self.state != RunState::Idle {
            return Err(ProtocolError::DuplicateRunStart.into());
        }

        self.file_prefix = render_prefix(&self.config.file_prefix, doc)?;
        self.run_uid = Some(doc.uid.clone());
        self.metadata.record_start(to_json(doc, "start")?);
        self.state = RunState::RunSeen;
        tracing::info!("Exporting run '{}' with prefix '{}'", doc.uid, self.file_prefix);
        Ok(())
    }

    fn descriptor(&mut self, doc: &Descriptor) -> ExportResult<()> {
        if !self.accepts("descriptor") {
            return Ok(());
        }
        self.require_start("descriptor")?;

        match self.stream_names.get(&doc.uid) {
            Some(existing) if existing != &doc.name => {
                return Err(ProtocolError::DuplicateDescriptor {
                    descriptor: doc.uid.clone(),
                    existing: existing.clone(),
                    name: doc.name.clone(),
                }
                .into());
            }
            Some(_) => {}
            None => {
                self.stream_names.insert(doc.uid.clone(), doc.name.clone());
            }
        }
        self.metadata
            .record_descriptor(&doc.name, to_json(doc, "descriptor")?);
        self.state = RunState::StreamsDiscovered;
        tracing::debug!("Descriptor '{}' declares stream '{}'", doc.uid, doc.name);
        Ok(())
    }

    fn event_page(&mut self, batch: &DataBatch) -> ExportResult<()> {
        if !self.accepts("event_page") {
            return Ok(());
        }
        self.require_start("event_page")?;

        let stream_name = self
            .stream_names
            .get(&batch.descriptor)
            .cloned()
            .ok_or_else(|| ProtocolError::UnknownDescriptor {
                descriptor: batch.descriptor.clone(),
            })?;
        batch.verify_filled()?;

        let mut tabular = Vec::with_capacity(batch.columns.len());
        for column in &batch.columns {
            if column.is_tabular() {
                tabular.push(column);
            } else {
                tracing::debug!(
                    "Dropping non-tabular field '{}' from stream '{}'",
                    column.name,
                    stream_name
                );
            }
        }
        if tabular.is_empty() || batch.is_empty() {
            return Ok(());
        }

        let index = self.stream_index(&stream_name)?;
        let (_, stream) = &mut self.streams[index];
        if stream.columns.is_empty() {
            stream.columns = tabular.iter().map(|c| c.name.clone()).collect();
        }

        let dropped: Vec<&str> = tabular
            .iter()
            .filter(|c| !stream.columns.contains(&c.name))
            .map(|c| c.name.as_str())
            .collect();
        if !dropped.is_empty() {
            tracing::warn!(
                "Stream '{}' has no column for fields {:?}; dropping them",
                stream_name,
                dropped
            );
        }
        let missing: Vec<Column> = stream
            .columns
            .iter()
            .filter(|name| !tabular.iter().any(|c| &c.name == *name))
            .map(|name| Column::new(name.as_str(), vec![Value::Null; batch.len()]))
            .collect();
        if !missing.is_empty() {
            tracing::warn!(
                "Stream '{}' batch lacks fields {:?}; leaving them empty",
                stream_name,
                missing.iter().map(|c| c.name.as_str()).collect::<Vec<_>>()
            );
        }

        let seq_num = Column::new(
            SEQ_NUM_COLUMN,
            batch.seq_num.iter().map(|&n| n.into()).collect(),
        );
        let mut fragment = TableFragment::new(&self.config.index_label, &batch.time);
        for name in &stream.columns {
            let column = tabular
                .iter()
                .copied()
                .chain(missing.iter())
                .find(|c| &c.name == name);
            if let Some(column) = column {
                fragment = fragment.with_column(column);
            }
        }
        fragment = fragment.with_column(&seq_num);

        let header = self.config.header && !stream.has_header;
        let rows = fragment
            .write_csv(&mut stream.sink, header)
            .map_err(|source| ResourceError::Encode {
                name: stream.name.clone(),
                source,
            })?;
        stream.has_header = true;
        stream.rows_written += rows;

        if self.config.flush {
            stream.sink.sync().map_err(|source| ResourceError::Write {
                name: stream.name.clone(),
                source,
            })?;
        }

        self.state = RunState::Writing;
        Ok(())
    }

    fn stop(&mut self, doc: &RunStop) -> ExportResult<()> {
        if !self.accepts("stop") {
            return Ok(());
        }
        self.require_start("stop")?;

        self.metadata.record_stop(to_json(doc, "stop")?);
        self.state = RunState::Stopped;
        tracing::info!("Run stopped with status '{}'", doc.exit_status);
        self.close_streams()
    }
}

impl<M: SinkManager> Drop for Serializer<M> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                tracing::warn!("Failed to finalize export on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MemoryBufferManager, STREAM_DATA};
    use crate::experiment::{DataKey, Event, EventPage};
    use serde_json::{json, Map};
    use tracing_test::traced_test;

    fn serializer(config: ExportConfig) -> (Serializer<MemoryBufferManager>, MemoryBufferManager) {
        let manager = MemoryBufferManager::new();
        let reader = manager.clone();
        (Serializer::new(manager, config).unwrap(), reader)
    }

    fn started(config: ExportConfig) -> (Serializer<MemoryBufferManager>, MemoryBufferManager) {
        let (mut s, reader) = serializer(config);
        s.start(&RunStart::with_uid("u1")).unwrap();
        s.descriptor(&Descriptor::new("u1", "primary").with_uid("d1"))
            .unwrap();
        (s, reader)
    }

    fn page(descriptor: &str, time: Vec<f64>, seq_num: Vec<u64>, data: serde_json::Value) -> DataBatch {
        let page = EventPage {
            uid: Vec::new(),
            descriptor: descriptor.to_string(),
            seq_num,
            time,
            data: data.as_object().cloned().unwrap_or_default(),
            timestamps: Map::new(),
            filled: Map::new(),
            extra: Map::new(),
        };
        DataBatch::from_event_page(&page).unwrap()
    }

    #[test]
    fn test_header_written_once_across_batches() {
        let (mut s, reader) = started(ExportConfig::default());
        s.event_page(&page("d1", vec![0.1], vec![1], json!({"x": [1]})))
            .unwrap();
        s.event_page(&page("d1", vec![0.2, 0.3], vec![2, 3], json!({"x": [2, 3]})))
            .unwrap();
        s.close().unwrap();

        assert_eq!(
            reader.contents_string("u1-primary.csv").unwrap(),
            "time,x,seq_num\n0.1,1,1\n0.2,2,2\n0.3,3,3\n"
        );
    }

    #[test]
    fn test_header_disabled() {
        let (mut s, reader) = started(ExportConfig::default().with_header(false));
        s.event_page(&page("d1", vec![0.1], vec![1], json!({"x": [1]})))
            .unwrap();
        s.close().unwrap();
        assert_eq!(reader.contents_string("u1-primary.csv").unwrap(), "0.1,1,1\n");
    }

    #[test]
    fn test_custom_index_label() {
        let (mut s, reader) = started(ExportConfig::default().with_index_label("timestamp"));
        s.event_page(&page("d1", vec![5.0], vec![1], json!({"x": [1.5]})))
            .unwrap();
        s.close().unwrap();
        assert_eq!(
            reader.contents_string("u1-primary.csv").unwrap(),
            "timestamp,x,seq_num\n5.0,1.5,1\n"
        );
    }

    #[test]
    fn test_non_tabular_batch_opens_nothing() {
        let (mut s, reader) = started(ExportConfig::default());
        s.event_page(&page(
            "d1",
            vec![0.1],
            vec![1],
            json!({"img": [[[1, 2], [3, 4]]]}),
        ))
        .unwrap();

        assert_eq!(s.open_streams(), 0);
        assert!(reader.contents("u1-primary.csv").is_none());
        s.close().unwrap();
        assert!(!s.artifacts().contains_key(STREAM_DATA));
    }

    #[test]
    fn test_images_dropped_scalars_kept() {
        let (mut s, reader) = started(ExportConfig::default());
        s.event_page(&page(
            "d1",
            vec![0.1],
            vec![1],
            json!({"img": [[[1, 2], [3, 4]]], "x": [7]}),
        ))
        .unwrap();
        s.close().unwrap();
        assert_eq!(
            reader.contents_string("u1-primary.csv").unwrap(),
            "time,x,seq_num\n0.1,7,1\n"
        );
    }

    #[test]
    fn test_unknown_descriptor() {
        let (mut s, _) = started(ExportConfig::default());
        let err = s
            .event_page(&page("nope", vec![0.1], vec![1], json!({"x": [1]})))
            .unwrap_err();
        assert!(matches!(
            err,
            ExportError::Protocol(ProtocolError::UnknownDescriptor { ref descriptor }) if descriptor == "nope"
        ));
    }

    #[test]
    fn test_duplicate_start() {
        let (mut s, _) = started(ExportConfig::default());
        let err = s.start(&RunStart::with_uid("u2")).unwrap_err();
        assert!(matches!(
            err,
            ExportError::Protocol(ProtocolError::DuplicateRunStart)
        ));
    }

    #[test]
    fn test_data_before_start() {
        let (mut s, _) = serializer(ExportConfig::default());
        let err = s
            .descriptor(&Descriptor::new("u1", "primary"))
            .unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_unfilled_data_rejected() {
        let (mut s, _) = started(ExportConfig::default());
        let mut event = Event::new("d1", 1).with_datum("img", "datum-0");
        event.filled.insert("img".to_string(), json!(false));
        let err = s.event_page(&DataBatch::from_event(&event)).unwrap_err();
        assert!(matches!(
            err,
            ExportError::Protocol(ProtocolError::Unfilled { .. })
        ));
    }

    #[test]
    fn test_redeclared_stream_shares_file() {
        let (mut s, reader) = started(ExportConfig::default());
        s.descriptor(
            &Descriptor::new("u1", "primary")
                .with_uid("d2")
                .with_data_key("x", DataKey::scalar("motor")),
        )
        .unwrap();
        s.event_page(&page("d1", vec![0.1], vec![1], json!({"x": [1]})))
            .unwrap();
        s.event_page(&page("d2", vec![0.2], vec![1], json!({"x": [2]})))
            .unwrap();
        s.close().unwrap();

        assert_eq!(
            reader.contents_string("u1-primary.csv").unwrap(),
            "time,x,seq_num\n0.1,1,1\n0.2,2,1\n"
        );
        assert_eq!(s.metadata().descriptors["primary"].len(), 2);
    }

    #[test]
    fn test_state_transitions() {
        let (mut s, _) = serializer(ExportConfig::default());
        assert_eq!(s.state(), RunState::Idle);
        s.start(&RunStart::with_uid("u1")).unwrap();
        assert_eq!(s.state(), RunState::RunSeen);
        s.descriptor(&Descriptor::new("u1", "primary").with_uid("d1"))
            .unwrap();
        assert_eq!(s.state(), RunState::StreamsDiscovered);
        s.event_page(&page("d1", vec![0.1], vec![1], json!({"x": [1]})))
            .unwrap();
        assert_eq!(s.state(), RunState::Writing);
        s.descriptor(&Descriptor::new("u1", "baseline").with_uid("d2"))
            .unwrap();
        assert_eq!(s.state(), RunState::StreamsDiscovered);
        s.stop(&RunStop::success("u1")).unwrap();
        assert_eq!(s.state(), RunState::Stopped);
        assert_eq!(s.open_streams(), 0);
    }

    #[test]
    #[traced_test]
    fn test_documents_after_stop_are_ignored() {
        let (mut s, reader) = started(ExportConfig::default());
        s.stop(&RunStop::success("u1")).unwrap();
        s.event_page(&page("d1", vec![0.1], vec![1], json!({"x": [1]})))
            .unwrap();

        assert_eq!(s.open_streams(), 0);
        assert!(reader.contents("u1-primary.csv").is_none());
        assert!(logs_contain("received after run-stop"));
    }

    #[test]
    #[traced_test]
    fn test_column_drift_is_logged() {
        let (mut s, reader) = started(ExportConfig::default());
        s.event_page(&page("d1", vec![0.1], vec![1], json!({"x": [1]})))
            .unwrap();
        s.event_page(&page("d1", vec![0.2], vec![2], json!({"y": [5]})))
            .unwrap();
        s.close().unwrap();

        assert!(logs_contain("has no column for fields"));
        assert!(logs_contain("leaving them empty"));
        assert_eq!(
            reader.contents_string("u1-primary.csv").unwrap(),
            "time,x,seq_num\n0.1,1,1\n0.2,,2\n"
        );
    }

    #[test]
    fn test_rows_follow_established_column_order() {
        let (mut s, reader) = started(ExportConfig::default());
        for (time, seq, data) in [
            (0.1, 1, json!({"x": [1], "y": [100]})),
            (0.2, 2, json!({"y": [200], "x": [2]})),
            (0.3, 3, json!({"x": [3]})),
        ] {
            s.event_page(&page("d1", vec![time], vec![seq], data))
                .unwrap();
        }
        s.close().unwrap();

        assert_eq!(
            reader.contents_string("u1-primary.csv").unwrap(),
            "time,x,y,seq_num\n0.1,1,100,1\n0.2,2,200,2\n0.3,3,,3\n"
        );
    }

    #[test]
    fn test_descriptor_cannot_change_stream() {
        let (mut s, reader) = started(ExportConfig::default());
        s.event_page(&page("d1", vec![0.1], vec![1], json!({"x": [1]})))
            .unwrap();
        let err = s
            .descriptor(&Descriptor::new("u1", "baseline").with_uid("d1"))
            .unwrap_err();
        assert!(matches!(
            err,
            ExportError::Protocol(ProtocolError::DuplicateDescriptor { ref existing, ref name, .. })
                if existing == "primary" && name == "baseline"
        ));

        s.event_page(&page("d1", vec![0.2], vec![2], json!({"x": [2]})))
            .unwrap();
        s.close().unwrap();
        assert!(reader.contents("u1-baseline.csv").is_none());
        assert_eq!(
            reader.contents_string("u1-primary.csv").unwrap(),
            "time,x,seq_num\n0.1,1,1\n0.2,2,2\n"
        );
    }

    #[test]
    fn test_repeated_descriptor_keeps_stream() {
        let (mut s, reader) = started(ExportConfig::default());
        s.descriptor(&Descriptor::new("u1", "primary").with_uid("d1"))
            .unwrap();
        s.event_page(&page("d1", vec![0.1], vec![1], json!({"x": [1]})))
            .unwrap();
        s.close().unwrap();

        assert_eq!(s.metadata().descriptors["primary"].len(), 2);
        assert_eq!(
            reader.contents_string("u1-primary.csv").unwrap(),
            "time,x,seq_num\n0.1,1,1\n"
        );
    }

    #[test]
    fn test_stream_name_is_made_file_safe() {
        let (mut s, reader) = started(ExportConfig::default());
        s.descriptor(&Descriptor::new("u1", "a/b").with_uid("d2"))
            .unwrap();
        s.event_page(&page("d2", vec![0.1], vec![1], json!({"x": [1]})))
            .unwrap();
        s.close().unwrap();

        assert_eq!(
            reader.contents_string("u1-a_b.csv").unwrap(),
            "time,x,seq_num\n0.1,1,1\n"
        );
        assert!(s.metadata().descriptors.contains_key("a/b"));
    }

    #[test]
    fn test_close_writes_sidecar_once() {
        let (mut s, reader) = started(ExportConfig::default());
        s.close().unwrap();
        s.close().unwrap();
        let sidecar: serde_json::Value =
            serde_json::from_slice(&reader.contents("u1_meta.json").unwrap()).unwrap();
        assert_eq!(sidecar["start"]["uid"], json!("u1"));
        assert_eq!(sidecar["descriptors"]["primary"][0]["uid"], json!("d1"));
    }

    #[test]
    fn test_drop_finalizes() {
        let reader = {
            let (mut s, reader) = started(ExportConfig::default());
            s.event_page(&page("d1", vec![0.1], vec![1], json!({"x": [1]})))
                .unwrap();
            reader
        };
        assert!(reader.contents("u1_meta.json").is_some());
        assert_eq!(
            reader.contents_string("u1-primary.csv").unwrap(),
            "time,x,seq_num\n0.1,1,1\n"
        );
    }
}
