//! Document model for experiment data streams.
//!
//! A run is delivered as a sequence of `(name, payload)` pairs. The exporter
//! understands these document kinds:
//!
//! - **RunStart**: Experiment intent and metadata (exactly one per run)
//! - **Descriptor**: Schema for one data stream
//! - **Event** / **EventPage** / **BulkEvents**: Measurements, one row, a page of
//!   rows, or the deprecated per-descriptor event lists
//! - **RunStop**: Completion status and summary
//!
//! # Document Flow
//!
//! ```text
//! RunStart (1)
//!    │
//!    ├── Descriptor (1+, one or more per data stream)
//!    │       │
//!    │       └── Event / EventPage / BulkEvents (N, measurements)
//!    │
//! RunStop (1)
//! ```
//!
//! Every payload struct keeps the keys it does not model in a flattened `extra`
//! map, so nothing is lost when documents are echoed into the metadata sidecar.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current time as fractional seconds since the Unix epoch
pub fn now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

/// Document kinds consumed by the exporter
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    /// Run-start
    Start(RunStart),
    /// Stream descriptor
    Descriptor(Descriptor),
    /// Single event
    Event(Event),
    /// Page of events
    EventPage(EventPage),
    /// Legacy per-descriptor event lists
    BulkEvents(BulkEvents),
    /// Run-stop
    Stop(RunStop),
}

impl Document {
    /// Parse a tagged payload.
    ///
    /// Returns `Ok(None)` for tags the exporter does not handle (`resource`,
    /// `datum`, `datum_page`, or anything newer), so unknown kinds never abort
    /// an export.
    pub fn from_tagged(name: &str, payload: Value) -> Result<Option<Self>, ProtocolError> {
        let invalid = |source| ProtocolError::InvalidDocument {
            name: name.to_string(),
            source,
        };
        let doc = match name {
            "start" => Document::Start(serde_json::from_value(payload).map_err(invalid)?),
            "descriptor" => {
                Document::Descriptor(serde_json::from_value(payload).map_err(invalid)?)
            }
            "event" => Document::Event(serde_json::from_value(payload).map_err(invalid)?),
            "event_page" => {
                Document::EventPage(serde_json::from_value(payload).map_err(invalid)?)
            }
            "bulk_events" => {
                Document::BulkEvents(serde_json::from_value(payload).map_err(invalid)?)
            }
            "stop" => Document::Stop(serde_json::from_value(payload).map_err(invalid)?),
            _ => return Ok(None),
        };
        Ok(Some(doc))
    }

    /// Wire tag of this document
    pub fn name(&self) -> &'static str {
        match self {
            Document::Start(_) => "start",
            Document::Descriptor(_) => "descriptor",
            Document::Event(_) => "event",
            Document::EventPage(_) => "event_page",
            Document::BulkEvents(_) => "bulk_events",
            Document::Stop(_) => "stop",
        }
    }

    /// Convert back into a `(name, payload)` pair.
    pub fn into_tagged(self) -> Result<(String, Value), serde_json::Error> {
        let name = self.name().to_string();
        let payload = match self {
            Document::Start(d) => serde_json::to_value(d)?,
            Document::Descriptor(d) => serde_json::to_value(d)?,
            Document::Event(d) => serde_json::to_value(d)?,
            Document::EventPage(d) => serde_json::to_value(d)?,
            Document::BulkEvents(d) => serde_json::to_value(d)?,
            Document::Stop(d) => serde_json::to_value(d)?,
        };
        Ok((name, payload))
    }
}

/// Start document - emitted at the beginning of a run
///
/// Arbitrary run metadata lives in `extra`; its top-level keys are available to
/// the file prefix template (e.g. `{plan_name}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStart {
    /// Unique run identifier
    pub uid: String,
    /// Timestamp when run started
    #[serde(default)]
    pub time: f64,
    /// Remaining run metadata
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RunStart {
    /// Create a run-start with a fresh uid.
    pub fn new() -> Self {
        Self::with_uid(&new_uid())
    }

    /// Create a run-start with a fixed uid.
    pub fn with_uid(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            time: now(),
            extra: Map::new(),
        }
    }

    /// Add a metadata field.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

impl Default for RunStart {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor document - defines schema for event data
///
/// Each descriptor defines a "data stream" with named fields. A run can have
/// several descriptors under the same name when devices are reconfigured
/// mid-run; they all write into that stream's single file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Unique descriptor ID
    pub uid: String,
    /// Links to RunStart
    #[serde(default)]
    pub run_start: String,
    /// Stream name (e.g., "primary", "baseline", "monitor")
    #[serde(default = "default_stream_name")]
    pub name: String,
    /// Schema for data fields
    #[serde(default)]
    pub data_keys: Map<String, Value>,
    /// Timestamp
    #[serde(default)]
    pub time: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_stream_name() -> String {
    "primary".to_string()
}

impl Descriptor {
    /// Create a descriptor for stream `name` of run `run_start`.
    pub fn new(run_start: &str, name: &str) -> Self {
        Self {
            uid: new_uid(),
            run_start: run_start.to_string(),
            name: name.to_string(),
            data_keys: Map::new(),
            time: now(),
            extra: Map::new(),
        }
    }

    /// Replace the generated uid.
    pub fn with_uid(mut self, uid: &str) -> Self {
        self.uid = uid.to_string();
        self
    }

    /// Declare a data field.
    pub fn with_data_key(mut self, name: &str, key: DataKey) -> Self {
        if let Ok(value) = serde_json::to_value(key) {
            self.data_keys.insert(name.to_string(), value);
        }
        self
    }
}

/// Schema for a data field within events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Data type: "number", "integer", "string", "array"
    pub dtype: String,
    /// Shape for arrays (empty for scalars)
    #[serde(default)]
    pub shape: Vec<u64>,
    /// Source device ID
    #[serde(default)]
    pub source: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DataKey {
    /// Create a scalar number data key
    pub fn scalar(source: &str) -> Self {
        Self {
            dtype: "number".to_string(),
            shape: vec![],
            source: source.to_string(),
            extra: Map::new(),
        }
    }

    /// Create an array data key
    pub fn array(source: &str, shape: Vec<u64>) -> Self {
        Self {
            dtype: "array".to_string(),
            shape,
            source: source.to_string(),
            extra: Map::new(),
        }
    }
}

/// Event document - one row of measurement data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID
    #[serde(default)]
    pub uid: String,
    /// Links to the Descriptor that defines schema
    pub descriptor: String,
    /// Event sequence number within this descriptor stream
    pub seq_num: u64,
    /// Timestamp
    pub time: f64,
    /// Data values (field name -> value)
    pub data: Map<String, Value>,
    /// Per-field timestamps
    #[serde(default)]
    pub timestamps: Map<String, Value>,
    /// Per-field fill state; `false` means the value still references external storage
    #[serde(default)]
    pub filled: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    /// Create an event with no data.
    pub fn new(descriptor: &str, seq_num: u64) -> Self {
        Self {
            uid: new_uid(),
            descriptor: descriptor.to_string(),
            seq_num,
            time: now(),
            data: Map::new(),
            timestamps: Map::new(),
            filled: Map::new(),
            extra: Map::new(),
        }
    }

    /// Set the event time.
    pub fn at(mut self, time: f64) -> Self {
        self.time = time;
        self
    }

    /// Add a data value.
    pub fn with_datum(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.data.insert(field.to_string(), value.into());
        self.timestamps.insert(field.to_string(), Value::from(self.time));
        self
    }
}

/// Event page document - a columnar batch of events from one descriptor
///
/// Every sequence (and every column of `data`) holds one entry per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    #[serde(default)]
    pub uid: Vec<String>,
    /// Descriptor the rows belong to
    pub descriptor: String,
    /// Per-row sequence numbers
    pub seq_num: Vec<u64>,
    /// Per-row timestamps
    pub time: Vec<f64>,
    /// Field name -> array of per-row values
    pub data: Map<String, Value>,
    #[serde(default)]
    pub timestamps: Map<String, Value>,
    /// Field name -> array of per-row fill flags
    #[serde(default)]
    pub filled: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Deprecated bulk events document: descriptor uid -> list of events
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BulkEvents(pub Map<String, Value>);

impl BulkEvents {
    /// Events grouped by descriptor, in document order.
    pub fn groups(&self) -> Result<Vec<(String, Vec<Event>)>, ProtocolError> {
        self.0
            .iter()
            .map(|(descriptor, events)| {
                let events: Vec<Event> = serde_json::from_value(events.clone()).map_err(
                    |source| ProtocolError::InvalidDocument {
                        name: "bulk_events".to_string(),
                        source,
                    },
                )?;
                Ok((descriptor.clone(), events))
            })
            .collect()
    }
}

/// Stop document - emitted at the end of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStop {
    /// Unique stop doc ID
    pub uid: String,
    /// Links to RunStart
    #[serde(default)]
    pub run_start: String,
    /// Timestamp when run ended
    #[serde(default)]
    pub time: f64,
    /// Exit status: "success", "abort", "fail"
    #[serde(default = "default_exit_status")]
    pub exit_status: String,
    /// Reason for abort/failure
    #[serde(default)]
    pub reason: String,
    /// Events emitted per stream
    #[serde(default)]
    pub num_events: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_exit_status() -> String {
    "success".to_string()
}

impl RunStop {
    /// Successful run-stop for `run_start`.
    pub fn success(run_start: &str) -> Self {
        Self {
            uid: new_uid(),
            run_start: run_start.to_string(),
            time: now(),
            exit_status: default_exit_status(),
            reason: String::new(),
            num_events: Map::new(),
            extra: Map::new(),
        }
    }

    /// Aborted run-stop with a reason.
    pub fn abort(run_start: &str, reason: &str) -> Self {
        Self {
            exit_status: "abort".to_string(),
            reason: reason.to_string(),
            ..Self::success(run_start)
        }
    }
}
