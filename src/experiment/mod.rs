//! Experiment document model.
//!
//! Documents arrive as `(name, payload)` pairs. This module parses them into
//! typed variants and normalizes every data-carrying shape into one
//! [`DataBatch`] form.
//!
//! # Example
//!
//! ```rust
//! use daq_csv_export::experiment::{DataBatch, Document, Event};
//!
//! let event = Event::new("descriptor-1", 1).at(0.1).with_datum("x", 1.0);
//! let batch = DataBatch::from_event(&event);
//! assert_eq!(batch.len(), 1);
//! assert_eq!(Document::Event(event).name(), "event");
//! ```

pub mod batch;
pub mod document;
pub mod source;

pub use batch::{Column, DataBatch};
pub use document::{
    BulkEvents, DataKey, Descriptor, Document, Event, EventPage, RunStart, RunStop,
};
pub use source::{JsonLinesSource, SourceError};
