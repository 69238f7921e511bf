//! Document dispatch.
//!
//! [`DocumentRouter`] delivers each document to exactly one handler, in arrival
//! order. Events, event pages and bulk events are normalized into [`DataBatch`]es
//! first, so implementors only ever see `event_page`.

use serde_json::Value;

use crate::error::ExportResult;
use crate::experiment::{DataBatch, Descriptor, Document, RunStart, RunStop};

/// Handlers for each document kind. Unimplemented handlers ignore their input.
pub trait DocumentRouter {
    fn start(&mut self, _doc: &RunStart) -> ExportResult<()> {
        Ok(())
    }

    fn descriptor(&mut self, _doc: &Descriptor) -> ExportResult<()> {
        Ok(())
    }

    fn event_page(&mut self, _batch: &DataBatch) -> ExportResult<()> {
        Ok(())
    }

    fn stop(&mut self, _doc: &RunStop) -> ExportResult<()> {
        Ok(())
    }

    /// Dispatch one typed document.
    fn route(&mut self, doc: &Document) -> ExportResult<()> {
        match doc {
            Document::Start(doc) => self.start(doc),
            Document::Descriptor(doc) => self.descriptor(doc),
            Document::Event(doc) => self.event_page(&DataBatch::from_event(doc)),
            Document::EventPage(doc) => self.event_page(&DataBatch::from_event_page(doc)?),
            Document::BulkEvents(doc) => {
                for batch in DataBatch::from_bulk_events(doc)? {
                    self.event_page(&batch)?;
                }
                Ok(())
            }
            Document::Stop(doc) => self.stop(doc),
        }
    }

    /// Parse and dispatch a `(name, payload)` pair. Unknown names are ignored.
    fn route_tagged(&mut self, name: &str, payload: Value) -> ExportResult<()> {
        match Document::from_tagged(name, payload)? {
            Some(doc) => self.route(&doc),
            None => {
                tracing::debug!("Ignoring '{}' document", name);
                Ok(())
            }
        }
    }
}
