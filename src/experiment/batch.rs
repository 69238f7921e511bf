//! Canonical batched form of event data.
//!
//! Events, event pages and bulk events all normalize into a [`DataBatch`]
//! before they reach a handler, so writers never branch on the wire shape.

use serde_json::{Map, Value};

use super::document::{BulkEvents, Event, EventPage};
use crate::error::ProtocolError;

/// One named column of per-row values.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Field name
    pub name: String,
    /// One value per row
    pub values: Vec<Value>,
}

impl Column {
    /// Create a column from per-row values.
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// Highest rank among the per-row values.
    ///
    /// Scalars have rank 0, flat arrays rank 1, nested arrays one more per
    /// nesting level. Objects are not tabular and yield `None`.
    pub fn rank(&self) -> Option<usize> {
        self.values
            .iter()
            .try_fold(0, |acc, value| value_rank(value).map(|rank| acc.max(rank)))
    }

    /// True when every row holds a scalar or a flat array.
    pub fn is_tabular(&self) -> bool {
        matches!(self.rank(), Some(rank) if rank <= 1)
    }
}

fn value_rank(value: &Value) -> Option<usize> {
    match value {
        Value::Array(items) => items
            .iter()
            .try_fold(0, |acc, item| value_rank(item).map(|rank| acc.max(rank)))
            .map(|inner| inner + 1),
        Value::Object(_) => None,
        _ => Some(0),
    }
}

/// A batch of rows from a single descriptor.
///
/// `uids`, `time`, `seq_num` and every column's `values` are parallel: one
/// entry per row.
#[derive(Debug, Clone, PartialEq)]
pub struct DataBatch {
    /// Descriptor the rows belong to
    pub descriptor: String,
    /// Event uids, when the source shape carries them
    pub uids: Vec<String>,
    /// Per-row timestamps
    pub time: Vec<f64>,
    /// Per-row sequence numbers
    pub seq_num: Vec<u64>,
    /// Columns in payload key order
    pub columns: Vec<Column>,
    /// Fields with at least one row whose data is not filled in yet
    pub unfilled: Vec<String>,
}

impl DataBatch {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.time.len()
    }

    /// True when the batch has no rows.
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Single-row batch from one event.
    pub fn from_event(event: &Event) -> Self {
        let columns = event
            .data
            .iter()
            .map(|(name, value)| Column::new(name.clone(), vec![value.clone()]))
            .collect();
        let unfilled = event
            .filled
            .iter()
            .filter(|(_, flag)| is_unfilled(flag))
            .map(|(name, _)| name.clone())
            .collect();

        Self {
            descriptor: event.descriptor.clone(),
            uids: vec![event.uid.clone()],
            time: vec![event.time],
            seq_num: vec![event.seq_num],
            columns,
            unfilled,
        }
    }

    /// Batch from an event page, checking that every sequence has one entry per row.
    pub fn from_event_page(page: &EventPage) -> Result<Self, ProtocolError> {
        let rows = page.time.len();
        let malformed = |reason: String| ProtocolError::MalformedBatch {
            descriptor: page.descriptor.clone(),
            reason,
        };

        if page.seq_num.len() != rows {
            return Err(malformed(format!(
                "{} seq_num entries for {rows} timestamps",
                page.seq_num.len()
            )));
        }
        if !page.uid.is_empty() && page.uid.len() != rows {
            return Err(malformed(format!(
                "{} uids for {rows} timestamps",
                page.uid.len()
            )));
        }

        let mut columns = Vec::with_capacity(page.data.len());
        for (name, values) in &page.data {
            let Value::Array(values) = values else {
                return Err(malformed(format!("field '{name}' is not an array of rows")));
            };
            if values.len() != rows {
                return Err(malformed(format!(
                    "field '{name}' has {} rows, expected {rows}",
                    values.len()
                )));
            }
            columns.push(Column::new(name.clone(), values.clone()));
        }

        let unfilled = page
            .filled
            .iter()
            .filter(|(_, flags)| match flags {
                Value::Array(flags) => flags.iter().any(is_unfilled),
                other => is_unfilled(other),
            })
            .map(|(name, _)| name.clone())
            .collect();

        Ok(Self {
            descriptor: page.descriptor.clone(),
            uids: page.uid.clone(),
            time: page.time.clone(),
            seq_num: page.seq_num.clone(),
            columns,
            unfilled,
        })
    }

    /// Concatenate events sharing one descriptor into a batch.
    ///
    /// The first event fixes the field set; later events must carry the same
    /// fields.
    pub fn from_events(descriptor: &str, events: &[Event]) -> Result<Self, ProtocolError> {
        let mut columns: Vec<Column> = events
            .first()
            .map(|first| {
                first
                    .data
                    .keys()
                    .map(|name| Column::new(name.clone(), Vec::with_capacity(events.len())))
                    .collect()
            })
            .unwrap_or_default();

        let mut batch = Self {
            descriptor: descriptor.to_string(),
            uids: Vec::with_capacity(events.len()),
            time: Vec::with_capacity(events.len()),
            seq_num: Vec::with_capacity(events.len()),
            columns: Vec::new(),
            unfilled: Vec::new(),
        };

        for event in events {
            if event.descriptor != descriptor {
                return Err(ProtocolError::MalformedBatch {
                    descriptor: descriptor.to_string(),
                    reason: format!(
                        "event '{}' belongs to descriptor '{}'",
                        event.uid, event.descriptor
                    ),
                });
            }
            if event.data.len() != columns.len() {
                return Err(field_mismatch(descriptor, event));
            }
            for column in &mut columns {
                let value = event
                    .data
                    .get(&column.name)
                    .ok_or_else(|| field_mismatch(descriptor, event))?;
                column.values.push(value.clone());
            }
            for (name, flag) in &event.filled {
                if is_unfilled(flag) && !batch.unfilled.contains(name) {
                    batch.unfilled.push(name.clone());
                }
            }
            batch.uids.push(event.uid.clone());
            batch.time.push(event.time);
            batch.seq_num.push(event.seq_num);
        }

        batch.columns = columns;
        Ok(batch)
    }

    /// One batch per descriptor group of a bulk events document.
    pub fn from_bulk_events(bulk: &BulkEvents) -> Result<Vec<Self>, ProtocolError> {
        bulk.groups()?
            .iter()
            .map(|(descriptor, events)| Self::from_events(descriptor, events))
            .collect()
    }

    /// Fail if any field still references data in external storage.
    pub fn verify_filled(&self) -> Result<(), ProtocolError> {
        if self.unfilled.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::Unfilled {
                descriptor: self.descriptor.clone(),
                fields: self.unfilled.clone(),
            })
        }
    }

    /// Columns eligible for tabular export, in batch order.
    pub fn tabular_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|column| column.is_tabular())
    }
}

fn is_unfilled(flag: &Value) -> bool {
    matches!(flag, Value::Bool(false))
}

fn field_mismatch(descriptor: &str, event: &Event) -> ProtocolError {
    let fields: Vec<&String> = event.data.keys().collect();
    ProtocolError::MalformedBatch {
        descriptor: descriptor.to_string(),
        reason: format!(
            "event '{}' has fields {fields:?} that differ from the first event",
            event.uid
        ),
    }
}

/// Build an event page `data` map from named columns of per-row values.
pub fn page_data<I, K>(columns: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (K, Vec<Value>)>,
    K: Into<String>,
{
    columns
        .into_iter()
        .map(|(name, values)| (name.into(), Value::Array(values)))
        .collect()
}
