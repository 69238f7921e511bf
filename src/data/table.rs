//! Delimited-text encoding of table fragments.
//!
//! A fragment is a row index plus named columns. Encoding appends records to an
//! existing writer, optionally preceded by a header row, so successive fragments
//! for one stream build up a single CSV file.

use serde_json::Value;
use std::io::Write;

use crate::experiment::Column;

/// Rows to append to one stream's sink.
#[derive(Debug, Clone, PartialEq)]
pub struct TableFragment<'a> {
    /// Header label of the index column
    pub index_label: &'a str,
    /// Row index (one entry per row)
    pub index: &'a [f64],
    /// Data columns in output order
    pub columns: Vec<&'a Column>,
}

impl<'a> TableFragment<'a> {
    /// Fragment with an index and no data columns.
    pub fn new(index_label: &'a str, index: &'a [f64]) -> Self {
        Self {
            index_label,
            index,
            columns: Vec::new(),
        }
    }

    /// Append a data column.
    pub fn with_column(mut self, column: &'a Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Header names: index label first, then columns in order.
    pub fn header(&self) -> Vec<&str> {
        std::iter::once(self.index_label)
            .chain(self.columns.iter().map(|c| c.name.as_str()))
            .collect()
    }

    /// Number of data rows.
    pub fn rows(&self) -> usize {
        self.index.len()
    }

    /// Append the fragment to `sink` as CSV, returning the number of data rows written.
    ///
    /// Records are encoded into a local buffer and handed to `sink` with a single
    /// `write_all`; the sink itself is never flushed here.
    pub fn write_csv<W: Write>(&self, sink: &mut W, header: bool) -> Result<usize, csv::Error> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());

        if header {
            writer.write_record(self.header())?;
        }

        let mut record = Vec::with_capacity(self.columns.len() + 1);
        for (row, index) in self.index.iter().enumerate() {
            record.clear();
            record.push(render_index(*index));
            for column in &self.columns {
                record.push(column.values.get(row).map(render_cell).unwrap_or_default());
            }
            writer.write_record(&record)?;
        }

        let encoded = writer.into_inner().map_err(|e| e.into_error())?;
        sink.write_all(&encoded)?;
        Ok(self.rows())
    }
}

/// Text form of a row index, matching how float data cells render.
pub fn render_index(index: f64) -> String {
    match serde_json::Number::from_f64(index) {
        Some(n) => n.to_string(),
        None => index.to_string(),
    }
}

/// Text form of one cell.
pub fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}
