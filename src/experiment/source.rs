//! JSON-lines document source.
//!
//! Each non-blank line holds one `["name", {payload}]` pair, the shape produced
//! when a document stream is dumped with one document per line.

use serde_json::Value;
use std::io::BufRead;
use thiserror::Error;

/// A line that could not be read or parsed.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("line {line}: {source}")]
    Io {
        line: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Lazily pulls `(name, payload)` pairs from a reader.
pub struct JsonLinesSource<R> {
    reader: R,
    line_no: usize,
    buf: String,
}

impl<R: BufRead> JsonLinesSource<R> {
    /// Wrap a buffered reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_no: 0,
            buf: String::new(),
        }
    }
}

impl<R: BufRead> Iterator for JsonLinesSource<R> {
    type Item = Result<(String, Value), SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            self.line_no += 1;
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(source) => {
                    return Some(Err(SourceError::Io {
                        line: self.line_no,
                        source,
                    }))
                }
            }

            let line = self.buf.trim();
            if line.is_empty() {
                continue;
            }
            return Some(
                serde_json::from_str::<(String, Value)>(line).map_err(|source| {
                    SourceError::Parse {
                        line: self.line_no,
                        source,
                    }
                }),
            );
        }
    }
}
