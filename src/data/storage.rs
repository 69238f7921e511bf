//! Destination storage for export artifacts.
//!
//! A [`SinkManager`] hands out writable sinks by logical name and remembers what it
//! created, grouped by label, so callers can discover outputs without guessing
//! file names. Two managers are provided:
//!
//! - [`MultiFileManager`]: one file per sink inside a directory
//! - [`MemoryBufferManager`]: shared in-memory buffers, readable after the export

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::{ExportResult, ResourceError};

/// Label for per-stream CSV files.
pub const STREAM_DATA: &str = "stream_data";
/// Label for the JSON metadata sidecar.
pub const RUN_METADATA: &str = "run_metadata";

/// Artifacts produced so far, by label.
pub type Artifacts = BTreeMap<String, Vec<PathBuf>>;

/// How a sink is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fail if an artifact with this name already exists.
    CreateNew,
    /// Replace any existing artifact with this name.
    Truncate,
}

/// Writable destination for one artifact.
pub trait Sink: Write + Send {
    /// Flush buffered bytes and push them to durable storage.
    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// Provider of named sinks.
pub trait SinkManager {
    /// Open a sink named `name` and record it under `label`.
    fn open(&mut self, label: &str, name: &str, mode: OpenMode) -> ExportResult<Box<dyn Sink>>;

    /// Everything opened so far.
    fn artifacts(&self) -> &Artifacts;

    /// Release manager-level resources once every sink has been dropped.
    fn close(&mut self) -> ExportResult<()> {
        Ok(())
    }
}

// ============================================================================
// Files
// ============================================================================

struct FileSink {
    inner: BufWriter<File>,
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Sink for FileSink {
    fn sync(&mut self) -> io::Result<()> {
        self.inner.flush()?;
        self.inner.get_ref().sync_data()
    }
}

/// Writes each sink as a file in one directory.
#[derive(Debug)]
pub struct MultiFileManager {
    directory: PathBuf,
    artifacts: Artifacts,
}

impl MultiFileManager {
    /// Manager rooted at `directory`, which is created on first open if missing.
    ///
    /// An empty path means the current working directory.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            artifacts: Artifacts::new(),
        }
    }

    /// Directory the files are created in.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn resolve(&self, name: &str) -> ExportResult<PathBuf> {
        let relative = Path::new(name);
        let mut components = relative.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.directory.join(relative)),
            _ => Err(ResourceError::InvalidName {
                name: name.to_string(),
            }
            .into()),
        }
    }
}

impl SinkManager for MultiFileManager {
    fn open(&mut self, label: &str, name: &str, mode: OpenMode) -> ExportResult<Box<dyn Sink>> {
        let path = self.resolve(name)?;
        if !self.directory.as_os_str().is_empty() && !self.directory.exists() {
            std::fs::create_dir_all(&self.directory).map_err(|source| ResourceError::Open {
                name: self.directory.display().to_string(),
                source,
            })?;
        }

        let mut options = OpenOptions::new();
        options.write(true);
        match mode {
            OpenMode::CreateNew => options.create_new(true),
            OpenMode::Truncate => options.create(true).truncate(true),
        };

        let file = options.open(&path).map_err(|source| {
            if source.kind() == io::ErrorKind::AlreadyExists {
                ResourceError::SinkExists {
                    name: path.display().to_string(),
                }
            } else {
                ResourceError::Open {
                    name: path.display().to_string(),
                    source,
                }
            }
        })?;

        tracing::info!("Opened {} sink at {:?}", label, path);
        self.artifacts
            .entry(label.to_string())
            .or_default()
            .push(path);
        Ok(Box::new(FileSink {
            inner: BufWriter::new(file),
        }))
    }

    fn artifacts(&self) -> &Artifacts {
        &self.artifacts
    }
}

// ============================================================================
// Memory
// ============================================================================

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

struct MemorySink {
    buffer: SharedBuffer,
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Sink for MemorySink {}

/// Keeps every sink as an in-memory buffer.
///
/// Buffers outlive the sinks that wrote them; read them back with
/// [`MemoryBufferManager::contents`] after the export returns.
#[derive(Debug, Default, Clone)]
pub struct MemoryBufferManager {
    buffers: Arc<Mutex<BTreeMap<String, SharedBuffer>>>,
    artifacts: Artifacts,
}

impl MemoryBufferManager {
    /// Manager with no buffers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written to the sink named `name`.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.buffers
            .lock()
            .get(name)
            .map(|buffer| buffer.lock().clone())
    }

    /// Sink contents decoded as UTF-8 (lossy).
    pub fn contents_string(&self, name: &str) -> Option<String> {
        self.contents(name)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Names of all buffers, sorted.
    pub fn names(&self) -> Vec<String> {
        self.buffers.lock().keys().cloned().collect()
    }
}

impl SinkManager for MemoryBufferManager {
    fn open(&mut self, label: &str, name: &str, mode: OpenMode) -> ExportResult<Box<dyn Sink>> {
        let mut buffers = self.buffers.lock();
        let existing = buffers.get(name).cloned();
        let buffer = match (existing, mode) {
            (Some(_), OpenMode::CreateNew) => {
                return Err(ResourceError::SinkExists {
                    name: name.to_string(),
                }
                .into())
            }
            (Some(existing), OpenMode::Truncate) => {
                existing.lock().clear();
                existing
            }
            (None, _) => {
                let buffer = SharedBuffer::default();
                buffers.insert(name.to_string(), buffer.clone());
                buffer
            }
        };

        tracing::debug!("Opened {} buffer '{}'", label, name);
        self.artifacts
            .entry(label.to_string())
            .or_default()
            .push(PathBuf::from(name));
        Ok(Box::new(MemorySink { buffer }))
    }

    fn artifacts(&self) -> &Artifacts {
        &self.artifacts
    }
}
