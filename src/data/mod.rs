//! Output side of the exporter: sink providers and tabular encoding.

pub mod storage;
pub mod table;

pub use storage::{
    Artifacts, MemoryBufferManager, MultiFileManager, OpenMode, Sink, SinkManager, RUN_METADATA,
    STREAM_DATA,
};
pub use table::TableFragment;
