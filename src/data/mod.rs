//! Run output: the per-tick record and the sinks that persist it.
pub mod record;
pub mod storage;

pub use record::{OutputRecord, FIELDS};
pub use storage::{open_sink, MemorySink, RecordSink, SinkFormat};
