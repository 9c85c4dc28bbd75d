//! Storage side of the recording engine: the clip container format and the
//! preallocating sequential writer.

pub mod clip;
mod writer;

pub use writer::{RecordSink, StorageStatus, StorageWriter};
