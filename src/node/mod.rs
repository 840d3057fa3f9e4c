//! Partition-server side: executing queued commands and reporting builds

pub mod builder;
pub mod processor;

pub use builder::{MemoryWriterFactory, PartitionedRecordWriter, Writer, WriterFactory};
pub use processor::{CommandProcessor, Updater};
