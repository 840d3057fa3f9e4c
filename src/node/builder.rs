//! Writing a domain build partition by partition
//!
//! Records arrive grouped by partition. Each partition gets its own
//! [`Writer`]; when the build moves on, the finished partition's counters are
//! recorded on the [`HostDomain`] and its writer is closed.

use crate::common::{Error, Result};
use crate::coordinator::{Domain, HostDomain};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Sink for the records of one partition
pub trait Writer: Send {
    fn write(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    fn num_bytes_written(&self) -> u64;

    fn num_records_written(&self) -> u64;

    fn close(&mut self) -> Result<()>;
}

pub trait WriterFactory: Send + Sync {
    fn open(&self, domain: &Domain, partition: u32) -> Result<Box<dyn Writer>>;
}

struct OpenPartition {
    partition: u32,
    writer: Box<dyn Writer>,
}

pub struct PartitionedRecordWriter<F: WriterFactory> {
    host_domain: Arc<dyn HostDomain>,
    factory: F,
    current: Option<OpenPartition>,
    written: HashSet<u32>,
}

impl<F: WriterFactory> PartitionedRecordWriter<F> {
    pub fn new(host_domain: Arc<dyn HostDomain>, factory: F) -> Self {
        Self {
            host_domain,
            factory,
            current: None,
            written: HashSet::new(),
        }
    }

    pub fn write(&mut self, partition: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let open = match self.current.take() {
            Some(open) if open.partition == partition => open,
            previous => {
                if let Some(previous) = previous {
                    self.finish(previous)?;
                }
                self.open(partition)?
            }
        };
        let open = self.current.insert(open);
        open.writer.write(key, value)
    }

    fn open(&mut self, partition: u32) -> Result<OpenPartition> {
        if self.written.contains(&partition) {
            return Err(Error::Programming(format!(
                "partition {} of {} has already been written",
                partition,
                self.host_domain.domain()
            )));
        }
        tracing::info!(
            "Setting up new writer for partition {} of {}",
            partition,
            self.host_domain.domain()
        );
        let writer = self.factory.open(self.host_domain.domain(), partition)?;
        self.written.insert(partition);
        Ok(OpenPartition { partition, writer })
    }

    fn finish(&self, mut open: OpenPartition) -> Result<()> {
        self.host_domain.add_partition_properties(
            open.partition,
            open.writer.num_bytes_written(),
            open.writer.num_records_written(),
        )?;
        open.writer.close()
    }

    /// Partitions started so far
    pub fn written_partitions(&self) -> Vec<u32> {
        let mut partitions: Vec<u32> = self.written.iter().copied().collect();
        partitions.sort_unstable();
        partitions
    }

    /// Finish the partition being written, if any.
    pub fn close(mut self) -> Result<()> {
        match self.current.take() {
            Some(open) => self.finish(open),
            None => Ok(()),
        }
    }
}

type Records = BTreeMap<u32, Vec<(Vec<u8>, Vec<u8>)>>;

/// Keeps written records in memory, by partition
#[derive(Debug, Default, Clone)]
pub struct MemoryWriterFactory {
    records: Arc<Mutex<Records>>,
}

impl MemoryWriterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn records(&self, partition: u32) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.lock().get(&partition).cloned().unwrap_or_default()
    }
}

impl WriterFactory for MemoryWriterFactory {
    fn open(&self, _domain: &Domain, partition: u32) -> Result<Box<dyn Writer>> {
        self.lock().entry(partition).or_default();
        Ok(Box::new(MemoryWriter {
            records: self.records.clone(),
            partition,
            num_bytes: 0,
            num_records: 0,
            closed: false,
        }))
    }
}

struct MemoryWriter {
    records: Arc<Mutex<Records>>,
    partition: u32,
    num_bytes: u64,
    num_records: u64,
    closed: bool,
}

impl Writer for MemoryWriter {
    fn write(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Programming(format!(
                "write to closed writer of partition {}",
                self.partition
            )));
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(self.partition)
            .or_default()
            .push((key.to_vec(), value.to_vec()));
        self.num_bytes += (key.len() + value.len()) as u64;
        self.num_records += 1;
        Ok(())
    }

    fn num_bytes_written(&self) -> u64 {
        self.num_bytes
    }

    fn num_records_written(&self) -> u64 {
        self.num_records
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{Host, MemoryHost, PartitionProperties, PartitionServerAddress};

    fn host_domain() -> Arc<dyn HostDomain> {
        let host = MemoryHost::new(PartitionServerAddress::new("h", 1));
        host.add_domain(&Domain::new(1, "users")).unwrap()
    }

    #[test]
    fn test_counters_recorded_per_partition() {
        let hd = host_domain();
        let factory = MemoryWriterFactory::new();
        let mut writer = PartitionedRecordWriter::new(hd.clone(), factory.clone());

        writer.write(0, b"a", b"1").unwrap();
        writer.write(0, b"bb", b"22").unwrap();
        // Partition 0 is not recorded until the build moves on
        assert_eq!(hd.partition_properties(0).unwrap(), None);

        writer.write(3, b"c", b"333").unwrap();
        assert_eq!(
            hd.partition_properties(0).unwrap(),
            Some(PartitionProperties {
                num_bytes: 6,
                num_records: 2
            })
        );

        assert_eq!(writer.written_partitions(), vec![0, 3]);
        writer.close().unwrap();
        assert_eq!(
            hd.partition_properties(3).unwrap(),
            Some(PartitionProperties {
                num_bytes: 4,
                num_records: 1
            })
        );
        assert_eq!(factory.records(0).len(), 2);
        assert_eq!(factory.records(3), vec![(b"c".to_vec(), b"333".to_vec())]);
    }

    #[test]
    fn test_rewriting_a_partition_is_rejected() {
        let mut writer = PartitionedRecordWriter::new(host_domain(), MemoryWriterFactory::new());
        writer.write(1, b"k", b"v").unwrap();
        writer.write(2, b"k", b"v").unwrap();

        assert!(matches!(
            writer.write(1, b"k", b"v"),
            Err(Error::Programming(_))
        ));
    }

    #[test]
    fn test_close_without_records() {
        let hd = host_domain();
        let writer = PartitionedRecordWriter::new(hd.clone(), MemoryWriterFactory::new());
        writer.close().unwrap();
        assert!(hd.partitions().unwrap().is_empty());
    }
}
