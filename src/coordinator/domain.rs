//! Domains and their assignment to hosts

use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// A named, partitioned dataset
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Domain {
    pub id: u32,
    pub name: String,
}

impl Domain {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.name, self.id)
    }
}

/// Maps stored domain ids back to domains
pub trait DomainResolver: Send + Sync {
    fn domain_by_id(&self, id: u32) -> Option<Domain>;
}

/// Fixed set of known domains
#[derive(Debug, Default, Clone)]
pub struct StaticDomainResolver {
    domains: HashMap<u32, Domain>,
}

impl StaticDomainResolver {
    pub fn new(domains: impl IntoIterator<Item = Domain>) -> Self {
        Self {
            domains: domains.into_iter().map(|d| (d.id, d)).collect(),
        }
    }
}

impl DomainResolver for StaticDomainResolver {
    fn domain_by_id(&self, id: u32) -> Option<Domain> {
        self.domains.get(&id).cloned()
    }
}

/// Counters reported by a build for one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartitionProperties {
    pub num_bytes: u64,
    pub num_records: u64,
}

/// Assignment of one domain to one host
pub trait HostDomain: Send + Sync + fmt::Debug {
    fn domain(&self) -> &Domain;

    /// Record (or overwrite) the counters of a finished partition.
    fn add_partition_properties(
        &self,
        partition: u32,
        num_bytes: u64,
        num_records: u64,
    ) -> Result<()>;

    fn partition_properties(&self, partition: u32) -> Result<Option<PartitionProperties>>;

    /// All recorded partitions, by partition number
    fn partitions(&self) -> Result<BTreeMap<u32, PartitionProperties>>;

    fn total_num_bytes(&self) -> Result<u64> {
        Ok(self.partitions()?.values().map(|p| p.num_bytes).sum())
    }

    fn total_num_records(&self) -> Result<u64> {
        Ok(self.partitions()?.values().map(|p| p.num_records).sum())
    }
}
