//! Store-backed domain assignments
//!
//! Each assigned domain is a child of the host's `domains` node named by
//! domain id, with one child per built partition holding its counters.
//! Lookups go through an in-memory index keyed by domain id; the index is
//! rebuilt only when the child version of the `domains` node moves.

use crate::common::{join_path, Error, Result};
use crate::coordinator::domain::{Domain, DomainResolver, HostDomain, PartitionProperties};
use crate::store::{self, decode, encode, CoordinationStore, CreateMode, Op};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const PARTITIONS: &str = "partitions";

pub struct StoreHostDomain {
    store: Arc<dyn CoordinationStore>,
    domain: Domain,
    partitions_path: String,
}

impl StoreHostDomain {
    fn new(store: Arc<dyn CoordinationStore>, domain: Domain, path: &str) -> Self {
        Self {
            store,
            domain,
            partitions_path: join_path(path, PARTITIONS),
        }
    }
}

impl fmt::Debug for StoreHostDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHostDomain")
            .field("domain", &self.domain)
            .field("partitions_path", &self.partitions_path)
            .finish()
    }
}

impl HostDomain for StoreHostDomain {
    fn domain(&self) -> &Domain {
        &self.domain
    }

    fn add_partition_properties(
        &self,
        partition: u32,
        num_bytes: u64,
        num_records: u64,
    ) -> Result<()> {
        let path = join_path(&self.partitions_path, &partition.to_string());
        let data = encode(&PartitionProperties {
            num_bytes,
            num_records,
        })?;

        let result = match self.store.set_data(&path, data.clone(), None) {
            Err(Error::NoNode(_)) => {
                match self.store.create(&path, data.clone(), CreateMode::Persistent) {
                    Err(Error::NodeExists(_)) => self.store.set_data(&path, data, None).map(|_| ()),
                    other => other.map(|_| ()),
                }
            }
            other => other.map(|_| ()),
        };

        match result {
            Err(Error::NoNode(_)) => Err(Error::NotFound(format!(
                "domain {} is no longer assigned",
                self.domain
            ))),
            other => {
                tracing::debug!(
                    "Recorded partition {} of {}: {} bytes, {} records",
                    partition,
                    self.domain,
                    num_bytes,
                    num_records
                );
                other
            }
        }
    }

    fn partition_properties(&self, partition: u32) -> Result<Option<PartitionProperties>> {
        let path = join_path(&self.partitions_path, &partition.to_string());
        match self.store.get_data(&path, None)? {
            Some((data, _)) => decode(&data).map(Some),
            None => Ok(None),
        }
    }

    fn partitions(&self) -> Result<BTreeMap<u32, PartitionProperties>> {
        let mut partitions = BTreeMap::new();
        let children = self
            .store
            .get_children(&self.partitions_path, None)?
            .unwrap_or_default();
        for child in children {
            let partition: u32 = child
                .parse()
                .map_err(|_| Error::Serialization(format!("bad partition node {}", child)))?;
            if let Some(properties) = self.partition_properties(partition)? {
                partitions.insert(partition, properties);
            }
        }
        Ok(partitions)
    }
}

#[derive(Default)]
struct DomainIndex {
    cversion: Option<u64>,
    domains: HashMap<u32, Arc<StoreHostDomain>>,
}

pub struct DomainAssignment {
    store: Arc<dyn CoordinationStore>,
    path: String,
    resolver: Arc<dyn DomainResolver>,
    index: Mutex<DomainIndex>,
}

impl DomainAssignment {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        path: String,
        resolver: Arc<dyn DomainResolver>,
    ) -> Self {
        Self {
            store,
            path,
            resolver,
            index: Mutex::new(DomainIndex::default()),
        }
    }

    fn domain_path(&self, domain: &Domain) -> String {
        join_path(&self.path, &domain.id.to_string())
    }

    fn lock(&self) -> MutexGuard<'_, DomainIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bring the index up to date with the store and return it locked.
    fn refresh(&self) -> Result<MutexGuard<'_, DomainIndex>> {
        let stat = self
            .store
            .exists(&self.path, None)?
            .ok_or_else(|| Error::NotFound(format!("domain assignments {}", self.path)))?;

        let mut index = self.lock();
        if index.cversion == Some(stat.cversion) {
            return Ok(index);
        }

        let children = self
            .store
            .get_children(&self.path, None)?
            .unwrap_or_default();
        let mut domains = HashMap::with_capacity(children.len());
        for child in children {
            let id: u32 = child
                .parse()
                .map_err(|_| Error::Serialization(format!("bad domain node {}", child)))?;
            let host_domain = match index.domains.get(&id) {
                Some(existing) => existing.clone(),
                None => {
                    let domain = self
                        .resolver
                        .domain_by_id(id)
                        .ok_or(Error::UnknownDomain(id))?;
                    Arc::new(StoreHostDomain::new(
                        self.store.clone(),
                        domain,
                        &join_path(&self.path, &child),
                    ))
                }
            };
            domains.insert(id, host_domain);
        }

        // Listing was taken after the stat, so it is at least this fresh
        index.domains = domains;
        index.cversion = Some(stat.cversion);
        tracing::debug!(
            "Rebuilt domain index for {} ({} domain(s))",
            self.path,
            index.domains.len()
        );
        Ok(index)
    }

    pub fn add(&self, domain: &Domain) -> Result<Arc<dyn HostDomain>> {
        let path = self.domain_path(domain);
        self.store
            .multi(vec![
                Op::Create {
                    path: path.clone(),
                    data: Vec::new(),
                    mode: CreateMode::Persistent,
                },
                Op::Create {
                    path: join_path(&path, PARTITIONS),
                    data: Vec::new(),
                    mode: CreateMode::Persistent,
                },
            ])
            .map_err(|e| match e {
                Error::NodeExists(_) => {
                    Error::Conflict(format!("domain {} is already assigned at {}", domain, path))
                }
                Error::NoNode(_) => {
                    Error::NotFound(format!("domain assignments {}", self.path))
                }
                e => e,
            })?;

        let host_domain = Arc::new(StoreHostDomain::new(
            self.store.clone(),
            domain.clone(),
            &path,
        ));
        self.lock().domains.insert(domain.id, host_domain.clone());
        tracing::info!("Assigned domain {} at {}", domain, path);
        Ok(host_domain as Arc<dyn HostDomain>)
    }

    pub fn remove(&self, domain: &Domain) -> Result<bool> {
        let path = self.domain_path(domain);
        if self.store.exists(&path, None)?.is_none() {
            return Ok(false);
        }
        store::delete_recursive(self.store.as_ref(), &path)?;
        self.lock().domains.remove(&domain.id);
        tracing::info!("Unassigned domain {} from {}", domain, self.path);
        Ok(true)
    }

    pub fn get(&self, domain: &Domain) -> Result<Option<Arc<dyn HostDomain>>> {
        let index = self.refresh()?;
        Ok(index
            .domains
            .get(&domain.id)
            .map(|hd| hd.clone() as Arc<dyn HostDomain>))
    }

    pub fn all(&self) -> Result<Vec<Arc<dyn HostDomain>>> {
        let index = self.refresh()?;
        Ok(index
            .domains
            .values()
            .map(|hd| hd.clone() as Arc<dyn HostDomain>)
            .collect())
    }
}
