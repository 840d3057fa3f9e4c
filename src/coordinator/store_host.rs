//! Host backed by the coordination store
//!
//! Layout under `<root>/<host:port>`:
//!
//! ```text
//! flags                       persistent, encoded Vec<String>
//! state                       ephemeral, encoded HostState (absent = OFFLINE)
//! command_queue/command_N     persistent sequential, encoded HostCommand
//! current_command             persistent, empty = none
//! domains/<id>/partitions/<p> persistent, encoded PartitionProperties
//! statistics/<key>            ephemeral, UTF-8 value
//! ```

use crate::common::{join_path, CoordinationConfig, Error, Result};
use crate::coordinator::command_queue::CommandQueue;
use crate::coordinator::domain::{Domain, DomainResolver, HostDomain};
use crate::coordinator::domains::DomainAssignment;
use crate::coordinator::host::{
    CommandQueueListener, CurrentCommandListener, Host, HostCommand, HostState,
    HostStateListener, PartitionServerAddress,
};
use crate::coordinator::state::HostStateNode;
use crate::coordinator::statistics::EphemeralStatistics;
use crate::store::{self, decode, encode, CoordinationStore, CreateMode, Op};
use std::collections::BTreeMap;
use std::sync::Arc;

const FLAGS: &str = "flags";
const STATE: &str = "state";
const COMMAND_QUEUE: &str = "command_queue";
const CURRENT_COMMAND: &str = "current_command";
const DOMAINS: &str = "domains";
const STATISTICS: &str = "statistics";

/// What every store-backed host handle needs
#[derive(Clone)]
pub struct HostContext {
    pub store: Arc<dyn CoordinationStore>,
    pub domains: Arc<dyn DomainResolver>,
    pub config: CoordinationConfig,
}

impl HostContext {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        domains: Arc<dyn DomainResolver>,
        config: CoordinationConfig,
    ) -> Self {
        Self {
            store,
            domains,
            config,
        }
    }

    fn host_path(&self, address: &PartitionServerAddress) -> String {
        join_path(&self.config.root, &address.to_string())
    }
}

pub struct StoreHost {
    store: Arc<dyn CoordinationStore>,
    address: PartitionServerAddress,
    path: String,
    state: HostStateNode,
    commands: CommandQueue,
    domains: DomainAssignment,
    statistics: EphemeralStatistics,
}

impl StoreHost {
    fn open(ctx: &HostContext, address: PartitionServerAddress) -> Self {
        let path = ctx.host_path(&address);
        let store = ctx.store.clone();
        Self {
            state: HostStateNode::new(store.clone(), join_path(&path, STATE)),
            commands: CommandQueue::new(
                store.clone(),
                join_path(&path, COMMAND_QUEUE),
                join_path(&path, CURRENT_COMMAND),
                ctx.config.max_dequeue_retries,
            ),
            domains: DomainAssignment::new(
                store.clone(),
                join_path(&path, DOMAINS),
                ctx.domains.clone(),
            ),
            statistics: EphemeralStatistics::new(store.clone(), join_path(&path, STATISTICS)),
            store,
            address,
            path,
        }
    }

    /// Register a new host. Fails with `Conflict` if it already exists.
    pub fn create(
        ctx: &HostContext,
        address: PartitionServerAddress,
        flags: &[String],
    ) -> Result<Self> {
        store::ensure_path(ctx.store.as_ref(), &ctx.config.root)?;
        let path = ctx.host_path(&address);

        let persistent = |name: &str, data: Vec<u8>| Op::Create {
            path: join_path(&path, name),
            data,
            mode: CreateMode::Persistent,
        };
        ctx.store
            .multi(vec![
                Op::Create {
                    path: path.clone(),
                    data: Vec::new(),
                    mode: CreateMode::Persistent,
                },
                persistent(FLAGS, encode(&flags.to_vec())?),
                persistent(COMMAND_QUEUE, Vec::new()),
                persistent(CURRENT_COMMAND, Vec::new()),
                persistent(DOMAINS, Vec::new()),
                persistent(STATISTICS, Vec::new()),
            ])
            .map_err(|e| match e {
                Error::NodeExists(_) => {
                    Error::Conflict(format!("host {} already exists", address))
                }
                e => e,
            })?;

        tracing::info!("Created host {} at {}", address, path);
        Ok(Self::open(ctx, address))
    }

    /// Open a handle on an existing host
    pub fn load(ctx: &HostContext, address: PartitionServerAddress) -> Result<Self> {
        let path = ctx.host_path(&address);
        if ctx.store.exists(&path, None)?.is_none() {
            return Err(Error::NotFound(format!("host {}", address)));
        }
        Ok(Self::open(ctx, address))
    }

    /// Handles on every registered host, ordered by address
    pub fn list(ctx: &HostContext) -> Result<Vec<StoreHost>> {
        let children = ctx
            .store
            .get_children(&ctx.config.root, None)?
            .unwrap_or_default();
        let mut addresses = Vec::with_capacity(children.len());
        for child in children {
            match child.parse::<PartitionServerAddress>() {
                Ok(address) => addresses.push(address),
                Err(e) => tracing::warn!("Skipping unexpected node under {}: {}", ctx.config.root, e),
            }
        }
        addresses.sort();
        Ok(addresses
            .into_iter()
            .map(|address| Self::open(ctx, address))
            .collect())
    }

    /// Decommission: remove the whole host record.
    pub fn delete(&self) -> Result<()> {
        self.cancel_listeners();
        store::delete_recursive(self.store.as_ref(), &self.path)?;
        tracing::info!("Deleted host {}", self.address);
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Every statistic currently reported by the host
    pub fn statistics(&self) -> Result<BTreeMap<String, String>> {
        self.statistics.all()
    }

    fn cancel_listeners(&self) {
        self.state.unsubscribe();
        self.commands.unsubscribe_queue();
        self.commands.unsubscribe_current();
    }
}

impl Host for StoreHost {
    fn address(&self) -> &PartitionServerAddress {
        &self.address
    }

    fn state(&self) -> Result<HostState> {
        self.state.get()
    }

    fn set_state(&self, state: HostState) -> Result<()> {
        self.state.set(state)?;
        tracing::debug!("Host {} set to {}", self.address, state);
        Ok(())
    }

    fn up_since(&self) -> Result<Option<u64>> {
        self.state.up_since()
    }

    fn set_state_change_listener(&self, listener: HostStateListener) -> Result<()> {
        self.state.subscribe(listener)
    }

    fn cancel_state_change_listener(&self) {
        self.state.unsubscribe()
    }

    fn flags(&self) -> Result<Vec<String>> {
        match self.store.get_data(&join_path(&self.path, FLAGS), None)? {
            Some((data, _)) if !data.is_empty() => decode(&data),
            _ => Ok(Vec::new()),
        }
    }

    fn set_flags(&self, flags: &[String]) -> Result<()> {
        let path = join_path(&self.path, FLAGS);
        let data = encode(&flags.to_vec())?;
        match self.store.set_data(&path, data.clone(), None) {
            Ok(_) => Ok(()),
            Err(Error::NoNode(_)) => self
                .store
                .create(&path, data, CreateMode::Persistent)
                .map(|_| ())
                .map_err(|e| match e {
                    Error::NoNode(_) => Error::NotFound(format!("host {}", self.address)),
                    e => e,
                }),
            Err(e) => Err(e),
        }
    }

    fn enqueue_command(&self, command: HostCommand) -> Result<()> {
        self.commands.enqueue(command)
    }

    fn command_queue(&self) -> Result<Vec<HostCommand>> {
        self.commands.snapshot()
    }

    fn next_command(&self) -> Result<Option<HostCommand>> {
        self.commands.next()
    }

    fn current_command(&self) -> Result<Option<HostCommand>> {
        self.commands.current()
    }

    fn clear_command_queue(&self) -> Result<()> {
        self.commands.clear()
    }

    fn set_command_queue_change_listener(&self, listener: CommandQueueListener) -> Result<()> {
        self.commands.subscribe_queue(listener)
    }

    fn cancel_command_queue_change_listener(&self) {
        self.commands.unsubscribe_queue()
    }

    fn set_current_command_change_listener(
        &self,
        listener: CurrentCommandListener,
    ) -> Result<()> {
        self.commands.subscribe_current(listener)
    }

    fn cancel_current_command_change_listener(&self) {
        self.commands.unsubscribe_current()
    }

    fn assigned_domains(&self) -> Result<Vec<Arc<dyn HostDomain>>> {
        self.domains.all()
    }

    fn add_domain(&self, domain: &Domain) -> Result<Arc<dyn HostDomain>> {
        self.domains.add(domain)
    }

    fn remove_domain(&self, domain: &Domain) -> Result<bool> {
        self.domains.remove(domain)
    }

    fn host_domain(&self, domain: &Domain) -> Result<Option<Arc<dyn HostDomain>>> {
        self.domains.get(domain)
    }

    fn set_ephemeral_statistic(&self, key: &str, value: &str) -> Result<()> {
        self.statistics.set(key, value)
    }

    fn statistic(&self, key: &str) -> Result<Option<String>> {
        self.statistics.get(key)
    }

    fn delete_statistic(&self, key: &str) -> Result<()> {
        self.statistics.delete(key)
    }

    fn close(&self) -> Result<()> {
        self.cancel_listeners();
        self.state.release()?;
        self.statistics.release()?;
        tracing::debug!("Closed handle on host {}", self.address);
        Ok(())
    }
}

impl std::fmt::Debug for StoreHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StoreHost [address={}]", self.address)
    }
}
