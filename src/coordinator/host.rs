//! Host: the coordination record of one partition server
//!
//! A host is identified by its network address and owns:
//! - its operating state (ephemeral; absent means OFFLINE)
//! - an ordered command queue plus the command currently being executed
//! - the domains assigned to it, with per-partition build counters
//! - session-scoped statistics it reports about itself

use crate::common::Result;
use crate::coordinator::domain::{Domain, HostDomain};
use crate::coordinator::watched::WatchedValueListener;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

/// Network address of a partition server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionServerAddress {
    pub host: String,
    pub port: u16,
}

impl PartitionServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PartitionServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PartitionServerAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| crate::Error::InvalidAddress(s.to_string()))?;
        if host.is_empty() || host.contains('/') {
            return Err(crate::Error::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse()
            .map_err(|_| crate::Error::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Operating mode of a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostState {
    Offline,
    Idle,
    Serving,
    Updating,
}

impl HostState {
    /// Anything but OFFLINE counts as online
    pub fn is_online(&self) -> bool {
        !matches!(self, HostState::Offline)
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostState::Offline => write!(f, "OFFLINE"),
            HostState::Idle => write!(f, "IDLE"),
            HostState::Serving => write!(f, "SERVING"),
            HostState::Updating => write!(f, "UPDATING"),
        }
    }
}

/// Administrative instruction queued for a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostCommand {
    GoToIdle,
    ServeData,
    ExecuteUpdate,
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostCommand::GoToIdle => write!(f, "GO_TO_IDLE"),
            HostCommand::ServeData => write!(f, "SERVE_DATA"),
            HostCommand::ExecuteUpdate => write!(f, "EXECUTE_UPDATE"),
        }
    }
}

impl FromStr for HostCommand {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "GO_TO_IDLE" => Ok(HostCommand::GoToIdle),
            "SERVE_DATA" => Ok(HostCommand::ServeData),
            "EXECUTE_UPDATE" => Ok(HostCommand::ExecuteUpdate),
            _ => Err(crate::Error::Other(format!("unknown host command: {}", s))),
        }
    }
}

pub type HostStateListener = Arc<dyn WatchedValueListener<HostState>>;
pub type CommandQueueListener = Arc<dyn WatchedValueListener<Vec<HostCommand>>>;
pub type CurrentCommandListener = Arc<dyn WatchedValueListener<HostCommand>>;

/// Everything the coordinator, the partition server and monitors can do
/// with a host. Each handle has one listener slot per event kind; setting a
/// listener replaces the previous one.
pub trait Host: Send + Sync {
    fn address(&self) -> &PartitionServerAddress;

    // === State ===

    /// Current state; OFFLINE when nothing is recorded.
    fn state(&self) -> Result<HostState>;

    fn set_state(&self, state: HostState) -> Result<()>;

    /// Milliseconds since epoch at which the host last came online, or
    /// `None` while OFFLINE.
    fn up_since(&self) -> Result<Option<u64>>;

    /// Called with `None` when the state disappears (OFFLINE or session lost).
    fn set_state_change_listener(&self, listener: HostStateListener) -> Result<()>;

    fn cancel_state_change_listener(&self);

    // === Flags ===

    fn flags(&self) -> Result<Vec<String>>;

    fn set_flags(&self, flags: &[String]) -> Result<()>;

    // === Commands ===

    fn enqueue_command(&self, command: HostCommand) -> Result<()>;

    fn command_queue(&self) -> Result<Vec<HostCommand>>;

    /// Pop the head of the queue and make it the current command. Returns
    /// the new current command, `None` when the queue was empty.
    fn next_command(&self) -> Result<Option<HostCommand>>;

    fn current_command(&self) -> Result<Option<HostCommand>>;

    fn clear_command_queue(&self) -> Result<()>;

    fn set_command_queue_change_listener(&self, listener: CommandQueueListener) -> Result<()>;

    fn cancel_command_queue_change_listener(&self);

    fn set_current_command_change_listener(&self, listener: CurrentCommandListener)
        -> Result<()>;

    fn cancel_current_command_change_listener(&self);

    // === Domains ===

    /// Assigned domains, in no particular order
    fn assigned_domains(&self) -> Result<Vec<Arc<dyn HostDomain>>>;

    /// Assigned domains ordered by domain id
    fn assigned_domains_sorted(&self) -> Result<Vec<Arc<dyn HostDomain>>> {
        let mut domains = self.assigned_domains()?;
        domains.sort_by_key(|hd| hd.domain().id);
        Ok(domains)
    }

    /// Fails with `Conflict` if the domain is already assigned.
    fn add_domain(&self, domain: &Domain) -> Result<Arc<dyn HostDomain>>;

    /// Returns whether an assignment was removed.
    fn remove_domain(&self, domain: &Domain) -> Result<bool>;

    fn host_domain(&self, domain: &Domain) -> Result<Option<Arc<dyn HostDomain>>>;

    // === Statistics ===

    fn set_ephemeral_statistic(&self, key: &str, value: &str) -> Result<()>;

    fn statistic(&self, key: &str) -> Result<Option<String>>;

    fn delete_statistic(&self, key: &str) -> Result<()>;

    /// Cancel this handle's listeners and release the ephemeral presence
    /// (state, statistics) it owns.
    fn close(&self) -> Result<()>;
}

impl PartialEq for dyn Host + '_ {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for dyn Host + '_ {}

impl PartialOrd for dyn Host + '_ {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for dyn Host + '_ {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address().cmp(other.address())
    }
}

impl Hash for dyn Host + '_ {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state)
    }
}

impl fmt::Debug for dyn Host + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Host [address={}]", self.address())
    }
}
