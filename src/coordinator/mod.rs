//! Host coordination
//!
//! The coordination record of each partition server:
//! - State (ephemeral, OFFLINE when absent)
//! - Command queue and current command
//! - Domain assignments with per-partition counters
//! - Ephemeral statistics
//!
//! [`Host`] is implemented over the coordination store ([`StoreHost`]) and
//! in memory ([`MemoryHost`]).

pub mod command_queue;
pub mod domain;
pub mod domains;
pub mod host;
pub mod hosts;
pub mod memory_host;
pub mod state;
pub mod statistics;
pub mod store_host;
pub mod watched;

pub use domain::{Domain, DomainResolver, HostDomain, PartitionProperties, StaticDomainResolver};
pub use host::{
    CommandQueueListener, CurrentCommandListener, Host, HostCommand, HostState,
    HostStateListener, PartitionServerAddress,
};
pub use hosts::HostStatus;
pub use memory_host::MemoryHost;
pub use store_host::{HostContext, StoreHost};
pub use watched::{WatchedValue, WatchedValueListener};
