//! # hostcoord
//!
//! Host coordination for a sharded key-value serving cluster:
//! - Host state with session-bound liveness (ephemeral, OFFLINE when absent)
//! - Ordered per-host command queues with exactly-once dequeue
//! - Domain assignments with per-partition build counters
//! - Ephemeral statistics and durable change subscriptions
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────┐  enqueue / assign   ┌──────────────────────────┐
//! │ Coordinator  │────────────────────▶│  Coordination store      │
//! └──────────────┘                     │  <root>/<host:port>/     │
//!                                      │    state (ephemeral)     │
//! ┌──────────────┐  state / dequeue    │    command_queue/...     │
//! │ Partition    │────────────────────▶│    current_command       │
//! │ server       │                     │    domains/<id>/...      │
//! └──────────────┘                     │    statistics/...        │
//!                                      └────────────┬─────────────┘
//! ┌──────────────┐        watches                   │
//! │ HostMonitor  │◀─────────────────────────────────┘
//! └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Simulate three hosts processing commands, then lose one
//! hostctl simulate --hosts 3 --commands serve_data,execute_update,go_to_idle
//! ```

pub mod common;
pub mod coordinator;
pub mod monitor;
pub mod node;
pub mod store;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{Host, HostCommand, HostState, MemoryHost, PartitionServerAddress, StoreHost};
pub use monitor::HostMonitor;
pub use store::{CoordinationStore, MemoryStore};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
