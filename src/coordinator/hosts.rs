//! Helpers over any [`Host`]

use crate::common::Error;
use crate::coordinator::host::{Host, HostState};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What is known about a host right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostStatus {
    Online(HostState),
    Offline,
    /// The store could not be reached; the host may well be up.
    Unknown,
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostStatus::Online(state) => write!(f, "{}", state),
            HostStatus::Offline => write!(f, "OFFLINE"),
            HostStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

pub fn status(host: &dyn Host) -> HostStatus {
    match host.state() {
        Ok(state) if state.is_online() => HostStatus::Online(state),
        Ok(_) => HostStatus::Offline,
        Err(Error::Communication(e)) => {
            tracing::warn!("State of {} unknown: {}", host.address(), e);
            HostStatus::Unknown
        }
        Err(e) => {
            tracing::warn!("Could not read state of {}: {}", host.address(), e);
            HostStatus::Unknown
        }
    }
}

/// True only when the host is known to be online
pub fn is_online(host: &dyn Host) -> bool {
    matches!(status(host), HostStatus::Online(_))
}
