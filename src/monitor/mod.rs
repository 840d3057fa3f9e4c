//! Host monitoring
//!
//! A [`HostMonitor`] watches one host's state and tells every notifier when
//! the host is seen OFFLINE, including when its state vanishes with its
//! session.

pub mod notifier;

pub use notifier::{HostStateNotification, LogNotifier, MemoryNotifier, Notifier};

use crate::common::{MonitorConfig, Result};
use crate::coordinator::{Host, HostState};
use std::sync::Arc;

pub struct HostMonitor {
    host: Arc<dyn Host>,
}

impl HostMonitor {
    pub fn start(
        ring_group: impl Into<String>,
        ring: u32,
        host: Arc<dyn Host>,
        notifiers: Vec<Arc<dyn Notifier>>,
    ) -> Result<Self> {
        let ring_group = ring_group.into();
        let address = host.address().clone();
        tracing::info!("Monitoring {} in {} ring {}", address, ring_group, ring);

        host.set_state_change_listener(Arc::new(move |state: Option<HostState>| {
            let state = state.unwrap_or(HostState::Offline);
            if state.is_online() {
                return;
            }
            let notification =
                HostStateNotification::new(ring_group.clone(), ring, address.clone(), state);
            for notifier in &notifiers {
                notifier.notify(&notification);
            }
        }))?;

        Ok(Self { host })
    }

    pub fn stop(&self) {
        self.host.cancel_state_change_listener();
        tracing::info!("Stopped monitoring {}", self.host.address());
    }
}

/// Notifiers enabled by configuration
pub fn configured_notifiers(config: &MonitorConfig) -> Vec<Arc<dyn Notifier>> {
    let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
    if config.log_notifications {
        notifiers.push(Arc::new(LogNotifier));
    }
    notifiers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{MemoryHost, PartitionServerAddress};

    #[test]
    fn test_notifies_on_offline_only() {
        let host = Arc::new(MemoryHost::new(PartitionServerAddress::new("h", 1)));
        let notifier = Arc::new(MemoryNotifier::new());
        let notifiers: Vec<Arc<dyn Notifier>> = vec![notifier.clone()];
        let monitor = HostMonitor::start("rg", 0, host.clone(), notifiers).unwrap();

        host.set_state(HostState::Idle).unwrap();
        host.set_state(HostState::Serving).unwrap();
        assert!(notifier.is_empty());

        host.disconnect();
        let seen = notifier.notifications();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].state, HostState::Offline);
        assert_eq!(seen[0].address, PartitionServerAddress::new("h", 1));

        monitor.stop();
        host.set_state(HostState::Idle).unwrap();
        host.set_state(HostState::Offline).unwrap();
        assert_eq!(notifier.len(), 1);
    }

    #[test]
    fn test_configured_notifiers() {
        let mut config = MonitorConfig::default();
        assert_eq!(configured_notifiers(&config).len(), 1);
        config.log_notifications = false;
        assert!(configured_notifiers(&config).is_empty());
    }
}
