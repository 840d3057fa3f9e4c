//! Notifications raised by monitors and where they go

use crate::coordinator::{HostState, PartitionServerAddress};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// A host was observed in a given state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStateNotification {
    pub ring_group: String,
    pub ring: u32,
    pub address: PartitionServerAddress,
    pub state: HostState,
    pub observed_at: DateTime<Utc>,
}

impl HostStateNotification {
    pub fn new(
        ring_group: impl Into<String>,
        ring: u32,
        address: PartitionServerAddress,
        state: HostState,
    ) -> Self {
        Self {
            ring_group: ring_group.into(),
            ring,
            address,
            state,
            observed_at: Utc::now(),
        }
    }
}

impl fmt::Display for HostStateNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} > Ring {} > {} is {}",
            self.ring_group, self.ring, self.address, self.state
        )
    }
}

/// Destination for notifications. Called from store watch dispatch, so it
/// must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &HostStateNotification);
}

/// Writes notifications to the log as JSON
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &HostStateNotification) {
        match serde_json::to_string(notification) {
            Ok(body) => tracing::warn!("{}: {}", notification, body),
            Err(e) => tracing::warn!("{} (could not encode: {})", notification, e),
        }
    }
}

/// Keeps every notification, for tests and the simulator
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    notifications: Mutex<Vec<HostStateNotification>>,
    changed: Notify,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<HostStateNotification>> {
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notifications(&self) -> Vec<HostStateNotification> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` notifications arrived. Returns false on
    /// timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, self.changed.notified())
                .await
                .is_err()
            {
                return self.len() >= count;
            }
        }
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, notification: &HostStateNotification) {
        self.lock().push(notification.clone());
        self.changed.notify_one();
    }
}
