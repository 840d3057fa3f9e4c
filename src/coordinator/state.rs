//! Host state stored as an ephemeral node
//!
//! The node exists only while the host is online: OFFLINE is written by
//! deleting it, and losing the writer's session deletes it too. Up-since is
//! the node's creation time on the store clock.

use crate::common::{Error, Result};
use crate::coordinator::host::{HostState, HostStateListener};
use crate::coordinator::watched::{NodeValue, WatchedValue};
use crate::store::{decode_optional, encode, CoordinationStore, CreateMode};
use std::sync::Arc;

pub struct HostStateNode {
    store: Arc<dyn CoordinationStore>,
    path: String,
    watched: WatchedValue<NodeValue<HostState>>,
}

impl HostStateNode {
    pub fn new(store: Arc<dyn CoordinationStore>, path: String) -> Self {
        let watched = WatchedValue::new(store.clone(), NodeValue::new(path.clone()));
        Self {
            store,
            path,
            watched,
        }
    }

    /// An ended session reads as OFFLINE: its state node went with it.
    pub fn get(&self) -> Result<HostState> {
        match self.watched.read() {
            Ok(state) => Ok(state.unwrap_or(HostState::Offline)),
            Err(Error::SessionEnded(_)) => Ok(HostState::Offline),
            Err(e) => Err(e),
        }
    }

    pub fn set(&self, state: HostState) -> Result<()> {
        if !state.is_online() {
            return match self.store.delete(&self.path, None) {
                Ok(()) | Err(Error::NoNode(_)) => Ok(()),
                Err(e) => Err(e),
            };
        }

        let data = encode(&state)?;
        match self.store.set_data(&self.path, data.clone(), None) {
            Ok(_) => Ok(()),
            Err(Error::NoNode(_)) => {
                match self
                    .store
                    .create(&self.path, data.clone(), CreateMode::Ephemeral)
                {
                    Ok(_) => Ok(()),
                    // Someone else brought it online first; last write wins
                    Err(Error::NodeExists(_)) => {
                        self.store.set_data(&self.path, data, None).map(|_| ())
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub fn up_since(&self) -> Result<Option<u64>> {
        let (data, stat) = match self.store.get_data(&self.path, None) {
            Ok(Some(found)) => found,
            Ok(None) | Err(Error::SessionEnded(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(match decode_optional::<HostState>(&data)? {
            Some(state) if state.is_online() => Some(stat.ctime),
            _ => None,
        })
    }

    pub fn subscribe(&self, listener: HostStateListener) -> Result<()> {
        self.watched.subscribe(listener)
    }

    pub fn unsubscribe(&self) {
        self.watched.unsubscribe()
    }

    /// Delete the state node if this session created it.
    pub fn release(&self) -> Result<()> {
        let stat = match self.store.exists(&self.path, None) {
            Ok(Some(stat)) => stat,
            // Nothing left to release once the session is gone
            Ok(None) | Err(Error::SessionEnded(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if stat.ephemeral_owner != Some(self.store.session_id()) {
            return Ok(());
        }
        match self.store.delete(&self.path, Some(stat.version)) {
            Ok(()) | Err(Error::NoNode(_)) | Err(Error::BadVersion { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
