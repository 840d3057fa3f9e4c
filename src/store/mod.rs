//! Coordination store abstraction
//!
//! A hierarchical, watch-capable key/value service in the style of ZooKeeper:
//! - persistent, ephemeral (session scoped) and sequential nodes
//! - one-shot watches on node data and on child listings
//! - conditional writes and atomic multi-op batches
//!
//! One [`CoordinationStore`] value is one client session. The host layer only
//! talks to the store through this trait; [`memory::MemoryStore`] is the
//! in-process implementation.

pub mod memory;

pub use memory::{MemoryStore, Session};

use crate::common::{utils, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Callback armed on a path; fires at most once.
pub type Watcher = Box<dyn FnOnce(WatchedEvent) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    NodeCreated,
    NodeDataChanged,
    NodeDeleted,
    NodeChildrenChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub event_type: EventType,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, CreateMode::PersistentSequential)
    }
}

/// Node metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Data version, bumped on every `set_data`
    pub version: u64,
    /// Child version, bumped on every child create/delete
    pub cversion: u64,
    /// Creation time (store clock, ms since epoch)
    pub ctime: u64,
    /// Last modification time (store clock, ms since epoch)
    pub mtime: u64,
    /// Owning session for ephemeral nodes
    pub ephemeral_owner: Option<u64>,
    pub num_children: usize,
}

/// One step of an atomic [`CoordinationStore::multi`] batch
#[derive(Debug, Clone)]
pub enum Op {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    SetData {
        path: String,
        data: Vec<u8>,
        version: Option<u64>,
    },
    Delete {
        path: String,
        version: Option<u64>,
    },
    Check {
        path: String,
        version: u64,
    },
}

pub trait CoordinationStore: Send + Sync {
    /// Session this client operates under
    fn session_id(&self) -> u64;

    /// Create a node and return its actual path (sequential nodes get a
    /// zero-padded counter appended).
    fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String>;

    /// Read node data. The watcher, if any, is armed in the same step and
    /// fires on the next create, data change or delete of `path`.
    fn get_data(&self, path: &str, watcher: Option<Watcher>) -> Result<Option<(Vec<u8>, Stat)>>;

    /// Same watch semantics as [`CoordinationStore::get_data`].
    fn exists(&self, path: &str, watcher: Option<Watcher>) -> Result<Option<Stat>>;

    /// Sorted child names. The watcher fires on the next child create/delete
    /// or when `path` itself is deleted.
    fn get_children(&self, path: &str, watcher: Option<Watcher>) -> Result<Option<Vec<String>>>;

    fn set_data(&self, path: &str, data: Vec<u8>, version: Option<u64>) -> Result<Stat>;

    fn delete(&self, path: &str, version: Option<u64>) -> Result<()>;

    /// Apply all ops or none. Watches fire only after the batch commits.
    fn multi(&self, ops: Vec<Op>) -> Result<()>;
}

/// Encode a node payload
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode a node payload
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Decode a payload where an empty body means "no value"
pub fn decode_optional<T: DeserializeOwned>(bytes: &[u8]) -> Result<Option<T>> {
    if bytes.is_empty() {
        Ok(None)
    } else {
        decode(bytes).map(Some)
    }
}

/// Create every missing persistent node along `path`.
pub fn ensure_path(store: &dyn CoordinationStore, path: &str) -> Result<()> {
    utils::validate_path(path)?;
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        match store.create(&current, Vec::new(), CreateMode::Persistent) {
            Ok(_) | Err(crate::Error::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Delete `path` and everything below it. Absent nodes are skipped.
pub fn delete_recursive(store: &dyn CoordinationStore, path: &str) -> Result<()> {
    if let Some(children) = store.get_children(path, None)? {
        for child in children {
            delete_recursive(store, &utils::join_path(path, &child))?;
        }
    }
    match store.delete(path, None) {
        Ok(()) | Err(crate::Error::NoNode(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ensure_and_delete_recursive() {
        let store = MemoryStore::new().unwrap();
        let session = store.connect();

        ensure_path(session.as_ref(), "/a/b/c").unwrap();
        ensure_path(session.as_ref(), "/a/b/c").unwrap();
        session
            .create("/a/b/c/leaf", b"x".to_vec(), CreateMode::Persistent)
            .unwrap();
        assert!(session.exists("/a/b/c/leaf", None).unwrap().is_some());

        delete_recursive(session.as_ref(), "/a/b").unwrap();
        assert!(session.exists("/a/b", None).unwrap().is_none());
        assert!(session.exists("/a", None).unwrap().is_some());

        // Absent subtree is not an error
        delete_recursive(session.as_ref(), "/a/b").unwrap();
    }

    #[test]
    fn test_decode_optional() {
        assert_eq!(decode_optional::<u32>(&[]).unwrap(), None);
        let bytes = encode(&7u32).unwrap();
        assert_eq!(decode_optional::<u32>(&bytes).unwrap(), Some(7));
    }
}
