//! Session-scoped statistics a host reports about itself

use crate::common::{decode_key, encode_key, join_path, Error, Result};
use crate::store::{CoordinationStore, CreateMode};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct EphemeralStatistics {
    store: Arc<dyn CoordinationStore>,
    path: String,
}

impl EphemeralStatistics {
    pub fn new(store: Arc<dyn CoordinationStore>, path: String) -> Self {
        Self { store, path }
    }

    fn key_path(&self, key: &str) -> String {
        join_path(&self.path, &encode_key(key))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.key_path(key);
        let data = value.as_bytes().to_vec();
        match self.store.set_data(&path, data.clone(), None) {
            Ok(_) => Ok(()),
            Err(Error::NoNode(_)) => match self.store.create(&path, data.clone(), CreateMode::Ephemeral)
            {
                Ok(_) => Ok(()),
                Err(Error::NodeExists(_)) => self.store.set_data(&path, data, None).map(|_| ()),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Statistics of an ended session are gone, so they read as absent.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        match self.store.get_data(&self.key_path(key), None) {
            Ok(Some((data, _))) => String::from_utf8(data)
                .map(Some)
                .map_err(|e| Error::Serialization(format!("statistic {}: {}", key, e))),
            Ok(None) | Err(Error::SessionEnded(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        match self.store.delete(&self.key_path(key), None) {
            Ok(()) | Err(Error::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Every statistic currently reported
    pub fn all(&self) -> Result<BTreeMap<String, String>> {
        let mut stats = BTreeMap::new();
        let children = match self.store.get_children(&self.path, None) {
            Ok(children) => children.unwrap_or_default(),
            Err(Error::SessionEnded(_)) => return Ok(stats),
            Err(e) => return Err(e),
        };
        for child in children {
            let key = decode_key(&child)?;
            if let Some(value) = self.get(&key)? {
                stats.insert(key, value);
            }
        }
        Ok(stats)
    }

    /// Delete the statistics created by this session.
    pub fn release(&self) -> Result<()> {
        let session = self.store.session_id();
        let children = match self.store.get_children(&self.path, None) {
            Ok(children) => children.unwrap_or_default(),
            Err(Error::SessionEnded(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        for child in children {
            let path = join_path(&self.path, &child);
            if let Some(stat) = self.store.exists(&path, None)? {
                if stat.ephemeral_owner == Some(session) {
                    match self.store.delete(&path, None) {
                        Ok(()) | Err(Error::NoNode(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }
}
