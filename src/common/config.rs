//! Configuration for hostcoord components
//!
//! Values come from an optional TOML file, then `HOSTCOORD__*` environment
//! variables (double underscore separates sections, e.g.
//! `HOSTCOORD__COORDINATION__ROOT=/cluster/hosts`).

use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

const ENV_PREFIX: &str = "HOSTCOORD";

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Coordination store layout and queue tuning
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Host monitoring
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Coordination store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Path under which one node per host is kept
    #[serde(default = "default_root")]
    pub root: String,

    /// How many times `next_command` re-reads the queue after losing a race
    #[serde(default = "default_max_dequeue_retries")]
    pub max_dequeue_retries: usize,
}

fn default_root() -> String {
    "/hostcoord/hosts".to_string()
}
fn default_max_dequeue_retries() -> usize {
    16
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            max_dequeue_retries: default_max_dequeue_retries(),
        }
    }
}

/// Monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Ring group label attached to notifications
    #[serde(default = "default_ring_group")]
    pub ring_group: String,

    /// Emit notifications through the log notifier
    #[serde(default = "default_log_notifications")]
    pub log_notifications: bool,
}

fn default_ring_group() -> String {
    "default".to_string()
}
fn default_log_notifications() -> bool {
    true
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            ring_group: default_ring_group(),
            log_notifications: default_log_notifications(),
        }
    }
}

impl Config {
    /// Load `hostcoord.toml` from the working directory if present, then the
    /// environment. Falls back to defaults when nothing parses.
    pub fn load() -> Self {
        match Self::load_from(None::<&Path>) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Falling back to default configuration: {}", e);
                Self::default()
            }
        }
    }

    /// Load from an explicit file (required) or the default optional file,
    /// with environment overrides on top.
    pub fn load_from(path: Option<impl AsRef<Path>>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path.as_ref()).required(true),
            None => config::File::with_name("hostcoord").required(false),
        };

        let config: Config = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let root = &self.coordination.root;
        if !root.starts_with('/') || root.len() < 2 || root.ends_with('/') {
            return Err(crate::Error::InvalidConfig(format!(
                "coordination.root must be an absolute path without trailing '/': {}",
                root
            )));
        }
        if self.coordination.max_dequeue_retries == 0 {
            return Err(crate::Error::InvalidConfig(
                "coordination.max_dequeue_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
