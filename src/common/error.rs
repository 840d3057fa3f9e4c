//! Error types for hostcoord

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Coordination Store Errors ===
    #[error("Communication error: {0}")]
    Communication(String),

    /// The client's session was closed or expired; its ephemeral nodes are gone.
    #[error("Session {0:#x} has ended")]
    SessionEnded(u64),

    #[error("No node at {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Version mismatch at {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Cannot create children under ephemeral node: {0}")]
    NoChildrenForEphemerals(String),

    // === Host Errors ===
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown domain id: {0}")]
    UnknownDomain(u32),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Programming error: {0}")]
    Programming(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Communication(_) | Error::Conflict(_))
    }

    /// Did a conditional store operation lose a race?
    ///
    /// These are the store-level outcomes that higher layers translate into
    /// [`Error::Conflict`] or retry on.
    pub fn is_store_conflict(&self) -> bool {
        matches!(
            self,
            Error::NoNode(_) | Error::NodeExists(_) | Error::BadVersion { .. } | Error::NotEmpty(_)
        )
    }

    /// Turn a store-level race into a `Conflict`, leaving other errors untouched.
    pub fn into_conflict(self, context: &str) -> Error {
        if self.is_store_conflict() {
            Error::Conflict(format!("{}: {}", context, self))
        } else {
            self
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
