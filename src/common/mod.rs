//! Common utilities and types shared across hostcoord

pub mod config;
pub mod error;
pub mod utils;

pub use config::{Config, CoordinationConfig, MonitorConfig};
pub use error::{Error, Result};
pub use utils::{
    decode_key, encode_key, format_millis, join_path, retry_with_backoff, timestamp_now_millis,
};
