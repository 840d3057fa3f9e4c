//! Utility functions for hostcoord

use chrono::{DateTime, Utc};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Percent-encoding set for node names (includes /, %, and control chars)
const KEY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'%')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'&');

/// Encode a key so it can be used as a single path segment
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ENCODE_SET).to_string()
}

/// Decode a percent-encoded key
pub fn decode_key(encoded: &str) -> crate::Result<String> {
    percent_decode_str(encoded)
        .decode_utf8()
        .map(|s| s.to_string())
        .map_err(|e| crate::Error::Other(format!("Failed to decode key: {}", e)))
}

/// Join a parent path and a child name
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Parent of an absolute path (`None` for the root)
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a path
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Validate an absolute store path
pub fn validate_path(path: &str) -> crate::Result<()> {
    if !path.starts_with('/') {
        return Err(crate::Error::Programming(format!(
            "path must be absolute: {}",
            path
        )));
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(crate::Error::Programming(format!(
            "path must not end with '/': {}",
            path
        )));
    }
    if path.contains("//") {
        return Err(crate::Error::Programming(format!(
            "path contains an empty segment: {}",
            path
        )));
    }
    Ok(())
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Render a millisecond timestamp as RFC 3339
pub fn format_millis(millis: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis as i64)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

/// Retry a store operation with exponential backoff while it fails with a
/// retryable error (lost session, lost race).
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let attempts = max_retries.max(1);
    let mut delay = initial_delay;

    for attempt in 1..=attempts {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < attempts => {
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_key() {
        let key = "disk/used bytes";
        let encoded = encode_key(key);
        assert!(encoded.contains("%2F"));
        assert!(!encoded.contains('/'));

        let decoded = decode_key(&encoded).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_paths() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
        assert_eq!(parent_path("/a/b"), Some("/a"));
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/"), None);
        assert_eq!(node_name("/a/b/command_0000000001"), "command_0000000001");
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/hosts/h1:1234").is_ok());
        assert!(validate_path("hosts").is_err());
        assert!(validate_path("/hosts/").is_err());
        assert!(validate_path("/hosts//x").is_err());
    }

    #[test]
    fn test_format_millis() {
        assert_eq!(format_millis(0), "1970-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn test_retry_with_backoff() {
        let mut calls = 0;
        let result = retry_with_backoff(
            || {
                calls += 1;
                let n = calls;
                async move {
                    if n < 3 {
                        Err(crate::Error::Conflict("lost race".into()))
                    } else {
                        Ok(n)
                    }
                }
            },
            5,
            Duration::from_millis(1),
        )
        .await;
        assert_eq!(result.unwrap(), 3);

        let result: crate::Result<()> = retry_with_backoff(
            || async { Err(crate::Error::NotFound("host".into())) },
            5,
            Duration::from_millis(1),
        )
        .await;
        assert!(matches!(result, Err(crate::Error::NotFound(_))));
    }
}
