//! Utility functions for tierstore

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::time::{SystemTime, UNIX_EPOCH};

/// Percent-encoding set for object keys used as filesystem path segments
/// (includes /, %, and control chars so nested keys map to a single segment)
const KEY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'%')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'&')
    .add(b'\\');

/// Percent-encoding set for URL paths: keeps `/` as a real separator so
/// nested object keys stay multi-segment on the wire
const PATH_ENCODE_SET: &AsciiSet = &CONTROLS.add(b'%').add(b' ').add(b'?').add(b'#');

/// Encode an object key for filesystem usage
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ENCODE_SET).to_string()
}

/// Encode an object key for use inside a URL path, preserving `/`
pub fn encode_path(key: &str) -> String {
    utf8_percent_encode(key, PATH_ENCODE_SET).to_string()
}

/// Decode a percent-encoded object key
pub fn decode_key(encoded: &str) -> crate::Result<String> {
    percent_decode_str(encoded)
        .decode_utf8()
        .map(|s| s.to_string())
        .map_err(|e| crate::Error::InvalidRequest(format!("failed to decode key: {}", e)))
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Validate a bucket name (DNS-style: lowercase alphanumerics and hyphens,
/// no leading/trailing hyphen, 3-63 chars)
pub fn validate_bucket_name(name: &str) -> crate::Result<()> {
    if name.len() < 3 || name.len() > 63 {
        return Err(crate::Error::InvalidRequest(
            "bucket name must be 3-63 characters".into(),
        ));
    }

    if name.starts_with('-') || name.ends_with('-') {
        return Err(crate::Error::InvalidRequest(
            "bucket name cannot start or end with a hyphen".into(),
        ));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(crate::Error::InvalidRequest(
            "bucket name must be lowercase alphanumerics and hyphens".into(),
        ));
    }

    Ok(())
}

/// Validate an object key (non-empty UTF-8, no control chars, bounded length)
pub fn validate_object_key(key: &str) -> crate::Result<()> {
    if key.is_empty() {
        return Err(crate::Error::InvalidRequest(
            "object key cannot be empty".into(),
        ));
    }

    if key.len() > 1024 {
        return Err(crate::Error::InvalidRequest(
            "object key too long (max 1024 bytes)".into(),
        ));
    }

    if key.chars().any(|c| c.is_control()) {
        return Err(crate::Error::InvalidRequest(
            "object key contains control characters".into(),
        ));
    }

    Ok(())
}

/// Retry with exponential backoff. Used for calls to external collaborators:
/// retries only retryable errors, gives up once the total delay budget is spent.
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    budget: std::time::Duration,
    initial_delay: std::time::Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let start = std::time::Instant::now();
    let mut delay = initial_delay;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && start.elapsed() + delay < budget => {
                tracing::warn!("retrying after error: {}, next attempt in {:?}", e, delay);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_key() {
        let key = "my/path/to/file.txt";
        let encoded = encode_key(key);
        assert!(encoded.contains("%2F"));
        assert!(!encoded.contains('/'));

        let decoded = decode_key(&encoded).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_encode_path_preserves_slashes() {
        assert_eq!(encode_path("docs/2024/report.pdf"), "docs/2024/report.pdf");
        assert_eq!(encode_path("with space.txt"), "with%20space.txt");
        assert_eq!(encode_path("100%.txt"), "100%25.txt");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
    }

    #[test]
    fn test_validate_bucket_name() {
        assert!(validate_bucket_name("my-bucket-01").is_ok());
        assert!(validate_bucket_name("ab").is_err());
        assert!(validate_bucket_name("-leading").is_err());
        assert!(validate_bucket_name("trailing-").is_err());
        assert!(validate_bucket_name("UpperCase").is_err());
        assert!(validate_bucket_name(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_validate_object_key() {
        assert!(validate_object_key("docs/2024/report.pdf").is_ok());
        assert!(validate_object_key("").is_err());
        assert!(validate_object_key(&"x".repeat(2000)).is_err());
        assert!(validate_object_key("bad\x01key").is_err());
    }
}
