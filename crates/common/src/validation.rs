//! Input validation for identity keys, endpoint URLs and tunables.
//!
//! Everything that arrives from an operator request or from the environment
//! goes through here before it reaches a store or an HTTP client.

use anyhow::{anyhow, Result};

use crate::frames::UNKNOWN_PREFIX;

pub const MAX_USERNAME_LENGTH: usize = 64;
pub const MAX_URI_LENGTH: usize = 4096;
pub const MAX_ID_LENGTH: usize = 256;

/// Upper bound for any count-style tunable (history lengths, windows, caps)
pub const MAX_TUNABLE: usize = 100_000;

pub fn validate_length(value: &str, max_length: usize, field_name: &str) -> Result<()> {
    if value.len() > max_length {
        return Err(anyhow!(
            "{} exceeds maximum length of {} bytes (got {})",
            field_name,
            max_length,
            value.len()
        ));
    }
    Ok(())
}

pub fn validate_non_empty(value: &str, field_name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{} cannot be empty", field_name));
    }
    Ok(())
}

/// Validate an opaque id (session ids and similar)
pub fn validate_id(id: &str, field_name: &str) -> Result<()> {
    validate_non_empty(id, field_name)?;
    validate_length(id, MAX_ID_LENGTH, field_name)?;

    if id.contains("..") || id.contains('/') || id.contains('\\') {
        return Err(anyhow!(
            "{} contains invalid characters (no path separators or '..' allowed)",
            field_name
        ));
    }

    Ok(())
}

/// Validate a username for a known identity. The `Unknown` prefix is reserved
/// for unmatched faces, so a known identity can never carry it.
pub fn validate_username(username: &str) -> Result<()> {
    validate_id(username, "username")?;
    validate_length(username, MAX_USERNAME_LENGTH, "username")?;

    if username != username.trim() {
        return Err(anyhow!("username cannot have leading or trailing whitespace"));
    }
    if username.starts_with(UNKNOWN_PREFIX) {
        return Err(anyhow!(
            "username cannot start with the reserved prefix '{}'",
            UNKNOWN_PREFIX
        ));
    }

    Ok(())
}

/// Validate an HTTP(S) base URL for the inference endpoint
pub fn validate_http_url(uri: &str, field_name: &str) -> Result<()> {
    validate_non_empty(uri, field_name)?;
    validate_length(uri, MAX_URI_LENGTH, field_name)?;

    if !(uri.starts_with("http://") || uri.starts_with("https://")) {
        return Err(anyhow!("{} must use http or https", field_name));
    }

    let dangerous_chars = ['`', '$', ';', '|', '\n', '\r', ' '];
    if uri.chars().any(|c| dangerous_chars.contains(&c)) {
        return Err(anyhow!("{} contains invalid characters", field_name));
    }

    Ok(())
}

/// Inclusive range check used for tunables read from the environment
pub fn validate_range<T: PartialOrd + std::fmt::Display>(
    value: T,
    min: T,
    max: T,
    field_name: &str,
) -> Result<()> {
    if value < min || value > max {
        return Err(anyhow!(
            "{} must be between {} and {}, got {}",
            field_name,
            min,
            max,
            value
        ));
    }
    Ok(())
}
