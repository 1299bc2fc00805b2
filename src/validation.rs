//! Registration-time validation of hook definitions.
//!
//! Everything rejected here is a synchronous error to the caller of the
//! registry; nothing that passes can make the delivery path panic.

use crate::delivery::is_reserved_header;
use crate::error::{HookError, Result};
use crate::events;
use reqwest::header::{HeaderName, HeaderValue};
use std::collections::BTreeMap;

pub const MIN_RETRIES: u32 = 1;
pub const MAX_RETRIES: u32 = 10;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

const MAX_NAME_LEN: usize = 100;

pub fn validate_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(HookError::Validation("name must not be empty".to_string()));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(HookError::Validation(format!(
            "name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

/// The target must be an absolute http(s) URL with a host.
pub fn validate_url(url: &str) -> Result<()> {
    let parsed = url::Url::parse(url)
        .map_err(|e| HookError::Validation(format!("invalid url {url:?}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(HookError::Validation(format!(
                "unsupported url scheme: {scheme}"
            )))
        }
    }

    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(HookError::Validation("url must have a host".to_string()));
    }
    Ok(())
}

pub fn validate_events(tags: &[String]) -> Result<()> {
    if tags.is_empty() {
        return Err(HookError::Validation(
            "at least one event must be subscribed".to_string(),
        ));
    }
    if let Some(unknown) = tags.iter().find(|t| !events::is_supported(t)) {
        return Err(HookError::Validation(format!("unsupported event: {unknown}")));
    }
    Ok(())
}

pub fn validate_max_retries(max_retries: u32) -> Result<()> {
    if !(MIN_RETRIES..=MAX_RETRIES).contains(&max_retries) {
        return Err(HookError::Validation(format!(
            "max_retries must be between {MIN_RETRIES} and {MAX_RETRIES}, got {max_retries}"
        )));
    }
    Ok(())
}

pub fn validate_timeout(timeout_secs: u64) -> Result<()> {
    if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&timeout_secs) {
        return Err(HookError::Validation(format!(
            "timeout_secs must be between {MIN_TIMEOUT_SECS} and {MAX_TIMEOUT_SECS}, got {timeout_secs}"
        )));
    }
    Ok(())
}

/// Custom headers must be valid HTTP and may not shadow headers the
/// delivery path sets itself.
pub fn validate_headers(headers: &BTreeMap<String, String>) -> Result<()> {
    for (name, value) in headers {
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| HookError::Validation(format!("invalid header name: {name}")))?;
        HeaderValue::from_str(value)
            .map_err(|_| HookError::Validation(format!("invalid value for header {name}")))?;
        if is_reserved_header(name) {
            return Err(HookError::Validation(format!(
                "header {name} is set by the dispatcher and cannot be overridden"
            )));
        }
    }
    Ok(())
}
