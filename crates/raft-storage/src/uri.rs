//! # uri
//!
//! why: turn a storage uri into the scheme that picks a backend and its path
//! relations: used by the registry and by every backend's new_instance
//! what: parse_uri

use crate::error::{Result, StorageError};

const SEPARATOR: &str = "://";

/// Split `scheme://path` into its two parts.
///
/// Surrounding whitespace is ignored; both parts must be non-empty.
pub fn parse_uri(uri: &str) -> Result<(&str, &str)> {
    let invalid = |reason: &str| StorageError::InvalidUri {
        uri: uri.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = uri.trim();
    let (scheme, path) = trimmed
        .split_once(SEPARATOR)
        .ok_or_else(|| invalid("missing `://`"))?;
    let scheme = scheme.trim();
    let path = path.trim();
    if scheme.is_empty() {
        return Err(invalid("empty scheme"));
    }
    if path.is_empty() {
        return Err(invalid("empty path"));
    }
    Ok((scheme, path))
}
