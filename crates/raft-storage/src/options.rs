//! # options
//!
//! why: collect the toggles storage backends read once at startup
//! relations: handed to registry prototypes, copied into every new instance
//! what: StorageOptions with defaults, environment and json loaders

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use tracing::warn;

use crate::error::Result;

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Flush log appends to durable media before returning
    pub sync: bool,
    /// Flush log meta and snapshot meta; stable state is always flushed
    pub sync_meta: bool,
    /// Create missing parent directories for file-backed stores
    pub create_parent_directories: bool,
    /// Size at which the local log store starts a new segment
    pub max_segment_size: u64,
    /// Bytes requested per read while copying a remote snapshot
    pub copy_chunk_size: u64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            sync: true,
            sync_meta: false,
            create_parent_directories: true,
            max_segment_size: 8 * 1024 * 1024,
            copy_chunk_size: 128 * 1024,
        }
    }
}

impl StorageOptions {
    /// Defaults overridden by `RAFT_SYNC`, `RAFT_SYNC_META`,
    /// `RAFT_CREATE_PARENT_DIRECTORIES`, `RAFT_MAX_SEGMENT_SIZE` and
    /// `RAFT_COPY_CHUNK_SIZE`.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        override_from_env("RAFT_SYNC", &mut options.sync, parse_bool);
        override_from_env("RAFT_SYNC_META", &mut options.sync_meta, parse_bool);
        override_from_env(
            "RAFT_CREATE_PARENT_DIRECTORIES",
            &mut options.create_parent_directories,
            parse_bool,
        );
        override_from_env("RAFT_MAX_SEGMENT_SIZE", &mut options.max_segment_size, parse_number);
        override_from_env("RAFT_COPY_CHUNK_SIZE", &mut options.copy_chunk_size, parse_number);
        options
    }

    /// Parse options from a json document; missing keys keep their default
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

fn override_from_env<T>(name: &str, slot: &mut T, parse: fn(&str) -> Option<T>) {
    let Ok(raw) = env::var(name) else {
        return;
    };
    match parse(raw.trim()) {
        Some(value) => *slot = value,
        None => warn!(variable = name, value = %raw, "ignoring unparsable storage option"),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_number<T: FromStr>(raw: &str) -> Option<T> {
    raw.parse().ok()
}
