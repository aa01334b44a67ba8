//! # snapshot
//!
//! why: describe the log position and membership a snapshot supersedes
//! relations: saved by snapshot writers, loaded by snapshot readers
//! what: SnapshotMeta struct

use serde::{Deserialize, Serialize};

use crate::configuration::{Configuration, ConfigurationEntry, LogId};

/// Metadata recorded alongside every snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Index of the last log entry folded into the snapshot
    pub last_included_index: u64,
    /// Term of that entry
    pub last_included_term: u64,
    /// Configuration in effect at `last_included_index`
    pub peers: Configuration,
    #[serde(default)]
    pub old_peers: Configuration,
}

impl SnapshotMeta {
    pub fn new(last_included_index: u64, last_included_term: u64, peers: Configuration) -> Self {
        Self {
            last_included_index,
            last_included_term,
            peers,
            old_peers: Configuration::default(),
        }
    }

    /// The configuration entry a configuration manager should fall back to
    /// after installing this snapshot.
    pub fn configuration_entry(&self) -> ConfigurationEntry {
        ConfigurationEntry::new(
            LogId::new(self.last_included_index, self.last_included_term),
            self.peers.clone(),
            self.old_peers.clone(),
        )
    }
}
