//! # configuration
//!
//! why: track which peers form the cluster at every point of the log
//! relations: rebuilt by log stores during init, recorded in snapshot metadata
//! what: PeerId, Configuration, LogId, ConfigurationEntry, ConfigurationManager

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

/// Address of a replica, e.g. `10.0.0.1:8100:0`
///
/// An empty id means "nobody", which is what a fresh stable store reports
/// as its vote.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(addr: &str) -> Self {
        Self::new(addr)
    }
}

impl From<String> for PeerId {
    fn from(addr: String) -> Self {
        Self(addr)
    }
}

/// An ordered set of peers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    peers: BTreeSet<PeerId>,
}

impl Configuration {
    pub fn new<I, P>(peers: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PeerId>,
    {
        Self {
            peers: peers.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns false if the peer was already present
    pub fn add_peer(&mut self, peer: impl Into<PeerId>) -> bool {
        self.peers.insert(peer.into())
    }

    pub fn remove_peer(&mut self, peer: &PeerId) -> bool {
        self.peers.remove(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.iter()
    }
}

/// Position of an entry in the log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogId {
    pub index: u64,
    pub term: u64,
}

impl LogId {
    pub fn new(index: u64, term: u64) -> Self {
        Self { index, term }
    }
}

/// A configuration together with the log position that introduced it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationEntry {
    pub id: LogId,
    pub conf: Configuration,
    /// Non-empty while a joint configuration is in effect
    pub old_conf: Configuration,
}

impl ConfigurationEntry {
    pub fn new(id: LogId, conf: Configuration, old_conf: Configuration) -> Self {
        Self { id, conf, old_conf }
    }

    pub fn is_stable(&self) -> bool {
        self.old_conf.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.conf.is_empty()
    }
}

/// History of membership changes still covered by the log
///
/// Entries are kept in increasing index order. The configuration recorded
/// in the latest snapshot is the fallback once the log no longer holds an
/// older change.
#[derive(Debug, Default)]
pub struct ConfigurationManager {
    configurations: VecDeque<ConfigurationEntry>,
    snapshot: ConfigurationEntry,
}

impl ConfigurationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a configuration change; returns false if `entry` does not come
    /// after the newest one already tracked.
    pub fn add(&mut self, entry: ConfigurationEntry) -> bool {
        if let Some(last) = self.configurations.back() {
            if last.id.index >= entry.id.index {
                return false;
            }
        }
        self.configurations.push_back(entry);
        true
    }

    /// Forget changes at indices below `first_index_kept`
    pub fn truncate_prefix(&mut self, first_index_kept: u64) {
        while self
            .configurations
            .front()
            .is_some_and(|e| e.id.index < first_index_kept)
        {
            self.configurations.pop_front();
        }
    }

    /// Forget changes at indices above `last_index_kept`
    pub fn truncate_suffix(&mut self, last_index_kept: u64) {
        while self
            .configurations
            .back()
            .is_some_and(|e| e.id.index > last_index_kept)
        {
            self.configurations.pop_back();
        }
    }

    pub fn set_snapshot(&mut self, entry: ConfigurationEntry) {
        self.snapshot = entry;
    }

    /// Newest configuration in effect at `last_included_index`
    pub fn get(&self, last_included_index: u64) -> &ConfigurationEntry {
        self.configurations
            .iter()
            .rev()
            .find(|e| e.id.index <= last_included_index)
            .unwrap_or(&self.snapshot)
    }

    pub fn last_configuration(&self) -> &ConfigurationEntry {
        self.configurations.back().unwrap_or(&self.snapshot)
    }

    pub fn len(&self) -> usize {
        self.configurations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configurations.is_empty()
    }
}
