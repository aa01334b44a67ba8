//! # log
//!
//! why: describe a single record of the replicated operation log
//! relations: appended and read back by every raft-storage log store
//! what: LogEntry struct, EntryType tag, EntryPayload variants

use serde::{Deserialize, Serialize};

use crate::configuration::{Configuration, LogId};

/// Kind of a log entry, without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// Written by a new leader to commit entries from earlier terms
    NoOp,
    /// Carries an opaque application command
    Data,
    /// Changes the cluster membership
    Configuration,
}

/// Payload carried by a log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryPayload {
    NoOp,
    Data {
        command: Vec<u8>,
    },
    Configuration {
        peers: Configuration,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_peers: Option<Configuration>,
    },
}

/// A single entry in the replicated log
///
/// Entries are immutable once appended; they only disappear through
/// prefix/suffix truncation or a reset of the owning store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    pub payload: EntryPayload,
}

impl LogEntry {
    /// Create a new data entry
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self {
            term,
            index,
            payload: EntryPayload::Data { command },
        }
    }

    pub fn no_op(term: u64, index: u64) -> Self {
        Self {
            term,
            index,
            payload: EntryPayload::NoOp,
        }
    }

    /// Create a membership change entry; `old_peers` is set while a joint
    /// configuration is in effect.
    pub fn configuration(
        term: u64,
        index: u64,
        peers: Configuration,
        old_peers: Option<Configuration>,
    ) -> Self {
        Self {
            term,
            index,
            payload: EntryPayload::Configuration { peers, old_peers },
        }
    }

    pub fn entry_type(&self) -> EntryType {
        match self.payload {
            EntryPayload::NoOp => EntryType::NoOp,
            EntryPayload::Data { .. } => EntryType::Data,
            EntryPayload::Configuration { .. } => EntryType::Configuration,
        }
    }

    pub fn id(&self) -> LogId {
        LogId::new(self.index, self.term)
    }

    /// The command bytes of a data entry
    pub fn command(&self) -> Option<&[u8]> {
        match &self.payload {
            EntryPayload::Data { command } => Some(command),
            _ => None,
        }
    }
}
