//! # raft-core
//!
//! why: share the plain data types every raft storage backend persists
//! relations: used by raft-storage for log, stable and snapshot stores
//! what: log entries, peer sets, configuration history, snapshot metadata

pub mod configuration;
pub mod log;
pub mod snapshot;

pub use configuration::{
    Configuration, ConfigurationEntry, ConfigurationManager, LogId, PeerId,
};
pub use log::{EntryPayload, EntryType, LogEntry};
pub use snapshot::SnapshotMeta;
