//! # log_store
//!
//! why: durable, append-only, truncatable storage for the replicated log
//! relations: driven by the replication engine, produced by the registry
//! what: LogStore trait, memory and local (segment file) backends

mod local;
mod memory;
mod segment;

pub use local::LocalLogStore;
pub use memory::MemoryLogStore;

use raft_core::{ConfigurationEntry, ConfigurationManager, EntryPayload, LogEntry};

use crate::error::Result;

/// trait for durable storage of the replicated log
///
/// the store holds entries `[first_log_index, last_log_index]`; it is empty
/// when `first_log_index() == last_log_index() + 1`.
///
/// mutations take `&mut self`: the owning engine is the single writer, and
/// truncation can never race an append. reads take `&self` and may run
/// from several threads at once.
pub trait LogStore: Send + Sync {
    /// load persisted entries, check them for gaps and corruption and feed
    /// every retained configuration entry into `configuration_manager`.
    /// an error here is fatal for the owning engine.
    fn init(&mut self, configuration_manager: &mut ConfigurationManager) -> Result<()>;

    /// first retained index
    fn first_log_index(&self) -> u64;

    /// last retained index, `first_log_index() - 1` when empty
    fn last_log_index(&self) -> u64;

    /// entry at `index`, `None` outside `[first, last]`
    fn get_entry(&self, index: u64) -> Result<Option<LogEntry>>;

    /// term of the entry at `index`, `None` outside `[first, last]`
    fn get_term(&self, index: u64) -> Option<u64>;

    /// append one entry; its index must be `last_log_index() + 1`
    fn append_entry(&mut self, entry: &LogEntry) -> Result<()>;

    /// append a contiguous batch and return how many were durably written.
    ///
    /// on a failure part way through, `Ok(n)` reports the entries before it;
    /// those `n` are stored without gaps and the rest are not stored at all.
    /// `Err` means not a single entry was written.
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<usize>;

    /// discard `[first_log_index, first_index_kept)`; no-op when
    /// `first_index_kept <= first_log_index()`
    fn truncate_prefix(&mut self, first_index_kept: u64) -> Result<()>;

    /// discard `(last_index_kept, last_log_index]`
    fn truncate_suffix(&mut self, last_index_kept: u64) -> Result<()>;

    /// drop every entry and make `next_log_index` the next index to append
    fn reset(&mut self, next_log_index: u64) -> Result<()>;

    /// fresh, uninitialized store of the same kind configured from `uri`
    fn new_instance(&self, uri: &str) -> Result<Box<dyn LogStore>>;
}

/// configuration entry described by a membership change log entry
pub(crate) fn configuration_of(entry: &LogEntry) -> Option<ConfigurationEntry> {
    match &entry.payload {
        EntryPayload::Configuration { peers, old_peers } => Some(ConfigurationEntry::new(
            entry.id(),
            peers.clone(),
            old_peers.clone().unwrap_or_default(),
        )),
        _ => None,
    }
}
