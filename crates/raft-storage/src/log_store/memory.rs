//! # memory log store
//!
//! why: keep the log in process memory for tests and volatile groups
//! relations: registered under the `memory` scheme
//! what: MemoryLogStore, per-path shared state

use parking_lot::{Mutex, RwLock};
use raft_core::{ConfigurationManager, LogEntry};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::{configuration_of, LogStore};
use crate::error::{Result, StorageError};
use crate::uri::parse_uri;

#[derive(Debug)]
struct MemoryLog {
    first_log_index: u64,
    entries: VecDeque<LogEntry>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self {
            first_log_index: 1,
            entries: VecDeque::new(),
        }
    }
}

impl MemoryLog {
    fn last_log_index(&self) -> u64 {
        self.first_log_index + self.entries.len() as u64 - 1
    }

    fn get(&self, index: u64) -> Option<&LogEntry> {
        if index < self.first_log_index {
            return None;
        }
        self.entries.get((index - self.first_log_index) as usize)
    }
}

type SharedLogs = Arc<Mutex<HashMap<String, Arc<RwLock<MemoryLog>>>>>;

/// in-memory log store
///
/// instances created from the same prototype for the same `memory://path`
/// share one log, so dropping a store and creating it again behaves like a
/// restart that lost nothing.
pub struct MemoryLogStore {
    path: String,
    logs: SharedLogs,
    log: Arc<RwLock<MemoryLog>>,
}

impl MemoryLogStore {
    /// create a prototype with its own namespace of paths
    pub fn prototype() -> Self {
        Self::with_namespace(String::new(), SharedLogs::default())
    }

    fn with_namespace(path: String, logs: SharedLogs) -> Self {
        let log = logs.lock().entry(path.clone()).or_default().clone();
        Self { path, logs, log }
    }
}

impl LogStore for MemoryLogStore {
    fn init(&mut self, configuration_manager: &mut ConfigurationManager) -> Result<()> {
        let log = self.log.read();
        for entry in &log.entries {
            if let Some(conf) = configuration_of(entry) {
                configuration_manager.add(conf);
            }
        }
        info!(
            path = %self.path,
            first_log_index = log.first_log_index,
            last_log_index = log.last_log_index(),
            "memory log store initialized"
        );
        Ok(())
    }

    fn first_log_index(&self) -> u64 {
        self.log.read().first_log_index
    }

    fn last_log_index(&self) -> u64 {
        self.log.read().last_log_index()
    }

    fn get_entry(&self, index: u64) -> Result<Option<LogEntry>> {
        Ok(self.log.read().get(index).cloned())
    }

    fn get_term(&self, index: u64) -> Option<u64> {
        self.log.read().get(index).map(|e| e.term)
    }

    fn append_entry(&mut self, entry: &LogEntry) -> Result<()> {
        let mut log = self.log.write();
        let expected = log.last_log_index() + 1;
        if entry.index != expected {
            error!(path = %self.path, index = entry.index, expected, "non-contiguous append");
            return Err(StorageError::invalid_argument(format!(
                "append at index {} but next index is {}",
                entry.index, expected
            )));
        }
        log.entries.push_back(entry.clone());
        Ok(())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<usize> {
        for (appended, entry) in entries.iter().enumerate() {
            if let Err(e) = self.append_entry(entry) {
                if appended == 0 {
                    return Err(e);
                }
                return Ok(appended);
            }
        }
        Ok(entries.len())
    }

    fn truncate_prefix(&mut self, first_index_kept: u64) -> Result<()> {
        let mut log = self.log.write();
        if first_index_kept <= log.first_log_index {
            return Ok(());
        }
        let last = log.last_log_index();
        let drop = (first_index_kept.min(last + 1) - log.first_log_index) as usize;
        log.entries.drain(..drop);
        log.first_log_index = first_index_kept;
        debug!(path = %self.path, first_index_kept, "truncated log prefix");
        Ok(())
    }

    fn truncate_suffix(&mut self, last_index_kept: u64) -> Result<()> {
        let mut log = self.log.write();
        if last_index_kept + 1 < log.first_log_index {
            error!(path = %self.path, last_index_kept, first_log_index = log.first_log_index, "truncate_suffix below first index");
            return Err(StorageError::invalid_argument(format!(
                "cannot keep up to {} when the log starts at {}",
                last_index_kept, log.first_log_index
            )));
        }
        let keep = (last_index_kept + 1 - log.first_log_index) as usize;
        log.entries.truncate(keep);
        debug!(path = %self.path, last_index_kept, "truncated log suffix");
        Ok(())
    }

    fn reset(&mut self, next_log_index: u64) -> Result<()> {
        if next_log_index == 0 {
            return Err(StorageError::invalid_argument("next log index must be positive"));
        }
        let mut log = self.log.write();
        log.entries.clear();
        log.first_log_index = next_log_index;
        info!(path = %self.path, next_log_index, "memory log store reset");
        Ok(())
    }

    fn new_instance(&self, uri: &str) -> Result<Box<dyn LogStore>> {
        let (_, path) = parse_uri(uri)?;
        Ok(Box::new(Self::with_namespace(path.to_string(), self.logs.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(path: &str) -> Box<dyn LogStore> {
        MemoryLogStore::prototype()
            .new_instance(&format!("memory://{path}"))
            .unwrap()
    }

    #[test]
    fn new_store_is_empty() {
        let store = store("empty");
        assert_eq!(store.first_log_index(), 1);
        assert_eq!(store.last_log_index(), 0);
        assert!(store.get_entry(1).unwrap().is_none());
    }

    #[test]
    fn rejects_gap_in_append() {
        let mut store = store("gap");
        store.append_entry(&LogEntry::new(1, 1, vec![])).unwrap();
        assert!(store.append_entry(&LogEntry::new(1, 3, vec![])).is_err());
        assert_eq!(store.last_log_index(), 1);
    }

    #[test]
    fn short_batch_reports_count() {
        let mut store = store("short");
        let entries = vec![
            LogEntry::new(1, 1, vec![]),
            LogEntry::new(1, 2, vec![]),
            LogEntry::new(1, 4, vec![]),
        ];
        assert_eq!(store.append_entries(&entries).unwrap(), 2);
        assert_eq!(store.last_log_index(), 2);
    }

    #[test]
    fn truncate_prefix_past_end_leaves_empty_store() {
        let mut store = store("past-end");
        store.append_entries(&[LogEntry::new(1, 1, vec![]), LogEntry::new(1, 2, vec![])]).unwrap();

        store.truncate_prefix(10).unwrap();

        assert_eq!(store.first_log_index(), 10);
        assert_eq!(store.last_log_index(), 9);
        store.append_entry(&LogEntry::new(2, 10, vec![])).unwrap();
    }

    #[test]
    fn instances_for_same_path_share_entries() {
        let prototype = MemoryLogStore::prototype();
        let mut first = prototype.new_instance("memory://shared").unwrap();
        first.append_entry(&LogEntry::new(1, 1, b"x".to_vec())).unwrap();
        drop(first);

        let second = prototype.new_instance("memory://shared").unwrap();
        assert_eq!(second.last_log_index(), 1);

        let other = prototype.new_instance("memory://other").unwrap();
        assert_eq!(other.last_log_index(), 0);
    }
}
