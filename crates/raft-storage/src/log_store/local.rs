//! # local log store
//!
//! why: keep the replicated log durable on the local file system
//! relations: registered under the `local` scheme, built on segment.rs
//! what: LocalLogStore over a directory of segments plus `log_meta.json`

use raft_core::{ConfigurationManager, LogEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use super::segment::Segment;
use super::{configuration_of, LogStore};
use crate::error::{Result, StorageError};
use crate::fs::sync_dir;
use crate::options::StorageOptions;
use crate::uri::parse_uri;

const META_FILE: &str = "log_meta.json";
const META_TEMP_FILE: &str = "log_meta.tmp";

/// persisted log position that survives truncation and reset
#[derive(Serialize, Deserialize)]
struct LogMeta {
    first_log_index: u64,
}

/// file-based log store
///
/// stores the log in a directory with:
/// - `segment_<first index>.log`: framed entries, rolled at `max_segment_size`
/// - `log_meta.json`: the first retained index
///
/// every segment is non-empty and its last index is at least
/// `first_log_index`; only the newest segment takes appends.
pub struct LocalLogStore {
    dir: PathBuf,
    options: StorageOptions,
    first_log_index: u64,
    segments: BTreeMap<u64, Segment>,
    #[cfg(test)]
    fail_sync: bool,
}

impl LocalLogStore {
    /// create a prototype; configure instances through `new_instance`
    pub fn prototype(options: StorageOptions) -> Self {
        Self::new(PathBuf::new(), options)
    }

    pub fn new(dir: impl Into<PathBuf>, options: StorageOptions) -> Self {
        Self {
            dir: dir.into(),
            options,
            first_log_index: 1,
            segments: BTreeMap::new(),
            #[cfg(test)]
            fail_sync: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    fn load_meta(&self) -> Result<Option<LogMeta>> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        let meta = serde_json::from_str(&contents).map_err(|e| {
            StorageError::corruption(format!("unreadable {}: {}", path.display(), e))
        })?;
        Ok(Some(meta))
    }

    // atomic write: write to temp file then rename
    fn save_meta(&self) -> Result<()> {
        let meta = LogMeta {
            first_log_index: self.first_log_index,
        };
        let json = serde_json::to_string_pretty(&meta)?;

        let temp_path = self.dir.join(META_TEMP_FILE);
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        if self.options.sync_meta {
            file.sync_all()?;
        }
        fs::rename(&temp_path, self.meta_path())?;
        if self.options.sync_meta {
            sync_dir(&self.dir)?;
        }
        Ok(())
    }

    fn create_dir(&self) -> io::Result<()> {
        let created = if self.options.create_parent_directories {
            fs::create_dir_all(&self.dir)
        } else {
            fs::create_dir(&self.dir)
        };
        match created {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            other => other,
        }
    }

    fn list_segment_files(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut files = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            let first_index = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(Segment::parse_file_name);
            if let Some(first_index) = first_index {
                files.push((first_index, path));
            }
        }
        files.sort_by_key(|(first_index, _)| *first_index);
        Ok(files)
    }

    fn load_segments(&mut self, configuration_manager: &mut ConfigurationManager) -> Result<()> {
        let files = self.list_segment_files()?;
        let newest = files.last().map(|(first_index, _)| *first_index);
        let first_log_index = self.first_log_index;

        for (first_index, path) in files {
            let mut visit = |entry: &LogEntry| {
                if entry.index >= first_log_index {
                    if let Some(conf) = configuration_of(entry) {
                        configuration_manager.add(conf);
                    }
                }
            };
            let (mut segment, report) = Segment::open(path, first_index, &mut visit)?;

            if let Some(valid_len) = report.torn_at {
                if Some(first_index) != newest {
                    return Err(StorageError::corruption(format!(
                        "corrupt record at offset {} of {}",
                        valid_len,
                        segment.path().display()
                    )));
                }
                warn!(
                    segment = %segment.path().display(),
                    valid_len,
                    "cutting torn tail off newest log segment"
                );
                segment.repair(valid_len)?;
            }

            if segment.is_empty() || segment.last_index() < first_log_index {
                debug!(segment = %segment.path().display(), "removing segment outside the retained log");
                segment.remove()?;
                continue;
            }

            if let Some(prev) = self.segments.values().next_back() {
                if prev.last_index() + 1 != segment.first_index() {
                    return Err(StorageError::corruption(format!(
                        "gap between index {} and segment {}",
                        prev.last_index(),
                        segment.path().display()
                    )));
                }
            }
            self.segments.insert(first_index, segment);
        }

        if let Some(first) = self.segments.values().next() {
            if first.first_index() > self.first_log_index {
                warn!(
                    recorded = self.first_log_index,
                    found = first.first_index(),
                    "log starts after the recorded first index"
                );
                self.first_log_index = first.first_index();
            }
        }
        Ok(())
    }

    fn segment_for(&self, index: u64) -> Option<&Segment> {
        if index < self.first_log_index || index > self.last_log_index() {
            return None;
        }
        self.segments.range(..=index).next_back().map(|(_, s)| s)
    }

    /// segment that takes the next append, rolling over when the newest is full
    fn writable_segment(&mut self, next_index: u64) -> Result<&mut Segment> {
        let roll = self
            .segments
            .values()
            .next_back()
            .map_or(true, |s| s.size() >= self.options.max_segment_size);
        if roll {
            if let Some(full) = self.segments.values().next_back() {
                full.sync()?;
                debug!(segment = %full.path().display(), "closed log segment");
            }
            let segment = Segment::create(&self.dir, next_index)?;
            self.segments.insert(next_index, segment);
        }
        self.segments
            .values_mut()
            .next_back()
            .ok_or_else(|| StorageError::not_found("writable log segment"))
    }

    fn append_unsynced(&mut self, entry: &LogEntry) -> Result<()> {
        let expected = self.last_log_index() + 1;
        if entry.index != expected {
            error!(dir = %self.dir.display(), index = entry.index, expected, "non-contiguous append");
            return Err(StorageError::invalid_argument(format!(
                "append at index {} but next index is {}",
                entry.index, expected
            )));
        }
        let segment = self.writable_segment(entry.index)?;
        segment.append(entry)?;
        Ok(())
    }

    fn sync_newest(&self) -> Result<()> {
        #[cfg(test)]
        if self.fail_sync {
            return Err(io::Error::new(io::ErrorKind::Other, "injected sync failure").into());
        }
        if self.options.sync {
            if let Some(segment) = self.segments.values().next_back() {
                segment.sync()?;
            }
        }
        Ok(())
    }

    /// drop everything after `last_index_kept` following a failed append,
    /// including a segment opened for it that never took an entry
    fn roll_back(&mut self, last_index_kept: u64) {
        if let Err(e) = self.truncate_suffix(last_index_kept) {
            error!(
                dir = %self.dir.display(),
                last_index_kept,
                error = %e,
                "failed to roll back unacknowledged log entries"
            );
        }
    }

    fn remove_all_segments(&mut self) -> Result<()> {
        while let Some((_, segment)) = self.segments.pop_last() {
            segment.remove()?;
        }
        Ok(())
    }
}

impl LogStore for LocalLogStore {
    fn init(&mut self, configuration_manager: &mut ConfigurationManager) -> Result<()> {
        self.create_dir()?;
        self.segments.clear();
        match self.load_meta()? {
            Some(meta) if meta.first_log_index == 0 => {
                return Err(StorageError::corruption(format!(
                    "{} records first log index 0",
                    self.meta_path().display()
                )));
            }
            Some(meta) => self.first_log_index = meta.first_log_index,
            None => {
                self.first_log_index = 1;
                self.save_meta()?;
            }
        }
        self.load_segments(configuration_manager)?;

        info!(
            dir = %self.dir.display(),
            first_log_index = self.first_log_index,
            last_log_index = self.last_log_index(),
            segments = self.segments.len(),
            "local log store initialized"
        );
        Ok(())
    }

    fn first_log_index(&self) -> u64 {
        self.first_log_index
    }

    fn last_log_index(&self) -> u64 {
        self.segments
            .values()
            .next_back()
            .map_or(self.first_log_index - 1, Segment::last_index)
    }

    fn get_entry(&self, index: u64) -> Result<Option<LogEntry>> {
        match self.segment_for(index) {
            Some(segment) => segment.read(index),
            None => Ok(None),
        }
    }

    fn get_term(&self, index: u64) -> Option<u64> {
        self.segment_for(index)?.term(index)
    }

    fn append_entry(&mut self, entry: &LogEntry) -> Result<()> {
        self.append_entries(std::slice::from_ref(entry)).map(|_| ())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<usize> {
        let prev_last = self.last_log_index();
        let mut appended = 0;
        let mut failure = None;
        for entry in entries {
            if let Err(e) = self.append_unsynced(entry) {
                failure = Some(e);
                break;
            }
            appended += 1;
        }
        if failure.is_some() {
            self.roll_back(prev_last + appended as u64);
        }

        // nothing counts as written until it is durable
        if appended > 0 {
            if let Err(e) = self.sync_newest() {
                error!(dir = %self.dir.display(), appended, error = %e, "log sync failed");
                self.roll_back(prev_last);
                return Err(e);
            }
        }

        match failure {
            Some(e) if appended == 0 => Err(e),
            Some(e) => {
                warn!(appended, total = entries.len(), error = %e, "short log append");
                Ok(appended)
            }
            None => Ok(appended),
        }
    }

    fn truncate_prefix(&mut self, first_index_kept: u64) -> Result<()> {
        if first_index_kept <= self.first_log_index {
            return Ok(());
        }
        // persist the new start first so a crash never resurrects dropped entries
        self.first_log_index = first_index_kept;
        self.save_meta()?;

        while let Some(entry) = self.segments.first_entry() {
            if entry.get().last_index() >= first_index_kept {
                break;
            }
            let segment = entry.remove();
            debug!(segment = %segment.path().display(), "removing compacted log segment");
            segment.remove()?;
        }
        debug!(dir = %self.dir.display(), first_index_kept, "truncated log prefix");
        Ok(())
    }

    fn truncate_suffix(&mut self, last_index_kept: u64) -> Result<()> {
        if last_index_kept + 1 < self.first_log_index {
            error!(
                dir = %self.dir.display(),
                last_index_kept,
                first_log_index = self.first_log_index,
                "truncate_suffix below first index"
            );
            return Err(StorageError::invalid_argument(format!(
                "cannot keep up to {} when the log starts at {}",
                last_index_kept, self.first_log_index
            )));
        }

        // newest first, so a crash part way leaves a contiguous log
        while let Some(mut entry) = self.segments.last_entry() {
            let segment = entry.get_mut();
            if segment.first_index() > last_index_kept || last_index_kept < self.first_log_index {
                entry.remove().remove()?;
                continue;
            }
            if segment.last_index() > last_index_kept {
                segment.truncate_after(last_index_kept)?;
                segment.sync()?;
            }
            break;
        }
        debug!(dir = %self.dir.display(), last_index_kept, "truncated log suffix");
        Ok(())
    }

    fn reset(&mut self, next_log_index: u64) -> Result<()> {
        if next_log_index == 0 {
            return Err(StorageError::invalid_argument("next log index must be positive"));
        }
        self.remove_all_segments()?;
        self.first_log_index = next_log_index;
        self.save_meta()?;
        info!(dir = %self.dir.display(), next_log_index, "local log store reset");
        Ok(())
    }

    fn new_instance(&self, uri: &str) -> Result<Box<dyn LogStore>> {
        let (_, path) = parse_uri(uri)?;
        Ok(Box::new(Self::new(path, self.options.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &Path, options: StorageOptions) -> LocalLogStore {
        let mut store = LocalLogStore::new(dir, options);
        store.init(&mut ConfigurationManager::new()).unwrap();
        store
    }

    fn small_segments() -> StorageOptions {
        StorageOptions {
            max_segment_size: 64,
            ..StorageOptions::default()
        }
    }

    #[test]
    fn init_creates_directory_and_meta() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("log");

        open(&path, StorageOptions::default());

        assert!(path.join(META_FILE).exists());
    }

    #[test]
    fn init_without_parent_creation_fails_on_missing_parent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("log");
        let options = StorageOptions {
            create_parent_directories: false,
            ..StorageOptions::default()
        };

        let mut store = LocalLogStore::new(&path, options);
        assert!(store.init(&mut ConfigurationManager::new()).is_err());
    }

    #[test]
    fn appends_roll_into_new_segments() {
        let dir = tempdir().unwrap();
        let mut store = open(dir.path(), small_segments());
        for index in 1..=10 {
            store.append_entry(&LogEntry::new(1, index, vec![0; 32])).unwrap();
        }

        assert!(store.segments.len() > 1);
        for index in 1..=10 {
            assert_eq!(store.get_entry(index).unwrap().unwrap().index, index);
        }
    }

    #[test]
    fn prefix_truncation_deletes_covered_segments() {
        let dir = tempdir().unwrap();
        let mut store = open(dir.path(), small_segments());
        for index in 1..=10 {
            store.append_entry(&LogEntry::new(1, index, vec![0; 32])).unwrap();
        }
        let before = store.segments.len();

        store.truncate_prefix(8).unwrap();

        assert!(store.segments.len() < before);
        assert_eq!(store.first_log_index(), 8);
        assert!(store.get_entry(7).unwrap().is_none());
        assert_eq!(store.get_term(8), Some(1));
    }

    #[test]
    fn prefix_truncation_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let mut store = open(dir.path(), StorageOptions::default());
            for index in 1..=5 {
                store.append_entry(&LogEntry::new(1, index, vec![])).unwrap();
            }
            store.truncate_prefix(3).unwrap();
        }

        let store = open(dir.path(), StorageOptions::default());
        assert_eq!(store.first_log_index(), 3);
        assert_eq!(store.last_log_index(), 5);
        assert!(store.get_entry(2).unwrap().is_none());
    }

    #[test]
    fn torn_tail_is_repaired_on_init() {
        let dir = tempdir().unwrap();
        {
            let mut store = open(dir.path(), StorageOptions::default());
            for index in 1..=3 {
                store.append_entry(&LogEntry::new(1, index, b"payload".to_vec())).unwrap();
            }
        }
        let segment = dir.path().join(Segment::file_name(1));
        let len = fs::metadata(&segment).unwrap().len();
        fs::OpenOptions::new().write(true).open(&segment).unwrap().set_len(len - 3).unwrap();

        let mut store = open(dir.path(), StorageOptions::default());

        assert_eq!(store.last_log_index(), 2);
        store.append_entry(&LogEntry::new(2, 3, vec![])).unwrap();
        assert_eq!(store.get_term(3), Some(2));
    }

    #[test]
    fn missing_middle_segment_is_corruption() {
        let dir = tempdir().unwrap();
        {
            let mut store = open(dir.path(), small_segments());
            for index in 1..=10 {
                store.append_entry(&LogEntry::new(1, index, vec![0; 32])).unwrap();
            }
            assert!(store.segments.len() >= 3);
            let middle = store.segments.keys().nth(1).copied().unwrap();
            fs::remove_file(dir.path().join(Segment::file_name(middle))).unwrap();
        }

        let mut store = LocalLogStore::new(dir.path(), small_segments());
        let err = store.init(&mut ConfigurationManager::new()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn reset_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let mut store = open(dir.path(), StorageOptions::default());
            for index in 1..=4 {
                store.append_entry(&LogEntry::new(1, index, vec![])).unwrap();
            }
            store.reset(100).unwrap();
        }

        let mut store = open(dir.path(), StorageOptions::default());
        assert_eq!(store.first_log_index(), 100);
        assert_eq!(store.last_log_index(), 99);
        store.append_entry(&LogEntry::new(3, 100, vec![])).unwrap();
    }

    #[test]
    fn corrupt_record_before_valid_records_fails_init() {
        let dir = tempdir().unwrap();
        {
            let mut store = open(dir.path(), StorageOptions::default());
            for index in 1..=3 {
                store.append_entry(&LogEntry::new(1, index, b"payload".to_vec())).unwrap();
            }
        }
        let segment = dir.path().join(Segment::file_name(1));
        let mut bytes = fs::read(&segment).unwrap();
        let len = bytes.len() as u64;
        bytes[10] ^= 0xff;
        fs::write(&segment, bytes).unwrap();

        let mut store = LocalLogStore::new(dir.path(), StorageOptions::default());
        let err = store.init(&mut ConfigurationManager::new()).unwrap_err();
        assert!(err.is_fatal());
        // the acknowledged records after the damage are not cut away
        assert_eq!(fs::metadata(&segment).unwrap().len(), len);
    }

    #[test]
    fn zero_first_index_in_meta_is_corruption() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(META_FILE), r#"{"first_log_index":0}"#).unwrap();

        let mut store = LocalLogStore::new(dir.path(), StorageOptions::default());
        let err = store.init(&mut ConfigurationManager::new()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn failed_sync_rolls_back_the_append() {
        let dir = tempdir().unwrap();
        let mut store = open(dir.path(), small_segments());
        for index in 1..=2 {
            store.append_entry(&LogEntry::new(1, index, vec![0; 32])).unwrap();
        }

        store.fail_sync = true;
        assert!(store.append_entry(&LogEntry::new(1, 3, vec![0; 32])).is_err());
        let batch: Vec<_> = (3..=5).map(|i| LogEntry::new(1, i, vec![0; 32])).collect();
        assert!(store.append_entries(&batch).is_err());

        assert_eq!(store.last_log_index(), 2);
        assert!(store.get_entry(3).unwrap().is_none());
        assert_eq!(store.get_term(3), None);

        store.fail_sync = false;
        assert_eq!(store.append_entries(&batch).unwrap(), 3);
        assert_eq!(store.last_log_index(), 5);

        let reopened = open(dir.path(), small_segments());
        assert_eq!(reopened.last_log_index(), 5);
        assert_eq!(reopened.get_entry(3).unwrap().unwrap().index, 3);
    }
}
