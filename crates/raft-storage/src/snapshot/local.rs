//! # local snapshot store
//!
//! why: keep snapshots as directories reachable through a file system adaptor
//! relations: registered under `local` (posix) and `memory` (in-memory tree)
//! what: LocalSnapshotStore, LocalSnapshotWriter, LocalSnapshotReader
//!
//! layout under the store path:
//! - `temp/`: the open writer
//! - `snapshot_<index>/`: committed snapshots, each with `__raft_snapshot_meta`

use parking_lot::Mutex;
use raft_core::SnapshotMeta;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::copier::LocalSnapshotCopier;
use super::{
    Capability, CopyStatus, FileMeta, Snapshot, SnapshotCopier, SnapshotReader, SnapshotStore,
    SnapshotWriter,
};
use crate::error::{Result, StorageError};
use crate::file_service::FileService;
use crate::fs::FileSystemAdaptor;
use crate::options::StorageOptions;
use crate::throttle::SnapshotThrottle;
use crate::uri::parse_uri;

/// name of the metadata file inside every snapshot directory
pub const META_FILE: &str = "__raft_snapshot_meta";
const META_TEMP_FILE: &str = "__raft_snapshot_meta.tmp";
const TEMP_DIR: &str = "temp";
const SNAPSHOT_PREFIX: &str = "snapshot_";

/// contents of the metadata file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(super) struct SnapshotTable {
    pub meta: Option<SnapshotMeta>,
    pub files: BTreeMap<String, FileMeta>,
}

impl SnapshotTable {
    pub fn load(fs: &dyn FileSystemAdaptor, dir: &Path) -> Result<Self> {
        let path = dir.join(META_FILE);
        let size = fs.file_size(&path)?;
        let bytes = fs.read_at(&path, 0, size)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            StorageError::corruption(format!("unreadable {}: {}", path.display(), e))
        })
    }

    // atomic write: write to temp file then rename
    fn save(&self, fs: &dyn FileSystemAdaptor, dir: &Path, sync: bool) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let temp_path = dir.join(META_TEMP_FILE);
        fs.write(&temp_path, &json)?;
        if sync {
            fs.sync(&temp_path)?;
        }
        fs.rename(&temp_path, &dir.join(META_FILE))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StoreState {
    last_snapshot_index: u64,
    /// references per snapshot: one held for the latest, one per open reader
    ref_counts: HashMap<u64, usize>,
    writer_open: bool,
}

/// everything a store operation needs, cloneable into copier threads
#[derive(Clone)]
pub(super) struct StoreContext {
    pub path: PathBuf,
    pub fs: Arc<dyn FileSystemAdaptor>,
    pub options: StorageOptions,
    pub file_service: Arc<FileService>,
    pub throttle: Option<Arc<dyn SnapshotThrottle>>,
    pub filter_before_copy_remote: bool,
    state: Arc<Mutex<StoreState>>,
}

impl StoreContext {
    fn temp_path(&self) -> PathBuf {
        self.path.join(TEMP_DIR)
    }

    fn snapshot_path(&self, index: u64) -> PathBuf {
        self.path.join(format!("{SNAPSHOT_PREFIX}{index:020}"))
    }

    fn init(&self) -> Result<()> {
        self.fs
            .create_dir(&self.path, self.options.create_parent_directories)?;

        let temp = self.temp_path();
        if self.fs.exists(&temp) {
            warn!(path = %temp.display(), "discarding half-written snapshot");
            self.fs.delete(&temp, true)?;
        }

        let mut indexes: Vec<u64> = self
            .fs
            .list_dir(&self.path)?
            .iter()
            .filter_map(|name| name.strip_prefix(SNAPSHOT_PREFIX)?.parse().ok())
            .collect();
        indexes.sort_unstable_by(|a, b| b.cmp(a));

        let mut last_snapshot_index = 0;
        for index in indexes {
            let dir = self.snapshot_path(index);
            if last_snapshot_index == 0 {
                match SnapshotTable::load(&*self.fs, &dir) {
                    Ok(table) if table.meta.is_some() => {
                        last_snapshot_index = index;
                        continue;
                    }
                    Ok(_) => warn!(path = %dir.display(), "snapshot without meta"),
                    Err(e) => warn!(path = %dir.display(), error = %e, "unreadable snapshot"),
                }
            }
            debug!(path = %dir.display(), "removing stale snapshot");
            self.fs.delete(&dir, true)?;
        }

        let mut state = self.state.lock();
        state.last_snapshot_index = last_snapshot_index;
        state.ref_counts.clear();
        if last_snapshot_index > 0 {
            state.ref_counts.insert(last_snapshot_index, 1);
        }
        info!(path = %self.path.display(), last_snapshot_index, "snapshot store initialized");
        Ok(())
    }

    pub fn create_writer(&self) -> Result<LocalSnapshotWriter> {
        let temp = self.temp_path();
        let mut state = self.state.lock();
        if state.writer_open {
            error!(path = %temp.display(), "snapshot writer already open");
            return Err(StorageError::WriterBusy {
                path: temp.display().to_string(),
            });
        }
        self.fs.delete(&temp, true)?;
        self.fs.create_dir(&temp, false)?;
        state.writer_open = true;
        drop(state);

        Ok(LocalSnapshotWriter {
            path: temp,
            table: SnapshotTable::default(),
            ctx: self.clone(),
            finished: false,
        })
    }

    pub fn commit(&self, mut writer: LocalSnapshotWriter) -> Result<()> {
        let result = self.publish(&writer);
        writer.finish();
        result
    }

    fn publish(&self, writer: &LocalSnapshotWriter) -> Result<()> {
        let meta = writer
            .table
            .meta
            .as_ref()
            .ok_or_else(|| StorageError::invalid_argument("snapshot meta was never saved"))?;
        let index = meta.last_included_index;

        {
            let last = self.state.lock().last_snapshot_index;
            if index == last {
                return Err(StorageError::AlreadyExists {
                    what: format!("snapshot {index}"),
                });
            }
            if index < last {
                return Err(StorageError::invalid_argument(format!(
                    "snapshot {index} is older than the current snapshot {last}"
                )));
            }
        }

        // file i/o runs unlocked; only the open writer publishes
        writer
            .table
            .save(&*self.fs, &writer.path, self.options.sync_meta)?;
        if self.options.sync_meta {
            self.fs.sync(&writer.path)?;
        }

        let target = self.snapshot_path(index);
        if self.fs.exists(&target) {
            warn!(path = %target.display(), "replacing leftover snapshot directory");
            self.fs.delete(&target, true)?;
        }
        self.fs.rename(&writer.path, &target)?;

        let last = {
            let mut state = self.state.lock();
            state.ref_counts.insert(index, 1);
            std::mem::replace(&mut state.last_snapshot_index, index)
        };
        if last > 0 {
            self.unref(last);
        }
        info!(path = %target.display(), index, files = writer.table.files.len(), "snapshot committed");
        Ok(())
    }

    /// the latest snapshot, referenced until passed to `release_reader`
    pub fn open_reader(&self) -> Result<Option<LocalSnapshotReader>> {
        let index = {
            let mut state = self.state.lock();
            let index = state.last_snapshot_index;
            if index == 0 {
                return Ok(None);
            }
            *state.ref_counts.entry(index).or_insert(0) += 1;
            index
        };

        let path = self.snapshot_path(index);
        match SnapshotTable::load(&*self.fs, &path) {
            Ok(table) => Ok(Some(LocalSnapshotReader {
                index,
                path,
                table,
                fs: self.fs.clone(),
                file_service: self.file_service.clone(),
                export_id: None,
            })),
            Err(e) => {
                self.unref(index);
                Err(e)
            }
        }
    }

    pub fn release_reader(&self, reader: LocalSnapshotReader) {
        if let Some(id) = reader.export_id {
            self.file_service.remove_reader(id);
        }
        self.unref(reader.index);
    }

    /// drop one reference; the directory goes once nothing refers to it.
    /// only superseded snapshots reach zero, so nobody can re-reference one
    /// between the count dropping and the delete.
    fn unref(&self, index: u64) {
        {
            let mut state = self.state.lock();
            let Some(count) = state.ref_counts.get_mut(&index) else {
                return;
            };
            *count -= 1;
            if *count > 0 {
                return;
            }
            state.ref_counts.remove(&index);
        }
        let path = self.snapshot_path(index);
        match self.fs.delete(&path, true) {
            Ok(()) => debug!(path = %path.display(), "removed unreferenced snapshot"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove snapshot"),
        }
    }

    fn discard(&self, writer_path: &Path) {
        if let Err(e) = self.fs.delete(writer_path, true) {
            warn!(path = %writer_path.display(), error = %e, "failed to remove snapshot writer");
        }
        self.state.lock().writer_open = false;
    }
}

// -- writer --

/// writer over the store's `temp/` directory
///
/// callers put file contents under `path()` and register them with
/// `add_file`. a writer dropped without being closed is discarded.
pub struct LocalSnapshotWriter {
    path: PathBuf,
    table: SnapshotTable,
    ctx: StoreContext,
    finished: bool,
}

impl LocalSnapshotWriter {
    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            // a committed writer has been renamed away, this only clears leftovers
            self.ctx.discard(&self.path);
        }
    }

    fn checksum(&self, filename: &str) -> Result<Option<u32>> {
        let path = self.path.join(filename);
        if !self.ctx.fs.exists(&path) {
            return Ok(None);
        }
        let size = self.ctx.fs.file_size(&path)?;
        let chunk = self.ctx.options.copy_chunk_size.max(1);
        let mut crc = 0;
        let mut offset = 0;
        while offset < size {
            let data = self.ctx.fs.read_at(&path, offset, chunk)?;
            if data.is_empty() {
                break;
            }
            crc = crc32c::crc32c_append(crc, &data);
            offset += data.len() as u64;
        }
        Ok(Some(crc))
    }
}

fn check_filename(filename: &str) -> Result<()> {
    let reserved = filename == META_FILE || filename == META_TEMP_FILE;
    if filename.is_empty() || filename.contains(['/', '\\']) || filename == ".." || reserved {
        return Err(StorageError::invalid_argument(format!(
            "`{filename}` is not a valid snapshot file name"
        )));
    }
    Ok(())
}

impl Drop for LocalSnapshotWriter {
    fn drop(&mut self) {
        self.finish();
    }
}

impl Snapshot for LocalSnapshotWriter {
    fn path(&self) -> &Path {
        &self.path
    }

    fn list_files(&self) -> Vec<String> {
        self.table.files.keys().cloned().collect()
    }

    fn get_file_meta(&self, filename: &str) -> Result<FileMeta> {
        self.table
            .files
            .get(filename)
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("snapshot file {filename}")))
    }
}

impl SnapshotWriter for LocalSnapshotWriter {
    fn save_meta(&mut self, meta: &SnapshotMeta) -> Result<()> {
        self.table.meta = Some(meta.clone());
        Ok(())
    }

    fn add_file_with_meta(&mut self, filename: &str, file_meta: Option<&FileMeta>) -> Result<()> {
        check_filename(filename)?;
        let file_meta = match file_meta {
            Some(meta) => meta.clone(),
            None => FileMeta {
                user_meta: Vec::new(),
                checksum: self.checksum(filename)?,
            },
        };
        self.table.files.insert(filename.to_string(), file_meta);
        Ok(())
    }

    fn remove_file(&mut self, filename: &str) -> Result<()> {
        check_filename(filename)?;
        if self.table.files.remove(filename).is_some() {
            self.ctx.fs.delete(&self.path.join(filename), false)?;
        }
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

// -- reader --

/// reader over one committed `snapshot_<index>/` directory
pub struct LocalSnapshotReader {
    index: u64,
    path: PathBuf,
    table: SnapshotTable,
    fs: Arc<dyn FileSystemAdaptor>,
    file_service: Arc<FileService>,
    export_id: Option<u64>,
}

impl LocalSnapshotReader {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub(super) fn fs(&self) -> &Arc<dyn FileSystemAdaptor> {
        &self.fs
    }
}

impl Snapshot for LocalSnapshotReader {
    fn path(&self) -> &Path {
        &self.path
    }

    fn list_files(&self) -> Vec<String> {
        self.table.files.keys().cloned().collect()
    }

    fn get_file_meta(&self, filename: &str) -> Result<FileMeta> {
        self.table
            .files
            .get(filename)
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("snapshot file {filename}")))
    }
}

impl SnapshotReader for LocalSnapshotReader {
    fn load_meta(&self) -> Result<SnapshotMeta> {
        self.table.meta.clone().ok_or_else(|| {
            StorageError::corruption(format!("{} has no snapshot meta", self.path.display()))
        })
    }

    fn generate_uri_for_copy(&mut self) -> String {
        if let Some(id) = self.export_id {
            return FileService::uri_for(id);
        }
        if !self.fs.exists(&self.path.join(META_FILE)) {
            warn!(path = %self.path.display(), "snapshot vanished, cannot offer it for copy");
            return String::new();
        }
        let id = self.file_service.add_reader(self.fs.clone(), &self.path);
        self.export_id = Some(id);
        FileService::uri_for(id)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

// -- store --

/// snapshot store over a directory of a file system adaptor
pub struct LocalSnapshotStore {
    ctx: StoreContext,
}

impl LocalSnapshotStore {
    /// create a prototype; configure instances through `new_instance`
    pub fn prototype(
        options: StorageOptions,
        fs: Arc<dyn FileSystemAdaptor>,
        file_service: Arc<FileService>,
    ) -> Self {
        Self::new(PathBuf::new(), options, fs, file_service)
    }

    pub fn new(
        path: impl Into<PathBuf>,
        options: StorageOptions,
        fs: Arc<dyn FileSystemAdaptor>,
        file_service: Arc<FileService>,
    ) -> Self {
        Self {
            ctx: StoreContext {
                path: path.into(),
                fs,
                options,
                file_service,
                throttle: None,
                filter_before_copy_remote: false,
                state: Arc::default(),
            },
        }
    }

    pub fn path(&self) -> &Path {
        &self.ctx.path
    }

    pub fn last_snapshot_index(&self) -> u64 {
        self.ctx.state.lock().last_snapshot_index
    }
}

fn downcast<T: Any>(any: Box<dyn Any + Send>, what: &str) -> Result<Box<T>> {
    any.downcast::<T>().map_err(|_| {
        error!(what, "handle was not created by a local snapshot store");
        StorageError::invalid_argument(format!("{what} does not belong to a local snapshot store"))
    })
}

impl SnapshotStore for LocalSnapshotStore {
    fn init(&mut self) -> Result<()> {
        self.ctx.init()
    }

    fn create(&self) -> Result<Box<dyn SnapshotWriter>> {
        Ok(Box::new(self.ctx.create_writer()?))
    }

    fn close_writer(&self, writer: Box<dyn SnapshotWriter>) -> Result<()> {
        let writer = downcast::<LocalSnapshotWriter>(writer.into_any(), "snapshot writer")?;
        self.ctx.commit(*writer)
    }

    fn discard_writer(&self, writer: Box<dyn SnapshotWriter>) -> Result<()> {
        let mut writer = downcast::<LocalSnapshotWriter>(writer.into_any(), "snapshot writer")?;
        writer.finish();
        debug!(path = %self.ctx.temp_path().display(), "snapshot writer discarded");
        Ok(())
    }

    fn open(&self) -> Result<Option<Box<dyn SnapshotReader>>> {
        Ok(self
            .ctx
            .open_reader()?
            .map(|reader| Box::new(reader) as Box<dyn SnapshotReader>))
    }

    fn close_reader(&self, reader: Box<dyn SnapshotReader>) -> Result<()> {
        let reader = downcast::<LocalSnapshotReader>(reader.into_any(), "snapshot reader")?;
        self.ctx.release_reader(*reader);
        Ok(())
    }

    fn copy_from(&self, uri: &str) -> Result<Box<dyn SnapshotReader>> {
        let mut copier = LocalSnapshotCopier::start(self.ctx.clone(), uri)?;
        copier.join();
        match copier.status() {
            CopyStatus::Succeeded => copier
                .get_reader()
                .ok_or_else(|| StorageError::not_found("copied snapshot reader")),
            CopyStatus::Cancelled => Err(StorageError::Cancelled),
            CopyStatus::Failed(reason) => Err(StorageError::CopyFailed { reason }),
            CopyStatus::Running => Err(StorageError::CopyFailed {
                reason: "copy job still running after join".to_string(),
            }),
        }
    }

    fn start_to_copy_from(&self, uri: &str) -> Result<Box<dyn SnapshotCopier>> {
        Ok(Box::new(LocalSnapshotCopier::start(self.ctx.clone(), uri)?))
    }

    fn close_copier(&self, mut copier: Box<dyn SnapshotCopier>) -> Result<()> {
        if !copier.status().is_terminal() {
            copier.cancel();
        }
        copier.join();
        if let Some(reader) = copier.get_reader() {
            self.close_reader(reader)?;
        }
        Ok(())
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(
            capability,
            Capability::FilterBeforeCopyRemote
                | Capability::FileSystemAdaptor
                | Capability::SnapshotThrottle
        )
    }

    fn set_filter_before_copy_remote(&mut self) -> Result<()> {
        self.ctx.filter_before_copy_remote = true;
        Ok(())
    }

    fn set_file_system_adaptor(&mut self, fs: Arc<dyn FileSystemAdaptor>) -> Result<()> {
        self.ctx.fs = fs;
        Ok(())
    }

    fn set_snapshot_throttle(&mut self, throttle: Arc<dyn SnapshotThrottle>) -> Result<()> {
        self.ctx.throttle = Some(throttle);
        Ok(())
    }

    fn new_instance(&self, uri: &str) -> Result<Box<dyn SnapshotStore>> {
        let (_, path) = parse_uri(uri)?;
        Ok(Box::new(Self::new(
            path,
            self.ctx.options.clone(),
            self.ctx.fs.clone(),
            self.ctx.file_service.clone(),
        )))
    }
}
