//! # snapshot
//!
//! why: manage compacted state images and their transfer between replicas
//! relations: driven by the compaction and catch-up paths of the engine
//! what: Snapshot/SnapshotWriter/SnapshotReader/SnapshotCopier/SnapshotStore
//! traits, FileMeta, Capability, CopyStatus, the local store and its copier

mod copier;
mod local;

pub use copier::LocalSnapshotCopier;
pub use local::{LocalSnapshotReader, LocalSnapshotStore, LocalSnapshotWriter, META_FILE};

use raft_core::SnapshotMeta;
use serde::{Deserialize, Serialize};
use std::any::{type_name, Any};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::error;

use crate::error::{Result, StorageError};
use crate::fs::FileSystemAdaptor;
use crate::throttle::SnapshotThrottle;

/// implementation-defined metadata attached to a snapshot file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileMeta {
    /// opaque bytes supplied by the application
    pub user_meta: Vec<u8>,
    /// crc32c of the file contents, when known
    pub checksum: Option<u32>,
}

/// optional snapshot store features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// skip fetching remote files already present in the local snapshot
    FilterBeforeCopyRemote,
    FileSystemAdaptor,
    SnapshotThrottle,
}

impl Capability {
    pub fn name(self) -> &'static str {
        match self {
            Capability::FilterBeforeCopyRemote => "filter before copy remote",
            Capability::FileSystemAdaptor => "file system adaptor",
            Capability::SnapshotThrottle => "snapshot throttle",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// progress of a snapshot copy job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyStatus {
    Running,
    Succeeded,
    Failed(String),
    Cancelled,
}

impl CopyStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CopyStatus::Running)
    }
}

/// state shared by snapshot writers and readers
pub trait Snapshot: Send {
    /// storage-defined location of this snapshot
    fn path(&self) -> &Path;

    /// files currently part of the snapshot
    fn list_files(&self) -> Vec<String>;

    /// metadata of one file; backends without per-file metadata report
    /// an empty record
    fn get_file_meta(&self, filename: &str) -> Result<FileMeta> {
        let _ = filename;
        Ok(FileMeta::default())
    }
}

/// builds a new snapshot; nothing is visible until the store commits it
pub trait SnapshotWriter: Snapshot {
    /// record the metadata; required before the writer can be committed
    fn save_meta(&mut self, meta: &SnapshotMeta) -> Result<()>;

    fn add_file(&mut self, filename: &str) -> Result<()> {
        self.add_file_with_meta(filename, None)
    }

    /// register `filename` as part of the snapshot with optional metadata
    fn add_file_with_meta(&mut self, filename: &str, file_meta: Option<&FileMeta>) -> Result<()>;

    /// retract a registered file; only meaningful before commit
    fn remove_file(&mut self, filename: &str) -> Result<()>;

    /// hand the concrete writer back to the store that created it
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// read access to a committed snapshot
pub trait SnapshotReader: Snapshot {
    fn load_meta(&self) -> Result<SnapshotMeta>;

    /// address a remote copier can fetch this snapshot from, or an empty
    /// string when the snapshot cannot be offered for copy
    fn generate_uri_for_copy(&mut self) -> String;

    /// hand the concrete reader back to the store that opened it
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// an asynchronous, cancellable copy of a remote snapshot
pub trait SnapshotCopier: Send {
    /// ask the job to stop; it may still finish successfully
    fn cancel(&self);

    /// block until the job reaches a terminal status
    fn join(&self);

    fn status(&self) -> CopyStatus;

    /// the copied snapshot, once `join` returned with `Succeeded`; taken
    /// at most once
    fn get_reader(&mut self) -> Option<Box<dyn SnapshotReader>>;
}

/// factory and lifecycle manager for snapshots
pub trait SnapshotStore: Send + Sync {
    /// prepare backing storage and settle any half-committed writer
    fn init(&mut self) -> Result<()>;

    /// open the single writer; a second one before the first is closed fails
    fn create(&self) -> Result<Box<dyn SnapshotWriter>>;

    /// commit a writer: the whole snapshot becomes visible to `open` or none
    /// of it does
    fn close_writer(&self, writer: Box<dyn SnapshotWriter>) -> Result<()>;

    /// drop a writer without committing it
    fn discard_writer(&self, writer: Box<dyn SnapshotWriter>) -> Result<()>;

    /// newest committed snapshot, `None` if there is none yet
    fn open(&self) -> Result<Option<Box<dyn SnapshotReader>>>;

    /// release a reader obtained from `open` or a copier
    fn close_reader(&self, reader: Box<dyn SnapshotReader>) -> Result<()>;

    /// copy a remote snapshot to completion and open it
    fn copy_from(&self, uri: &str) -> Result<Box<dyn SnapshotReader>>;

    fn start_to_copy_from(&self, uri: &str) -> Result<Box<dyn SnapshotCopier>>;

    /// release a copier, cancelling it if still running
    fn close_copier(&self, copier: Box<dyn SnapshotCopier>) -> Result<()>;

    fn supports(&self, capability: Capability) -> bool {
        let _ = capability;
        false
    }

    fn set_filter_before_copy_remote(&mut self) -> Result<()> {
        Err(unsupported::<Self>(Capability::FilterBeforeCopyRemote))
    }

    fn set_file_system_adaptor(&mut self, fs: Arc<dyn FileSystemAdaptor>) -> Result<()> {
        let _ = fs;
        Err(unsupported::<Self>(Capability::FileSystemAdaptor))
    }

    fn set_snapshot_throttle(&mut self, throttle: Arc<dyn SnapshotThrottle>) -> Result<()> {
        let _ = throttle;
        Err(unsupported::<Self>(Capability::SnapshotThrottle))
    }

    /// fresh, uninitialized store of the same kind configured from `uri`
    fn new_instance(&self, uri: &str) -> Result<Box<dyn SnapshotStore>>;
}

fn unsupported<S: ?Sized>(capability: Capability) -> StorageError {
    let backend = type_name::<S>();
    error!(backend, %capability, "snapshot store capability not supported");
    StorageError::Unsupported {
        backend,
        capability: capability.name(),
    }
}
