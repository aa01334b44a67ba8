//! # raft-storage
//!
//! why: give a raft engine durable log, vote and snapshot storage behind traits
//! relations: persists raft-core types, backends chosen through a uri registry
//! what: LogStore, StableStore, SnapshotStore and their memory/local backends
//!
//! a store is created from a uri such as `local:///var/raft/group-1/log`;
//! the scheme picks the registered backend and the rest is its path.

pub mod error;
pub mod file_service;
pub mod fs;
pub mod log_store;
pub mod options;
pub mod registry;
pub mod snapshot;
pub mod stable_store;
pub mod throttle;
pub mod uri;

pub use error::{Result, StorageError};
pub use file_service::{ExportedSnapshot, FileService, REMOTE_SCHEME};
pub use fs::{FileSystemAdaptor, MemoryFileSystemAdaptor, PosixFileSystemAdaptor};
pub use log_store::{LocalLogStore, LogStore, MemoryLogStore};
pub use options::StorageOptions;
pub use registry::{StorageRegistry, LOCAL_SCHEME, MEMORY_SCHEME};
pub use snapshot::{
    Capability, CopyStatus, FileMeta, LocalSnapshotCopier, LocalSnapshotReader,
    LocalSnapshotStore, LocalSnapshotWriter, Snapshot, SnapshotCopier, SnapshotReader,
    SnapshotStore, SnapshotWriter, META_FILE,
};
pub use stable_store::{HardState, LocalStableStore, MemoryStableStore, StableStore};
pub use throttle::{SnapshotThrottle, ThroughputSnapshotThrottle};
pub use uri::parse_uri;
