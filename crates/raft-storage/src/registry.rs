//! # registry
//!
//! why: keep the engine agnostic of which backend persists a group
//! relations: holds log, stable and snapshot store prototypes; uses uri
//! what: StorageRegistry, scheme -> prototype maps with create_* factories
//!
//! a registry is built once at startup and only read afterwards. it is passed
//! around explicitly; there is no process-wide instance.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::{Result, StorageError};
use crate::file_service::FileService;
use crate::fs::{MemoryFileSystemAdaptor, PosixFileSystemAdaptor};
use crate::log_store::{LocalLogStore, LogStore, MemoryLogStore};
use crate::options::StorageOptions;
use crate::snapshot::{LocalSnapshotStore, SnapshotStore};
use crate::stable_store::{LocalStableStore, MemoryStableStore, StableStore};
use crate::uri::parse_uri;

pub const MEMORY_SCHEME: &str = "memory";
pub const LOCAL_SCHEME: &str = "local";

// -- prototype table --

struct Prototypes<T: ?Sized> {
    role: &'static str,
    by_scheme: HashMap<String, Box<T>>,
}

impl<T: ?Sized> Prototypes<T> {
    fn new(role: &'static str) -> Self {
        Self {
            role,
            by_scheme: HashMap::new(),
        }
    }

    fn register(&mut self, scheme: &str, prototype: Box<T>) -> Result<()> {
        if self.by_scheme.contains_key(scheme) {
            error!(role = self.role, scheme, "scheme registered twice");
            return Err(StorageError::AlreadyExists {
                what: format!("{} scheme `{scheme}`", self.role),
            });
        }
        debug!(role = self.role, scheme, "registered storage prototype");
        self.by_scheme.insert(scheme.to_string(), prototype);
        Ok(())
    }

    fn lookup(&self, uri: &str) -> Result<&T> {
        let (scheme, _) = parse_uri(uri)?;
        self.by_scheme.get(scheme).map(|p| &**p).ok_or_else(|| {
            error!(role = self.role, uri, "no storage registered for scheme");
            StorageError::UnknownScheme {
                scheme: scheme.to_string(),
            }
        })
    }
}

// -- registry --

/// scheme-keyed factory for the three storage roles
pub struct StorageRegistry {
    log_stores: Prototypes<dyn LogStore>,
    stable_stores: Prototypes<dyn StableStore>,
    snapshot_stores: Prototypes<dyn SnapshotStore>,
    file_service: Arc<FileService>,
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageRegistry {
    /// an empty registry
    pub fn new() -> Self {
        Self {
            log_stores: Prototypes::new("log store"),
            stable_stores: Prototypes::new("stable store"),
            snapshot_stores: Prototypes::new("snapshot store"),
            file_service: Arc::new(FileService::new()),
        }
    }

    /// a registry with the `memory` and `local` backends for every role
    pub fn with_defaults(options: StorageOptions) -> Self {
        let mut registry = Self::new();
        let file_service = registry.file_service.clone();
        let memory_fs = Arc::new(MemoryFileSystemAdaptor::new());

        registry.log_stores.by_scheme.insert(
            MEMORY_SCHEME.to_string(),
            Box::new(MemoryLogStore::prototype()),
        );
        registry.log_stores.by_scheme.insert(
            LOCAL_SCHEME.to_string(),
            Box::new(LocalLogStore::prototype(options.clone())),
        );
        registry.stable_stores.by_scheme.insert(
            MEMORY_SCHEME.to_string(),
            Box::new(MemoryStableStore::prototype()),
        );
        registry.stable_stores.by_scheme.insert(
            LOCAL_SCHEME.to_string(),
            Box::new(LocalStableStore::prototype(options.clone())),
        );
        registry.snapshot_stores.by_scheme.insert(
            MEMORY_SCHEME.to_string(),
            Box::new(LocalSnapshotStore::prototype(
                options.clone(),
                memory_fs,
                file_service.clone(),
            )),
        );
        registry.snapshot_stores.by_scheme.insert(
            LOCAL_SCHEME.to_string(),
            Box::new(LocalSnapshotStore::prototype(
                options,
                Arc::new(PosixFileSystemAdaptor),
                file_service,
            )),
        );
        registry
    }

    /// exports readers so copiers created by this registry's stores can
    /// resolve their `remote://` uris
    pub fn file_service(&self) -> &Arc<FileService> {
        &self.file_service
    }

    pub fn register_log_store(&mut self, scheme: &str, prototype: Box<dyn LogStore>) -> Result<()> {
        self.log_stores.register(scheme, prototype)
    }

    pub fn register_stable_store(
        &mut self,
        scheme: &str,
        prototype: Box<dyn StableStore>,
    ) -> Result<()> {
        self.stable_stores.register(scheme, prototype)
    }

    pub fn register_snapshot_store(
        &mut self,
        scheme: &str,
        prototype: Box<dyn SnapshotStore>,
    ) -> Result<()> {
        self.snapshot_stores.register(scheme, prototype)
    }

    /// a fresh, uninitialized log store for `uri`
    pub fn create_log_store(&self, uri: &str) -> Result<Box<dyn LogStore>> {
        self.log_stores.lookup(uri)?.new_instance(uri)
    }

    pub fn create_stable_store(&self, uri: &str) -> Result<Box<dyn StableStore>> {
        self.stable_stores.lookup(uri)?.new_instance(uri)
    }

    pub fn create_snapshot_store(&self, uri: &str) -> Result<Box<dyn SnapshotStore>> {
        self.snapshot_stores.lookup(uri)?.new_instance(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft_core::ConfigurationManager;

    #[test]
    fn defaults_cover_every_role() {
        let registry = StorageRegistry::with_defaults(StorageOptions::default());
        for scheme in [MEMORY_SCHEME, LOCAL_SCHEME] {
            let uri = format!("{scheme}://group-1");
            assert!(registry.log_stores.lookup(&uri).is_ok());
            assert!(registry.stable_stores.lookup(&uri).is_ok());
            assert!(registry.snapshot_stores.lookup(&uri).is_ok());
        }
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let registry = StorageRegistry::with_defaults(StorageOptions::default());
        let err = registry.create_log_store("rocksdb://g1").err().unwrap();
        assert!(matches!(err, StorageError::UnknownScheme { scheme } if scheme == "rocksdb"));
    }

    #[test]
    fn malformed_uri_is_rejected() {
        let registry = StorageRegistry::with_defaults(StorageOptions::default());
        let err = registry.create_stable_store("no-scheme").err().unwrap();
        assert!(matches!(err, StorageError::InvalidUri { .. }));
    }

    #[test]
    fn duplicate_scheme_is_rejected() {
        let mut registry = StorageRegistry::with_defaults(StorageOptions::default());
        let err = registry
            .register_log_store(MEMORY_SCHEME, Box::new(MemoryLogStore::prototype()))
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
    }

    #[test]
    fn custom_scheme_produces_instances() {
        let mut registry = StorageRegistry::new();
        registry
            .register_log_store("scratch", Box::new(MemoryLogStore::prototype()))
            .unwrap();

        let mut store = registry.create_log_store("scratch://g1").unwrap();
        store.init(&mut ConfigurationManager::new()).unwrap();
        assert_eq!(store.first_log_index(), 1);
        assert_eq!(store.last_log_index(), 0);
    }
}
