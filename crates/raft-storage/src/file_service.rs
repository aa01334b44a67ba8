//! # file_service
//!
//! why: give snapshot readers an address remote copiers can fetch from
//! relations: readers register on generate_uri_for_copy, copiers resolve uris
//! what: FileService export table, `remote://<id>` uris

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::fs::FileSystemAdaptor;
use crate::uri::parse_uri;

/// scheme of uris produced by `FileService::uri_for`
pub const REMOTE_SCHEME: &str = "remote";

/// a snapshot directory exported for copying
#[derive(Clone)]
pub struct ExportedSnapshot {
    pub fs: Arc<dyn FileSystemAdaptor>,
    pub path: PathBuf,
}

#[derive(Default)]
struct Exports {
    next_id: u64,
    readers: HashMap<u64, ExportedSnapshot>,
}

/// table of snapshot directories other replicas may copy from
///
/// the service stands in for the transport: a copier resolves
/// `remote://<id>` against it and reads files through the exported adaptor.
#[derive(Default)]
pub struct FileService {
    exports: Mutex<Exports>,
}

impl FileService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_reader(&self, fs: Arc<dyn FileSystemAdaptor>, path: &Path) -> u64 {
        let mut exports = self.exports.lock();
        exports.next_id += 1;
        let id = exports.next_id;
        exports.readers.insert(
            id,
            ExportedSnapshot {
                fs,
                path: path.to_path_buf(),
            },
        );
        debug!(id, path = %path.display(), "exported snapshot reader");
        id
    }

    pub fn remove_reader(&self, id: u64) -> bool {
        self.exports.lock().readers.remove(&id).is_some()
    }

    pub fn get(&self, id: u64) -> Option<ExportedSnapshot> {
        self.exports.lock().readers.get(&id).cloned()
    }

    pub fn uri_for(id: u64) -> String {
        format!("{REMOTE_SCHEME}://{id}")
    }

    /// look up the export a `remote://<id>` uri points at
    pub fn resolve(&self, uri: &str) -> Result<ExportedSnapshot> {
        let (scheme, rest) = parse_uri(uri)?;
        let invalid = |reason: &str| StorageError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };
        if scheme != REMOTE_SCHEME {
            return Err(invalid("not a remote snapshot uri"));
        }
        let id: u64 = rest.parse().map_err(|_| invalid("reader id is not a number"))?;
        self.get(id)
            .ok_or_else(|| StorageError::not_found(format!("exported snapshot reader {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFileSystemAdaptor;

    #[test]
    fn resolves_registered_readers_only() {
        let service = FileService::new();
        let fs: Arc<dyn FileSystemAdaptor> = Arc::new(MemoryFileSystemAdaptor::new());
        let id = service.add_reader(fs, Path::new("/snap/snapshot_1"));
        let uri = FileService::uri_for(id);

        assert_eq!(service.resolve(&uri).unwrap().path, PathBuf::from("/snap/snapshot_1"));

        assert!(service.remove_reader(id));
        assert!(service.resolve(&uri).is_err());
        assert!(service.resolve("local://1").is_err());
        assert!(service.resolve("remote://abc").is_err());
    }
}
