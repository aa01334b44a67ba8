//! # local stable store
//!
//! why: keep term and vote durable on the local file system
//! relations: registered under the `local` scheme
//! what: LocalStableStore writing `stable_meta.json` atomically

use raft_core::PeerId;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::{error, info};

use super::{HardState, StableStore};
use crate::error::{Result, StorageError};
use crate::fs::sync_dir;
use crate::options::StorageOptions;
use crate::uri::parse_uri;

const META_FILE: &str = "stable_meta.json";
const META_TEMP_FILE: &str = "stable_meta.tmp";

/// file-based stable store
///
/// stores `{term, voted_for}` in `stable_meta.json` inside its directory.
/// the cached copy only changes after the file has been replaced and
/// both the file and its directory are on durable media.
pub struct LocalStableStore {
    dir: PathBuf,
    options: StorageOptions,
    state: HardState,
    #[cfg(test)]
    synced: Vec<PathBuf>,
}

impl LocalStableStore {
    pub fn prototype(options: StorageOptions) -> Self {
        Self::new(PathBuf::new(), options)
    }

    pub fn new(dir: impl Into<PathBuf>, options: StorageOptions) -> Self {
        Self {
            dir: dir.into(),
            options,
            state: HardState::default(),
            #[cfg(test)]
            synced: Vec::new(),
        }
    }

    /// get the path to the metadata file
    fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    fn save(&mut self, state: HardState) -> Result<()> {
        let json = serde_json::to_string_pretty(&state)?;

        // atomic write: write to temp file then rename
        let temp_path = self.dir.join(META_TEMP_FILE);
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, self.meta_path())?;
        // a vote is not cast until the rename itself is durable
        sync_dir(&self.dir).map_err(|e| {
            error!(dir = %self.dir.display(), error = %e, "failed to sync stable store directory");
            e
        })?;
        #[cfg(test)]
        self.synced.extend([temp_path, self.dir.clone()]);

        self.state = state;
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
}

impl StableStore for LocalStableStore {
    fn init(&mut self) -> Result<()> {
        self.create_dir()?;
        let path = self.meta_path();
        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            self.state = serde_json::from_str(&contents).map_err(|e| {
                StorageError::corruption(format!("unreadable {}: {}", path.display(), e))
            })?;
        } else {
            // default for new nodes
            self.save(HardState::default())?;
        }
        info!(
            dir = %self.dir.display(),
            term = self.state.term,
            voted_for = %self.state.voted_for,
            "local stable store initialized"
        );
        Ok(())
    }

    fn get_term(&self) -> u64 {
        self.state.term
    }

    fn set_term(&mut self, term: u64) -> Result<()> {
        let state = HardState {
            term,
            voted_for: self.state.voted_for.clone(),
        };
        self.save(state)
    }

    fn get_voted_for(&self) -> PeerId {
        self.state.voted_for.clone()
    }

    fn set_voted_for(&mut self, peer_id: &PeerId) -> Result<()> {
        let state = HardState {
            term: self.state.term,
            voted_for: peer_id.clone(),
        };
        self.save(state)
    }

    fn set_term_and_voted_for(&mut self, term: u64, peer_id: &PeerId) -> Result<()> {
        self.save(HardState {
            term,
            voted_for: peer_id.clone(),
        })
    }

    fn new_instance(&self, uri: &str) -> Result<Box<dyn StableStore>> {
        let (_, path) = parse_uri(uri)?;
        Ok(Box::new(Self::new(path, self.options.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_storage_persists_term_and_vote() {
        let dir = tempdir().unwrap();
        let mut store = LocalStableStore::new(dir.path(), StorageOptions::default());
        store.init().unwrap();

        store.set_term_and_voted_for(7, &PeerId::from("peer-C")).unwrap();

        assert_eq!(store.get_term(), 7);
        assert_eq!(store.get_voted_for(), PeerId::from("peer-C"));
        assert!(dir.path().join(META_FILE).exists());
    }

    #[test]
    fn individual_setters_keep_the_other_value() {
        let dir = tempdir().unwrap();
        let mut store = LocalStableStore::new(dir.path(), StorageOptions::default());
        store.init().unwrap();

        store.set_voted_for(&PeerId::from("peer-A")).unwrap();
        store.set_term(3).unwrap();

        let mut reopened = LocalStableStore::new(dir.path(), StorageOptions::default());
        reopened.init().unwrap();
        assert_eq!(reopened.get_term(), 3);
        assert_eq!(reopened.get_voted_for(), PeerId::from("peer-A"));
    }

    #[test]
    fn failed_write_keeps_previous_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stable");
        let mut store = LocalStableStore::new(&path, StorageOptions::default());
        store.init().unwrap();
        store.set_term(4).unwrap();

        fs::remove_dir_all(&path).unwrap();
        assert!(store.set_term(9).is_err());

        assert_eq!(store.get_term(), 4);
    }

    #[test]
    fn corrupt_file_fails_init() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(META_FILE), "{not json").unwrap();

        let mut store = LocalStableStore::new(dir.path(), StorageOptions::default());
        assert!(store.init().unwrap_err().is_fatal());
    }

    #[test]
    fn writes_are_flushed_without_sync_meta() {
        let dir = tempdir().unwrap();
        let options = StorageOptions {
            sync_meta: false,
            ..StorageOptions::default()
        };
        let mut store = LocalStableStore::new(dir.path(), options.clone());
        store.init().unwrap();
        store.synced.clear();

        store.set_term_and_voted_for(5, &PeerId::from("peer-B")).unwrap();

        assert_eq!(
            store.synced,
            vec![dir.path().join(META_TEMP_FILE), dir.path().to_path_buf()]
        );
        assert!(!dir.path().join(META_TEMP_FILE).exists());

        let mut reopened = LocalStableStore::new(dir.path(), options);
        reopened.init().unwrap();
        assert_eq!(reopened.get_term(), 5);
        assert_eq!(reopened.get_voted_for(), PeerId::from("peer-B"));
    }
}
