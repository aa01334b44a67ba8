//! # fs
//!
//! why: route every snapshot file operation through one replaceable seam
//! relations: injected into LocalSnapshotStore, read by the snapshot copier
//! what: FileSystemAdaptor trait, PosixFileSystemAdaptor, MemoryFileSystemAdaptor

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// trait for the file operations a snapshot store needs
///
/// paths are opaque to the store: it only joins names onto its own root.
pub trait FileSystemAdaptor: Send + Sync {
    /// create a directory; succeeds if it already exists
    fn create_dir(&self, path: &Path, recursive: bool) -> io::Result<()>;

    /// delete a file or directory; succeeds if nothing is there
    fn delete(&self, path: &Path, recursive: bool) -> io::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    /// names of the direct children of a directory
    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    fn file_size(&self, path: &Path) -> io::Result<u64>;

    /// up to `len` bytes starting at `offset`; shorter at end of file
    fn read_at(&self, path: &Path, offset: u64, len: u64) -> io::Result<Vec<u8>>;

    /// create or replace a file with `data`
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// append to a file, creating it if needed
    fn append(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// flush a file or directory to durable media
    fn sync(&self, path: &Path) -> io::Result<()>;
}

/// flush a directory entry table so renames inside it survive a crash
pub(crate) fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

// -- posix implementation --

/// adaptor over `std::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixFileSystemAdaptor;

impl FileSystemAdaptor for PosixFileSystemAdaptor {
    fn create_dir(&self, path: &Path, recursive: bool) -> io::Result<()> {
        let created = if recursive {
            fs::create_dir_all(path)
        } else {
            fs::create_dir(path)
        };
        match created {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            other => other,
        }
    }

    fn delete(&self, path: &Path, recursive: bool) -> io::Result<()> {
        let removed = if path.is_dir() {
            if recursive {
                fs::remove_dir_all(path)
            } else {
                fs::remove_dir(path)
            }
        } else {
            fs::remove_file(path)
        };
        match removed {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn read_at(&self, path: &Path, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.take(len).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        fs::write(path, data)
    }

    fn append(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(data)
    }

    fn sync(&self, path: &Path) -> io::Result<()> {
        if path.is_dir() {
            sync_dir(path)
        } else {
            File::open(path)?.sync_all()
        }
    }
}

// -- in-memory implementation --

#[derive(Debug, Default)]
struct MemoryTree {
    dirs: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, Vec<u8>>,
}

impl MemoryTree {
    fn is_dir(&self, path: &Path) -> bool {
        path.as_os_str().is_empty() || path == Path::new("/") || self.dirs.contains(path)
    }

    fn parent_exists(&self, path: &Path) -> bool {
        path.parent().map_or(true, |parent| self.is_dir(parent))
    }
}

/// adaptor over an in-memory tree, shared by every store that holds it
#[derive(Debug, Default)]
pub struct MemoryFileSystemAdaptor {
    tree: Mutex<MemoryTree>,
}

impl MemoryFileSystemAdaptor {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display()))
}

impl FileSystemAdaptor for MemoryFileSystemAdaptor {
    fn create_dir(&self, path: &Path, recursive: bool) -> io::Result<()> {
        let mut tree = self.tree.lock();
        if tree.files.contains_key(path) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "a file has this name"));
        }
        if !recursive && !tree.parent_exists(path) {
            return Err(not_found(path));
        }
        for ancestor in path.ancestors() {
            if tree.is_dir(ancestor) {
                break;
            }
            tree.dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    fn delete(&self, path: &Path, recursive: bool) -> io::Result<()> {
        let mut tree = self.tree.lock();
        if tree.files.remove(path).is_some() || !tree.dirs.contains(path) {
            return Ok(());
        }
        let has_children = tree.files.keys().any(|p| p.starts_with(path))
            || tree.dirs.iter().any(|p| p != path && p.starts_with(path));
        if has_children && !recursive {
            return Err(io::Error::new(io::ErrorKind::Other, "directory not empty"));
        }
        tree.files.retain(|p, _| !p.starts_with(path));
        tree.dirs.retain(|p| !p.starts_with(path));
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut tree = self.tree.lock();
        if !tree.parent_exists(to) {
            return Err(not_found(to));
        }
        if let Some(data) = tree.files.remove(from) {
            tree.files.insert(to.to_path_buf(), data);
            return Ok(());
        }
        if !tree.dirs.contains(from) {
            return Err(not_found(from));
        }
        if tree.dirs.contains(to) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "target directory exists"));
        }
        let moved = |p: &Path| match p.strip_prefix(from) {
            Ok(rest) if !rest.as_os_str().is_empty() => to.join(rest),
            _ => to.to_path_buf(),
        };
        let dirs: Vec<_> = tree.dirs.iter().filter(|p| p.starts_with(from)).cloned().collect();
        for dir in dirs {
            tree.dirs.remove(&dir);
            tree.dirs.insert(moved(&dir));
        }
        let files: Vec<_> = tree.files.keys().filter(|p| p.starts_with(from)).cloned().collect();
        for file in files {
            if let Some(data) = tree.files.remove(&file) {
                tree.files.insert(moved(&file), data);
            }
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        let tree = self.tree.lock();
        tree.files.contains_key(path) || tree.is_dir(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.tree.lock().is_dir(path)
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let tree = self.tree.lock();
        if !tree.is_dir(path) {
            return Err(not_found(path));
        }
        let children = tree
            .dirs
            .iter()
            .chain(tree.files.keys())
            .filter(|p| p.parent() == Some(path))
            .filter_map(|p| p.file_name())
            .map(|name| name.to_string_lossy().into_owned());
        let mut names: Vec<_> = children.collect();
        names.sort();
        Ok(names)
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        let tree = self.tree.lock();
        let data = tree.files.get(path).ok_or_else(|| not_found(path))?;
        Ok(data.len() as u64)
    }

    fn read_at(&self, path: &Path, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        let tree = self.tree.lock();
        let data = tree.files.get(path).ok_or_else(|| not_found(path))?;
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(len as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut tree = self.tree.lock();
        if !tree.parent_exists(path) {
            return Err(not_found(path));
        }
        tree.files.insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    fn append(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut tree = self.tree.lock();
        if !tree.parent_exists(path) {
            return Err(not_found(path));
        }
        tree.files
            .entry(path.to_path_buf())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    fn sync(&self, path: &Path) -> io::Result<()> {
        if self.exists(path) {
            Ok(())
        } else {
            Err(not_found(path))
        }
    }
}
