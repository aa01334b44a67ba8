//! # copier
//!
//! why: materialize a remote snapshot locally without ever exposing half of it
//! relations: started by LocalSnapshotStore, reads through the file service
//! what: LocalSnapshotCopier job, its worker thread and status signalling
//!
//! the worker builds the copy in the store's writer; every exit other than
//! a successful commit drops that writer, which removes it.

use parking_lot::{Condvar, Mutex};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use super::local::{LocalSnapshotReader, LocalSnapshotWriter, SnapshotTable, StoreContext};
use super::{CopyStatus, FileMeta, Snapshot, SnapshotCopier, SnapshotReader, SnapshotWriter};
use crate::error::{Result, StorageError};
use crate::file_service::ExportedSnapshot;
use crate::fs::FileSystemAdaptor;

struct Shared {
    cancelled: AtomicBool,
    status: Mutex<CopyStatus>,
    done: Condvar,
    reader: Mutex<Option<Box<dyn SnapshotReader>>>,
}

impl Shared {
    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(StorageError::Cancelled);
        }
        Ok(())
    }
}

/// a copy job running on its own thread
pub struct LocalSnapshotCopier {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LocalSnapshotCopier {
    pub(super) fn start(ctx: StoreContext, uri: &str) -> Result<Self> {
        let shared = Arc::new(Shared {
            cancelled: AtomicBool::new(false),
            status: Mutex::new(CopyStatus::Running),
            done: Condvar::new(),
            reader: Mutex::new(None),
        });

        let job = Job {
            ctx,
            uri: uri.to_string(),
            shared: shared.clone(),
        };
        let handle = thread::Builder::new()
            .name("snapshot-copier".to_string())
            .spawn(move || job.run())?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }
}

impl SnapshotCopier for LocalSnapshotCopier {
    fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    fn join(&self) {
        {
            let mut status = self.shared.status.lock();
            while !status.is_terminal() {
                self.shared.done.wait(&mut status);
            }
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("snapshot copier thread panicked");
            }
        }
    }

    fn status(&self) -> CopyStatus {
        self.shared.status.lock().clone()
    }

    fn get_reader(&mut self) -> Option<Box<dyn SnapshotReader>> {
        if self.status() != CopyStatus::Succeeded {
            return None;
        }
        self.shared.reader.lock().take()
    }
}

struct Job {
    ctx: StoreContext,
    uri: String,
    shared: Arc<Shared>,
}

impl Job {
    fn run(self) {
        info!(uri = %self.uri, "start copying snapshot");
        let status = match self.copy() {
            Ok(reader) => {
                *self.shared.reader.lock() = Some(Box::new(reader));
                info!(uri = %self.uri, "snapshot copied");
                CopyStatus::Succeeded
            }
            Err(StorageError::Cancelled) => {
                info!(uri = %self.uri, "snapshot copy cancelled");
                CopyStatus::Cancelled
            }
            Err(e) => {
                warn!(uri = %self.uri, error = %e, "snapshot copy failed");
                CopyStatus::Failed(e.to_string())
            }
        };
        *self.shared.status.lock() = status;
        self.shared.done.notify_all();
    }

    fn copy(&self) -> Result<LocalSnapshotReader> {
        let remote = self.ctx.file_service.resolve(&self.uri)?;
        self.shared.check_cancelled()?;

        let remote_table = SnapshotTable::load(&*remote.fs, &remote.path)?;
        let remote_meta = remote_table.meta.clone().ok_or_else(|| StorageError::CopyFailed {
            reason: format!("remote snapshot {} has no meta", remote.path.display()),
        })?;
        self.shared.check_cancelled()?;

        let mut writer = self.ctx.create_writer()?;
        let base = if self.ctx.filter_before_copy_remote {
            self.ctx.open_reader()?
        } else {
            None
        };
        let copied = self.copy_files(&remote, &remote_table, base.as_ref(), &mut writer);
        if let Some(base) = base {
            self.ctx.release_reader(base);
        }
        copied?;

        writer.save_meta(&remote_meta)?;
        self.shared.check_cancelled()?;
        self.ctx.commit(writer)?;

        self.ctx
            .open_reader()?
            .ok_or_else(|| StorageError::not_found("snapshot committed by copier"))
    }

    fn copy_files(
        &self,
        remote: &ExportedSnapshot,
        remote_table: &SnapshotTable,
        base: Option<&LocalSnapshotReader>,
        writer: &mut LocalSnapshotWriter,
    ) -> Result<()> {
        for (name, file_meta) in &remote_table.files {
            self.shared.check_cancelled()?;
            let dest = writer.path().join(name);

            match base.filter(|base| same_file(base, name, file_meta)) {
                Some(base) => {
                    debug!(file = %name, "reusing file from local snapshot");
                    self.transfer(&**base.fs(), &base.path().join(name), &dest, false)?;
                }
                None => {
                    let crc = self.transfer(&*remote.fs, &remote.path.join(name), &dest, true)?;
                    if file_meta.checksum.is_some_and(|expected| expected != crc) {
                        return Err(StorageError::CopyFailed {
                            reason: format!("checksum mismatch for {name}"),
                        });
                    }
                }
            }
            if self.ctx.options.sync {
                self.ctx.fs.sync(&dest)?;
            }
            writer.add_file_with_meta(name, Some(file_meta))?;
        }
        Ok(())
    }

    /// copy one file in chunks and return its crc32c
    fn transfer(
        &self,
        source_fs: &dyn FileSystemAdaptor,
        source: &Path,
        dest: &Path,
        throttled: bool,
    ) -> Result<u32> {
        let size = source_fs.file_size(source)?;
        let chunk = self.ctx.options.copy_chunk_size.max(1);
        self.ctx.fs.write(dest, &[])?;

        let mut crc = 0;
        let mut offset = 0;
        while offset < size {
            self.shared.check_cancelled()?;
            let mut want = chunk.min(size - offset);
            if throttled {
                if let Some(throttle) = &self.ctx.throttle {
                    want = throttle.throttled_by_throughput(want);
                    if want == 0 {
                        thread::sleep(throttle.retry_interval());
                        continue;
                    }
                    self.shared.check_cancelled()?;
                }
            }

            let data = source_fs.read_at(source, offset, want)?;
            if data.is_empty() {
                return Err(StorageError::CopyFailed {
                    reason: format!("{} shrank while being copied", source.display()),
                });
            }
            self.ctx.fs.append(dest, &data)?;
            crc = crc32c::crc32c_append(crc, &data);
            offset += data.len() as u64;
        }
        Ok(crc)
    }
}

fn same_file(base: &LocalSnapshotReader, name: &str, remote: &FileMeta) -> bool {
    match (base.get_file_meta(name), remote.checksum) {
        (Ok(local), Some(checksum)) => local.checksum == Some(checksum),
        _ => false,
    }
}
