//! # segment
//!
//! why: hold a contiguous run of log entries in one append-only file
//! relations: owned by LocalLogStore, one per `segment_<first>.log`
//! what: Segment with framed, checksummed records and an in-memory index
//!
//! record frame: `[len: u32 le][payload: json LogEntry][crc32c(payload): u32 le]`

use parking_lot::Mutex;
use raft_core::LogEntry;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{Result, StorageError};

const FRAME_HEADER_SIZE: u64 = 4;
const FRAME_TRAILER_SIZE: u64 = 4;
const FILE_PREFIX: &str = "segment_";
const FILE_SUFFIX: &str = ".log";

/// Result of scanning a segment file on open
#[derive(Debug, Default)]
pub(super) struct ScanReport {
    /// length of the valid prefix when the file ends in a torn or corrupt frame
    pub torn_at: Option<u64>,
}

#[derive(Debug)]
pub(super) struct Segment {
    path: PathBuf,
    first_index: u64,
    file: Mutex<File>,
    /// (file offset, term) of each entry, entry `i` has index `first_index + i`
    positions: Vec<(u64, u64)>,
    size: u64,
}

impl Segment {
    pub fn file_name(first_index: u64) -> String {
        format!("{FILE_PREFIX}{first_index:020}{FILE_SUFFIX}")
    }

    pub fn parse_file_name(name: &str) -> Option<u64> {
        name.strip_prefix(FILE_PREFIX)?
            .strip_suffix(FILE_SUFFIX)?
            .parse()
            .ok()
    }

    /// create an empty segment whose first entry will be `first_index`
    pub fn create(dir: &Path, first_index: u64) -> Result<Self> {
        let path = dir.join(Self::file_name(first_index));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            first_index,
            file: Mutex::new(file),
            positions: Vec::new(),
            size: 0,
        })
    }

    /// open an existing segment, calling `visit` for every valid entry.
    ///
    /// a frame cut short by the end of the file, or a bad checksum on the
    /// very last frame, is a torn tail: scanning stops there and reports its
    /// offset. a bad frame with more bytes after it, an unreadable payload
    /// or an out of sequence index is corruption.
    pub fn open(
        path: PathBuf,
        first_index: u64,
        visit: &mut dyn FnMut(&LogEntry),
    ) -> Result<(Self, ScanReport)> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut positions = Vec::new();
        let mut report = ScanReport::default();
        let mut pos = 0u64;
        while pos < bytes.len() as u64 {
            let rest = &bytes[pos as usize..];
            let payload = match decode_frame(rest) {
                Ok(payload) => payload,
                Err(FrameError::Incomplete) => {
                    report.torn_at = Some(pos);
                    break;
                }
                Err(FrameError::CrcMismatch { frame_len, .. }) if frame_len == rest.len() => {
                    report.torn_at = Some(pos);
                    break;
                }
                Err(FrameError::CrcMismatch { expected, actual, .. }) => {
                    return Err(StorageError::corruption(format!(
                        "checksum mismatch at offset {} of {}: expected {:#010x}, found {:#010x}",
                        pos,
                        path.display(),
                        expected,
                        actual
                    )));
                }
            };
            let entry: LogEntry = serde_json::from_slice(payload).map_err(|e| {
                StorageError::corruption(format!(
                    "unreadable record at offset {} of {}: {}",
                    pos,
                    path.display(),
                    e
                ))
            })?;
            let expected = first_index + positions.len() as u64;
            if entry.index != expected {
                return Err(StorageError::corruption(format!(
                    "{} holds index {} where {} was expected",
                    path.display(),
                    entry.index,
                    expected
                )));
            }
            visit(&entry);
            positions.push((pos, entry.term));
            pos += FRAME_HEADER_SIZE + payload.len() as u64 + FRAME_TRAILER_SIZE;
        }

        let segment = Self {
            path,
            first_index,
            file: Mutex::new(file),
            positions,
            size: pos,
        };
        Ok((segment, report))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    /// index of the last entry, `first_index - 1` when empty
    pub fn last_index(&self) -> u64 {
        self.first_index + self.positions.len() as u64 - 1
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// append one entry; on failure the file is cut back to its prior length
    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        let payload = serde_json::to_vec(entry)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| StorageError::invalid_argument("log entry larger than 4GiB"))?;

        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());

        let mut file = self.file.lock();
        let written = file
            .seek(SeekFrom::Start(self.size))
            .and_then(|_| file.write_all(&frame));
        if let Err(e) = written {
            if let Err(cut) = file.set_len(self.size) {
                warn!(
                    segment = %self.path.display(),
                    size = self.size,
                    error = %cut,
                    "failed to cut partial record after write error"
                );
            }
            return Err(e.into());
        }
        drop(file);

        self.positions.push((self.size, entry.term));
        self.size += frame.len() as u64;
        Ok(())
    }

    pub fn term(&self, index: u64) -> Option<u64> {
        self.slot(index).map(|slot| self.positions[slot].1)
    }

    pub fn read(&self, index: u64) -> Result<Option<LogEntry>> {
        let Some(slot) = self.slot(index) else {
            return Ok(None);
        };
        let start = self.positions[slot].0;
        let end = self
            .positions
            .get(slot + 1)
            .map_or(self.size, |&(offset, _)| offset);

        let mut frame = vec![0u8; (end - start) as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(start))?;
            file.read_exact(&mut frame)?;
        }
        let payload = decode_frame(&frame).map_err(|e| {
            StorageError::corruption(format!(
                "{} for index {} in {}",
                e,
                index,
                self.path.display()
            ))
        })?;
        Ok(Some(serde_json::from_slice(payload)?))
    }

    /// drop every entry after `last_index_kept`
    pub fn truncate_after(&mut self, last_index_kept: u64) -> Result<()> {
        if last_index_kept >= self.last_index() {
            return Ok(());
        }
        let keep = (last_index_kept + 1).saturating_sub(self.first_index) as usize;
        let new_size = self.positions.get(keep).map_or(self.size, |&(offset, _)| offset);
        self.file.lock().set_len(new_size)?;
        self.positions.truncate(keep);
        self.size = new_size;
        Ok(())
    }

    /// cut off a torn tail found while scanning
    pub fn repair(&mut self, valid_len: u64) -> io::Result<()> {
        let file = self.file.lock();
        file.set_len(valid_len)?;
        file.sync_all()
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.lock().sync_data()
    }

    pub fn remove(self) -> io::Result<()> {
        let Self { path, file, .. } = self;
        drop(file);
        fs::remove_file(path)
    }

    fn slot(&self, index: u64) -> Option<usize> {
        if index < self.first_index || index > self.last_index() {
            return None;
        }
        Some((index - self.first_index) as usize)
    }
}

/// why a frame could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameError {
    /// the bytes end before the frame does
    Incomplete,
    /// the frame is complete but its payload does not match the trailer
    CrcMismatch {
        expected: u32,
        actual: u32,
        frame_len: usize,
    },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Incomplete => f.write_str("incomplete record"),
            FrameError::CrcMismatch { expected, actual, .. } => write!(
                f,
                "checksum mismatch (expected {expected:#010x}, found {actual:#010x})"
            ),
        }
    }
}

/// payload of the frame at the start of `bytes`
fn decode_frame(bytes: &[u8]) -> std::result::Result<&[u8], FrameError> {
    let header: [u8; 4] = bytes
        .get(..4)
        .and_then(|h| h.try_into().ok())
        .ok_or(FrameError::Incomplete)?;
    let len = u32::from_le_bytes(header) as usize;
    let frame_len = len + (FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE) as usize;
    let payload = bytes.get(4..4 + len).ok_or(FrameError::Incomplete)?;
    let trailer: [u8; 4] = bytes
        .get(4 + len..frame_len)
        .and_then(|t| t.try_into().ok())
        .ok_or(FrameError::Incomplete)?;

    let expected = u32::from_le_bytes(trailer);
    let actual = crc32c::crc32c(payload);
    if expected != actual {
        return Err(FrameError::CrcMismatch {
            expected,
            actual,
            frame_len,
        });
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn noop(_: &LogEntry) {}

    #[test]
    fn segment_creation() {
        let dir = tempdir().unwrap();
        let segment = Segment::create(dir.path(), 1).unwrap();

        assert_eq!(segment.first_index(), 1);
        assert_eq!(segment.last_index(), 0);
        assert!(segment.is_empty());
        assert_eq!(Segment::parse_file_name(&Segment::file_name(42)), Some(42));
    }

    #[test]
    fn segment_append_and_read() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), 1).unwrap();

        segment.append(&LogEntry::new(1, 1, b"first entry".to_vec())).unwrap();
        segment.append(&LogEntry::new(2, 2, b"second entry".to_vec())).unwrap();

        assert_eq!(segment.last_index(), 2);
        assert_eq!(segment.term(2), Some(2));
        let first = segment.read(1).unwrap().unwrap();
        assert_eq!(first.command(), Some(&b"first entry"[..]));
        assert!(segment.read(3).unwrap().is_none());
    }

    #[test]
    fn segment_truncate() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), 1).unwrap();
        for index in 1..=3 {
            segment.append(&LogEntry::new(1, index, vec![index as u8])).unwrap();
        }

        segment.truncate_after(2).unwrap();

        assert_eq!(segment.last_index(), 2);
        assert!(segment.read(3).unwrap().is_none());
        segment.append(&LogEntry::new(2, 3, vec![9])).unwrap();
        assert_eq!(segment.term(3), Some(2));
    }

    #[test]
    fn reopen_reports_torn_tail() {
        let dir = tempdir().unwrap();
        let path = {
            let mut segment = Segment::create(dir.path(), 5).unwrap();
            segment.append(&LogEntry::new(1, 5, b"kept".to_vec())).unwrap();
            segment.append(&LogEntry::new(1, 6, b"torn".to_vec())).unwrap();
            segment.path().to_path_buf()
        };
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 2).unwrap();

        let mut seen = Vec::new();
        let (segment, report) = Segment::open(path, 5, &mut |e| seen.push(e.index)).unwrap();

        assert_eq!(seen, vec![5]);
        assert_eq!(segment.last_index(), 5);
        assert_eq!(report.torn_at, Some(segment.size()));
    }

    #[test]
    fn reopen_rejects_out_of_sequence_index() {
        let dir = tempdir().unwrap();
        let path = {
            let mut segment = Segment::create(dir.path(), 1).unwrap();
            segment.append(&LogEntry::new(1, 1, vec![])).unwrap();
            segment.path().to_path_buf()
        };

        let err = Segment::open(path, 2, &mut noop).unwrap_err();
        assert!(err.is_fatal());
    }

    fn write_entries(dir: &Path, count: u64) -> PathBuf {
        let mut segment = Segment::create(dir, 1).unwrap();
        for index in 1..=count {
            segment.append(&LogEntry::new(1, index, b"payload".to_vec())).unwrap();
        }
        segment.path().to_path_buf()
    }

    fn flip_byte(path: &Path, offset: u64) {
        let mut bytes = fs::read(path).unwrap();
        bytes[offset as usize] ^= 0xff;
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn bad_checksum_before_valid_records_is_corruption() {
        let dir = tempdir().unwrap();
        let path = write_entries(dir.path(), 3);
        // inside the payload of the first record
        flip_byte(&path, 10);

        let err = Segment::open(path, 1, &mut noop).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn bad_checksum_on_last_record_is_a_torn_tail() {
        let dir = tempdir().unwrap();
        let path = write_entries(dir.path(), 3);
        let len = fs::metadata(&path).unwrap().len();
        flip_byte(&path, len - 6);

        let (segment, report) = Segment::open(path, 1, &mut noop).unwrap();
        assert_eq!(segment.last_index(), 2);
        assert_eq!(report.torn_at, Some(segment.size()));
    }

    #[test]
    fn failed_append_leaves_segment_unchanged() {
        let dir = tempdir().unwrap();
        let path = write_entries(dir.path(), 2);
        let (mut segment, _) = Segment::open(path.clone(), 1, &mut noop).unwrap();
        let size = segment.size();
        // a read-only handle refuses both the write and the cut back
        *segment.file.lock() = File::open(&path).unwrap();

        assert!(segment.append(&LogEntry::new(1, 3, vec![1])).is_err());

        assert_eq!(segment.last_index(), 2);
        assert_eq!(segment.size(), size);
        assert_eq!(fs::metadata(&path).unwrap().len(), size);
        assert_eq!(segment.read(2).unwrap().unwrap().index, 2);
    }
}
