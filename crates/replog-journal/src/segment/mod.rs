//! Journal segment files.
//!
//! A segment's header on disk is the shared truth: several processes append
//! to the same files. Every header read or write must happen while the shared
//! journal lock is held.

mod header;

pub use header::{SegmentHeader, SegmentState, SEGMENT_FORMAT_VERSION, SEGMENT_SIGNATURE};

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{JournalError, JournalResult};

struct SegmentInner {
    path: PathBuf,
    file: File,
    header: SegmentHeader,
    /// Length known to be on stable storage, for the current sequence.
    synced_length: u64,
}

/// A single journal segment file.
pub struct Segment {
    inner: Mutex<SegmentInner>,
}

impl Segment {
    /// Creates a new `USED` segment file.
    pub fn create(path: impl AsRef<Path>, guid: Uuid, sequence: u64) -> JournalResult<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let header = SegmentHeader::new(guid, sequence, SegmentState::Used);
        let segment = Self {
            inner: Mutex::new(SegmentInner {
                path,
                file,
                header,
                synced_length: 0,
            }),
        };

        {
            let mut inner = segment.inner.lock();
            Self::write_header(&mut inner)?;
        }

        Ok(segment)
    }

    /// Opens an existing segment file.
    pub fn open(path: impl AsRef<Path>) -> JournalResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let header = SegmentHeader::read_from_file(&mut file, &path)?;

        Ok(Self {
            inner: Mutex::new(SegmentInner {
                path,
                file,
                header,
                synced_length: 0,
            }),
        })
    }

    fn write_header(inner: &mut SegmentInner) -> JournalResult<()> {
        let bytes = inner.header.to_bytes();
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&bytes)?;
        Ok(())
    }

    /// Re-reads the header written by any process.
    pub fn reload(&self) -> JournalResult<SegmentHeader> {
        let mut inner = self.inner.lock();
        inner.file.seek(SeekFrom::Start(0))?;
        let path = inner.path.clone();
        let header = SegmentHeader::read_from_file(&mut inner.file, &path)?;
        if header.sequence != inner.header.sequence {
            inner.synced_length = 0;
        }
        inner.header = header;
        Ok(header)
    }

    /// Returns the cached header.
    pub fn header(&self) -> SegmentHeader {
        self.inner.lock().header
    }

    /// Returns the segment sequence.
    pub fn sequence(&self) -> u64 {
        self.inner.lock().header.sequence
    }

    /// Returns the segment state.
    pub fn state(&self) -> SegmentState {
        self.inner.lock().header.state
    }

    /// Returns the logical length.
    pub fn length(&self) -> u64 {
        self.inner.lock().header.length
    }

    /// Returns the current path of the segment file.
    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }

    /// Changes the state and persists the header.
    pub fn set_state(&self, state: SegmentState) -> JournalResult<()> {
        let mut inner = self.inner.lock();
        inner.header.state = state;
        Self::write_header(&mut inner)
    }

    /// Appends a block after the last one.
    ///
    /// Returns the logical length after the append.
    pub fn append(&self, data: &[u8]) -> JournalResult<u64> {
        let mut inner = self.inner.lock();
        if inner.header.state != SegmentState::Used {
            return Err(JournalError::segment_corrupted(
                inner.path.clone(),
                format!("append to a segment in state {:?}", inner.header.state),
            ));
        }

        let pos = inner.header.length;
        inner.file.seek(SeekFrom::Start(pos))?;
        inner.file.write_all(data)?;

        inner.header.length = pos + data.len() as u64;
        Self::write_header(&mut inner)?;
        Ok(inner.header.length)
    }

    /// Recycles a free segment under a new sequence number.
    ///
    /// The file is renamed to `new_path`, truncated to its header and
    /// reopened for writing.
    pub fn reuse(&self, new_path: &Path, sequence: u64) -> JournalResult<()> {
        let mut inner = self.inner.lock();
        std::fs::rename(&inner.path, new_path)?;
        inner.path = new_path.to_path_buf();

        inner.file.set_len(SegmentHeader::SIZE as u64)?;
        inner.header = SegmentHeader::new(inner.header.guid, sequence, SegmentState::Used);
        inner.synced_length = 0;
        Self::write_header(&mut inner)
    }

    /// Forces written blocks to stable storage.
    ///
    /// The lock is not held during the flush so concurrent appends proceed.
    pub fn sync(&self) -> JournalResult<()> {
        let (file, sequence, length) = {
            let inner = self.inner.lock();
            (inner.file.try_clone()?, inner.header.sequence, inner.header.length)
        };

        file.sync_data()?;

        let mut inner = self.inner.lock();
        if inner.header.sequence == sequence {
            inner.synced_length = inner.synced_length.max(length);
        }
        Ok(())
    }

    /// Returns true if everything up to `length` of segment `sequence` is
    /// already on stable storage.
    ///
    /// A segment that moved on to another sequence was sealed, and sealing
    /// flushes it.
    pub fn is_synced(&self, sequence: u64, length: u64) -> bool {
        let inner = self.inner.lock();
        inner.header.sequence != sequence || inner.synced_length >= length
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Segment")
            .field("path", &inner.path)
            .field("sequence", &inner.header.sequence)
            .field("state", &inner.header.state)
            .field("length", &inner.header.length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn segment_path(dir: &Path, sequence: u64) -> PathBuf {
        dir.join(format!("db.journal-{:09}", sequence))
    }

    #[test]
    fn test_create_segment() {
        let tmp = TempDir::new().unwrap();
        let path = segment_path(tmp.path(), 1);
        let guid = Uuid::new_v4();

        let segment = Segment::create(&path, guid, 1).unwrap();
        assert_eq!(segment.sequence(), 1);
        assert_eq!(segment.state(), SegmentState::Used);
        assert_eq!(segment.length(), SegmentHeader::SIZE as u64);
        assert!(path.exists());

        // Creating over an existing file fails.
        assert!(Segment::create(&path, guid, 1).is_err());
    }

    #[test]
    fn test_append_and_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = segment_path(tmp.path(), 3);
        let segment = Segment::create(&path, Uuid::new_v4(), 3).unwrap();

        let len = segment.append(b"first block").unwrap();
        assert_eq!(len, SegmentHeader::SIZE as u64 + 11);
        let len = segment.append(b"second").unwrap();
        assert_eq!(len, SegmentHeader::SIZE as u64 + 17);
        drop(segment);

        let segment = Segment::open(&path).unwrap();
        assert_eq!(segment.length(), SegmentHeader::SIZE as u64 + 17);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), segment.length());
        assert!(segment.header().has_data());
    }

    #[test]
    fn test_state_changes_are_shared() {
        let tmp = TempDir::new().unwrap();
        let path = segment_path(tmp.path(), 1);
        let writer = Segment::create(&path, Uuid::new_v4(), 1).unwrap();
        let other = Segment::open(&path).unwrap();

        writer.append(b"data").unwrap();
        writer.set_state(SegmentState::Full).unwrap();

        assert_eq!(other.state(), SegmentState::Used);
        let header = other.reload().unwrap();
        assert_eq!(header.state, SegmentState::Full);
        assert_eq!(header.length, SegmentHeader::SIZE as u64 + 4);

        // Sealed segments reject appends.
        assert!(writer.append(b"more").is_err());
    }

    #[test]
    fn test_reuse_renames() {
        let tmp = TempDir::new().unwrap();
        let old_path = segment_path(tmp.path(), 1);
        let new_path = segment_path(tmp.path(), 5);

        let segment = Segment::create(&old_path, Uuid::new_v4(), 1).unwrap();
        segment.append(&[7u8; 100]).unwrap();
        segment.set_state(SegmentState::Free).unwrap();

        segment.reuse(&new_path, 5).unwrap();
        assert!(!old_path.exists());
        assert!(new_path.exists());
        assert_eq!(segment.sequence(), 5);
        assert_eq!(segment.state(), SegmentState::Used);
        assert!(!segment.header().has_data());
        assert_eq!(
            std::fs::metadata(&new_path).unwrap().len(),
            SegmentHeader::SIZE as u64
        );
    }

    #[test]
    fn test_sync_tracking() {
        let tmp = TempDir::new().unwrap();
        let segment = Segment::create(segment_path(tmp.path(), 1), Uuid::new_v4(), 1).unwrap();

        let len = segment.append(b"block").unwrap();
        assert!(!segment.is_synced(1, len));

        segment.sync().unwrap();
        assert!(segment.is_synced(1, len));
        assert!(!segment.is_synced(1, len + 1));
        assert!(segment.is_synced(2, u64::MAX));
    }
}
