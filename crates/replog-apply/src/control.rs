//! Apply checkpoints.
//!
//! One control file per replica target and journal instance records how far
//! replay got and which transactions were still open there. It is replaced
//! atomically (temporary file, fsync, rename) on every save, and a sibling
//! lock file keeps a second engine off the same target.
//!
//! # Format
//!
//! ```text
//! +-----------+---------+----------+----------+--------------+----------+----------------+
//! | Magic (8) | Ver (2) | Rsvd (2) | Count(4) | Sequence (8) | Offset(8)| DbSequence (8) |
//! +-----------+---------+----------+----------+--------------+----------+----------------+
//! | Count x { TxnId (8), Sequence (8) }                                | Crc32 (4)      |
//! +--------------------------------------------------------------------+----------------+
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use fs2::FileExt;
use uuid::Uuid;

use replog_common::types::TxnId;

use crate::error::{ApplyError, ApplyResult};

/// Magic at the start of a control file.
const CONTROL_MAGIC: [u8; 8] = *b"RPLGCTL\0";

/// Control file format version.
const CONTROL_VERSION: u16 = 2;

/// Size of the fixed part.
const FIXED_SIZE: usize = 8 + 2 + 2 + 4 + 8 + 8 + 8;

/// Size of one active transaction entry.
const ENTRY_SIZE: usize = 16;

/// A transaction seen starting but not yet ending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTransaction {
    /// Transaction id.
    pub txn_id: TxnId,
    /// Segment holding its first block.
    pub sequence: u64,
}

/// Replay progress of one journal instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlState {
    /// Last segment worked on.
    pub sequence: u64,
    /// End of the last replayed block in `sequence`; 0 once it is complete.
    pub offset: u64,
    /// Replica high-water mark seen when the state was last reset.
    pub db_sequence: u64,
    /// Open transactions.
    pub active: Vec<ActiveTransaction>,
}

impl ControlState {
    /// State continuing after segment `db_sequence`.
    pub fn starting_after(db_sequence: u64) -> Self {
        Self {
            sequence: db_sequence,
            offset: 0,
            db_sequence,
            active: Vec::new(),
        }
    }

    /// First segment not completely replayed.
    pub fn next_position(&self) -> u64 {
        if self.offset == 0 {
            self.sequence + 1
        } else {
            self.sequence
        }
    }

    /// Segment of the oldest open transaction.
    pub fn oldest_active(&self) -> Option<u64> {
        self.active.iter().map(|t| t.sequence).min()
    }

    /// First segment replay has to read.
    pub fn threshold(&self) -> u64 {
        match self.oldest_active() {
            Some(oldest) => oldest.min(self.next_position()),
            None => self.next_position(),
        }
    }

    /// Returns true if `txn_id` is open.
    pub fn is_active(&self, txn_id: TxnId) -> bool {
        self.active.iter().any(|t| t.txn_id == txn_id)
    }

    /// Records the start of a transaction in `sequence`.
    pub fn begin(&mut self, txn_id: TxnId, sequence: u64) {
        if !self.is_active(txn_id) {
            self.active.push(ActiveTransaction { txn_id, sequence });
        }
    }

    /// Records the end of a transaction. Returns false if it was not open.
    pub fn end(&mut self, txn_id: TxnId) -> bool {
        let before = self.active.len();
        self.active.retain(|t| t.txn_id != txn_id);
        before != self.active.len()
    }

    /// Returns true if the block at `offset` of segment `sequence` was
    /// replayed before this checkpoint.
    pub fn precedes(&self, sequence: u64, offset: u64) -> bool {
        sequence < self.sequence || (sequence == self.sequence && (self.offset == 0 || offset < self.offset))
    }

    /// Returns true if segment `sequence` was completely replayed before
    /// this checkpoint.
    pub fn is_complete(&self, sequence: u64) -> bool {
        sequence < self.sequence || (sequence == self.sequence && self.offset == 0)
    }

    /// Returns true if segment `sequence` can be deleted.
    pub fn can_delete(&self, sequence: u64) -> bool {
        self.oldest_active().map_or(true, |oldest| oldest > sequence)
    }

    /// Ordering key of the checkpoint position.
    fn position(&self) -> (u64, u64) {
        let offset = if self.offset == 0 { u64::MAX } else { self.offset };
        (self.sequence, offset)
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FIXED_SIZE + self.active.len() * ENTRY_SIZE + 4);
        buf.put_slice(&CONTROL_MAGIC);
        buf.put_u16_le(CONTROL_VERSION);
        buf.put_u16_le(0); // reserved
        buf.put_u32_le(self.active.len() as u32);
        buf.put_u64_le(self.sequence);
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.db_sequence);
        for txn in &self.active {
            buf.put_u64_le(txn.txn_id.as_u64());
            buf.put_u64_le(txn.sequence);
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        buf
    }

    fn decode(bytes: &[u8], path: &Path) -> ApplyResult<Self> {
        if bytes.len() < FIXED_SIZE + 4 {
            return Err(ApplyError::control_corrupted(path, "file too short"));
        }

        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let stored = (&trailer[..]).get_u32_le();
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(ApplyError::control_corrupted(
                path,
                format!("checksum mismatch: stored {:08x}, computed {:08x}", stored, computed),
            ));
        }

        let mut buf = body;
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != CONTROL_MAGIC {
            return Err(ApplyError::control_corrupted(path, "invalid signature"));
        }

        let version = buf.get_u16_le();
        if version != CONTROL_VERSION {
            return Err(ApplyError::control_corrupted(
                path,
                format!("unsupported version {}", version),
            ));
        }
        let _reserved = buf.get_u16_le();

        let count = buf.get_u32_le() as usize;
        let mut state = Self {
            sequence: buf.get_u64_le(),
            offset: buf.get_u64_le(),
            db_sequence: buf.get_u64_le(),
            active: Vec::with_capacity(count),
        };

        if buf.remaining() != count * ENTRY_SIZE {
            return Err(ApplyError::control_corrupted(
                path,
                format!("{} active transactions do not fit {} bytes", count, buf.remaining()),
            ));
        }
        for _ in 0..count {
            state.active.push(ActiveTransaction {
                txn_id: TxnId::new(buf.get_u64_le()),
                sequence: buf.get_u64_le(),
            });
        }

        Ok(state)
    }
}

/// The locked control file of one replica target and journal instance.
#[derive(Debug)]
pub struct ControlFile {
    path: PathBuf,
    lock: File,
    state: ControlState,
}

impl ControlFile {
    /// Returns the control file path for a journal instance.
    pub fn file_path(dir: &Path, guid: Uuid) -> PathBuf {
        dir.join(format!("{}.control", guid))
    }

    /// Opens and locks the control file, starting fresh if it does not
    /// exist.
    pub fn open(dir: &Path, guid: Uuid) -> ApplyResult<Self> {
        fs::create_dir_all(dir)?;
        let path = Self::file_path(dir, guid);

        let mut lock_name = path.as_os_str().to_os_string();
        lock_name.push(".lock");
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(PathBuf::from(lock_name))?;
        lock.try_lock_exclusive()
            .map_err(|_| ApplyError::ControlLocked { path: path.clone() })?;

        let state = match fs::read(&path) {
            Ok(bytes) => ControlState::decode(&bytes, &path)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ControlState::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self { path, lock, state })
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the saved state.
    pub fn state(&self) -> &ControlState {
        &self.state
    }

    /// Persists `state`, which must not be behind the saved position.
    pub fn save(&mut self, state: ControlState) -> ApplyResult<()> {
        if state.position() < self.state.position() {
            return Err(ApplyError::ControlRegressed {
                from: (self.state.sequence, self.state.offset),
                to: (state.sequence, state.offset),
            });
        }
        self.write(state)
    }

    /// Restarts replay after segment `db_sequence`, forgetting every open
    /// transaction.
    pub fn reset(&mut self, db_sequence: u64) -> ApplyResult<()> {
        self.write(ControlState::starting_after(db_sequence))
    }

    fn write(&mut self, state: ControlState) -> ApplyResult<()> {
        let mut tmp_name = self.path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&state.encode())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.path)?;
        if let Some(dir) = self.path.parent() {
            if let Ok(dir) = File::open(dir) {
                let _ = dir.sync_all();
            }
        }

        self.state = state;
        Ok(())
    }
}

impl Drop for ControlFile {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            tracing::warn!("cannot unlock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn active(txn: u64, sequence: u64) -> ActiveTransaction {
        ActiveTransaction {
            txn_id: TxnId::new(txn),
            sequence,
        }
    }

    #[test]
    fn test_threshold() {
        let mut state = ControlState::starting_after(4);
        assert_eq!(state.threshold(), 5);

        state.sequence = 6;
        state.offset = 300;
        assert_eq!(state.threshold(), 6);

        state.begin(TxnId::new(1), 5);
        assert_eq!(state.threshold(), 5);
        assert!(!state.can_delete(5));
        assert!(state.can_delete(4));

        assert!(state.end(TxnId::new(1)));
        assert!(!state.end(TxnId::new(1)));
        assert_eq!(state.threshold(), 6);
    }

    #[test]
    fn test_precedes() {
        let state = ControlState {
            sequence: 3,
            offset: 500,
            ..Default::default()
        };
        assert!(state.precedes(2, 10_000));
        assert!(state.precedes(3, 100));
        assert!(!state.precedes(3, 500));
        assert!(!state.precedes(4, 44));

        assert!(state.is_complete(2));
        assert!(!state.is_complete(3));

        let complete = ControlState::starting_after(3);
        assert!(complete.precedes(3, 10_000));
        assert!(!complete.precedes(4, 44));
        assert!(complete.is_complete(3));
    }

    #[test]
    fn test_save_and_reopen() {
        let tmp = TempDir::new().unwrap();
        let guid = Uuid::new_v4();

        let state = ControlState {
            sequence: 7,
            offset: 1024,
            db_sequence: 2,
            active: vec![active(10, 6), active(11, 7)],
        };
        {
            let mut control = ControlFile::open(tmp.path(), guid).unwrap();
            assert_eq!(control.state(), &ControlState::default());
            control.save(state.clone()).unwrap();
        }

        let control = ControlFile::open(tmp.path(), guid).unwrap();
        assert_eq!(control.state(), &state);
        assert!(!tmp.path().join(format!("{}.control.tmp", guid)).exists());
    }

    #[test]
    fn test_checkpoint_only_moves_forward() {
        let tmp = TempDir::new().unwrap();
        let mut control = ControlFile::open(tmp.path(), Uuid::new_v4()).unwrap();

        control
            .save(ControlState {
                sequence: 5,
                offset: 200,
                ..Default::default()
            })
            .unwrap();

        let behind = ControlState {
            sequence: 5,
            offset: 100,
            ..Default::default()
        };
        assert!(matches!(
            control.save(behind),
            Err(ApplyError::ControlRegressed { .. })
        ));

        // Completing the segment is ahead of any offset inside it.
        control.save(ControlState::starting_after(5)).unwrap();
        assert_eq!(control.state().next_position(), 6);

        // A reset may go anywhere.
        control.reset(2).unwrap();
        assert_eq!(control.state().threshold(), 3);
    }

    #[test]
    fn test_second_engine_is_locked_out() {
        let tmp = TempDir::new().unwrap();
        let guid = Uuid::new_v4();

        let first = ControlFile::open(tmp.path(), guid).unwrap();
        assert!(matches!(
            ControlFile::open(tmp.path(), guid),
            Err(ApplyError::ControlLocked { .. })
        ));
        drop(first);
        assert!(ControlFile::open(tmp.path(), guid).is_ok());
    }

    #[test]
    fn test_corruption_detected() {
        let tmp = TempDir::new().unwrap();
        let guid = Uuid::new_v4();
        {
            let mut control = ControlFile::open(tmp.path(), guid).unwrap();
            control.save(ControlState::starting_after(1)).unwrap();
        }

        let path = ControlFile::file_path(tmp.path(), guid);
        let mut bytes = fs::read(&path).unwrap();
        bytes[20] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let err = ControlFile::open(tmp.path(), guid).unwrap_err();
        assert!(err.is_corruption());
    }
}
