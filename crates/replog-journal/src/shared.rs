//! Journal state shared by every attached process.
//!
//! The state lives in a small memory-mapped file next to the segments. It is
//! only read or written inside [`SharedState::with_lock`], which holds an
//! in-process mutex (threads share one file handle, and `flock` does not
//! exclude them) and an exclusive file lock (other processes).

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use fs2::FileExt;
use memmap2::MmapMut;
use parking_lot::Mutex;
use replog_common::constants::MAX_PROCESSES;
use uuid::Uuid;

use crate::error::{JournalError, JournalResult};

/// Signature at the start of the state file.
pub const STATE_SIGNATURE: [u8; 8] = *b"RPLGSTA\0";

/// Current state file version.
pub const STATE_VERSION: u16 = 2;

/// Decoded shared journal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateHeader {
    /// Journal instance identity, stamped into every segment.
    pub guid: Uuid,
    /// Number of segment files.
    pub segment_count: u64,
    /// Last sequence number handed out.
    pub sequence: u64,
    /// Bumped every time a segment is sealed.
    pub flush_generation: u64,
    /// Time the current segment became active (microseconds).
    pub timestamp: u64,
    /// Bumped whenever a segment file is created, renamed or removed.
    pub dir_epoch: u64,
    pids: Vec<u32>,
}

impl StateHeader {
    /// Size of the encoded state in bytes.
    pub const SIZE: usize = 32 + 5 * 8 + MAX_PROCESSES * 4;

    fn new(guid: Uuid) -> Self {
        Self {
            guid,
            segment_count: 0,
            sequence: 0,
            flush_generation: 0,
            timestamp: 0,
            dir_epoch: 0,
            pids: Vec::new(),
        }
    }

    /// Returns the registered process ids.
    pub fn pids(&self) -> &[u32] {
        &self.pids
    }

    /// Registers an attachment of `pid`.
    ///
    /// A process attaching twice is registered twice.
    pub fn register(&mut self, pid: u32) -> JournalResult<()> {
        if self.pids.len() >= MAX_PROCESSES {
            return Err(JournalError::TooManyProcesses { max: MAX_PROCESSES });
        }
        self.pids.push(pid);
        Ok(())
    }

    /// Removes one attachment of `pid`. Returns false if none was registered.
    pub fn unregister(&mut self, pid: u32) -> bool {
        match self.pids.iter().position(|&p| p == pid) {
            Some(index) => {
                self.pids.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Drops every process for which `is_alive` returns false.
    ///
    /// Returns the number of entries removed.
    pub fn prune(&mut self, is_alive: impl Fn(u32) -> bool) -> usize {
        let before = self.pids.len();
        self.pids.retain(|&pid| is_alive(pid));
        before - self.pids.len()
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&STATE_SIGNATURE);
        buf.put_u16_le(STATE_VERSION);
        buf.put_u16_le(0); // reserved
        buf.put_u32_le(self.pids.len() as u32);
        buf.put_slice(self.guid.as_bytes());
        buf.put_u64_le(self.segment_count);
        buf.put_u64_le(self.sequence);
        buf.put_u64_le(self.flush_generation);
        buf.put_u64_le(self.timestamp);
        buf.put_u64_le(self.dir_epoch);
        for slot in 0..MAX_PROCESSES {
            buf.put_u32_le(self.pids.get(slot).copied().unwrap_or(0));
        }
    }

    fn decode(mut buf: &[u8], path: &Path) -> JournalResult<Self> {
        if buf.len() < Self::SIZE {
            return Err(JournalError::state_corrupted(format!(
                "{} is smaller than {} bytes",
                path.display(),
                Self::SIZE
            )));
        }

        let mut signature = [0u8; 8];
        buf.copy_to_slice(&mut signature);
        if signature != STATE_SIGNATURE {
            return Err(JournalError::InvalidSignature {
                path: path.to_path_buf(),
            });
        }

        let version = buf.get_u16_le();
        if version != STATE_VERSION {
            return Err(JournalError::UnsupportedVersion {
                path: path.to_path_buf(),
                expected: STATE_VERSION,
                found: version,
            });
        }
        let _reserved = buf.get_u16_le();

        let pid_count = buf.get_u32_le() as usize;
        if pid_count > MAX_PROCESSES {
            return Err(JournalError::state_corrupted(format!(
                "{} processes registered, at most {} supported",
                pid_count, MAX_PROCESSES
            )));
        }

        let mut guid = [0u8; 16];
        buf.copy_to_slice(&mut guid);

        let mut header = Self::new(Uuid::from_bytes(guid));
        header.segment_count = buf.get_u64_le();
        header.sequence = buf.get_u64_le();
        header.flush_generation = buf.get_u64_le();
        header.timestamp = buf.get_u64_le();
        header.dir_epoch = buf.get_u64_le();
        header.pids = (0..MAX_PROCESSES)
            .map(|_| buf.get_u32_le())
            .take(pid_count)
            .collect();

        Ok(header)
    }
}

/// Holds the file lock until dropped.
struct StateLock<'a> {
    file: &'a File,
}

impl<'a> StateLock<'a> {
    fn acquire(file: &'a File) -> JournalResult<Self> {
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for StateLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!("cannot unlock journal state: {}", e);
        }
    }
}

/// Memory-mapped shared journal state.
pub(crate) struct SharedState {
    path: PathBuf,
    file: File,
    map: Mutex<MmapMut>,
    guid: Uuid,
}

impl SharedState {
    /// Opens the state file, initializing it with a fresh journal identity if
    /// it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> JournalResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let (map, guid) = {
            let _lock = StateLock::acquire(&file)?;

            let fresh = file.metadata()?.len() == 0;
            if fresh {
                file.set_len(StateHeader::SIZE as u64)?;
            }

            // SAFETY: the mapping is only accessed while holding both the
            // in-process mutex and the exclusive file lock, and every process
            // maps the file at its full fixed size.
            let mut map = unsafe { MmapMut::map_mut(&file)? };

            let header = if fresh {
                let header = StateHeader::new(Uuid::new_v4());
                header.encode(&mut &mut map[..]);
                map.flush()?;
                tracing::info!(guid = %header.guid, "initialized journal state {}", path.display());
                header
            } else {
                StateHeader::decode(&map[..], &path)?
            };

            (map, header.guid)
        };

        Ok(Self {
            path,
            file,
            map: Mutex::new(map),
            guid,
        })
    }

    /// Journal instance identity.
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    /// Runs `f` with exclusive access to the shared state.
    ///
    /// Changes made by `f` are written back even if it fails, since they may
    /// describe files it already created or renamed.
    pub fn with_lock<T>(
        &self,
        f: impl FnOnce(&mut StateHeader) -> JournalResult<T>,
    ) -> JournalResult<T> {
        let mut map = self.map.lock();
        let _lock = StateLock::acquire(&self.file)?;

        let mut header = StateHeader::decode(&map[..], &self.path)?;
        let before = header.clone();

        let result = f(&mut header);

        if header != before {
            header.encode(&mut &mut map[..]);
        }
        result
    }
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("path", &self.path)
            .field("guid", &self.guid)
            .finish()
    }
}

/// Returns true if a process with this id exists.
#[cfg(unix)]
pub(crate) fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Returns true if a process with this id exists.
#[cfg(not(unix))]
pub(crate) fn process_alive(_pid: u32) -> bool {
    true
}
