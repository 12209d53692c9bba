//! Segment file header.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use bytes::{Buf, BufMut};
use uuid::Uuid;

use crate::error::{JournalError, JournalResult};

/// Signature at the start of every segment file.
pub const SEGMENT_SIGNATURE: [u8; 8] = *b"RPLGSEG\0";

/// Current segment format version.
pub const SEGMENT_FORMAT_VERSION: u16 = 2;

/// Lifecycle state of a segment.
///
/// `Free -> Used -> Full -> Arch -> Free`, falling back from `Arch` to
/// `Full` when archiving fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SegmentState {
    /// Holds no data that is still needed.
    Free = 0,
    /// Open for writing.
    Used = 1,
    /// Sealed and waiting to be archived.
    Full = 2,
    /// Being archived.
    Arch = 3,
}

impl SegmentState {
    /// Converts the state to a u16.
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Creates a state from a u16.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Free),
            1 => Some(Self::Used),
            2 => Some(Self::Full),
            3 => Some(Self::Arch),
            _ => None,
        }
    }
}

/// Segment header (44 bytes).
///
/// Layout:
/// - signature: 8 bytes
/// - version: 2 bytes
/// - state: 2 bytes
/// - guid: 16 bytes (journal instance)
/// - sequence: 8 bytes
/// - length: 8 bytes (logical length including this header)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Lifecycle state.
    pub state: SegmentState,
    /// Journal instance the segment belongs to.
    pub guid: Uuid,
    /// Position of the segment in the journal.
    pub sequence: u64,
    /// Logical length of the segment, header included.
    pub length: u64,
}

impl SegmentHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 44;

    /// Creates the header of an empty segment.
    pub fn new(guid: Uuid, sequence: u64, state: SegmentState) -> Self {
        Self {
            state,
            guid,
            sequence,
            length: Self::SIZE as u64,
        }
    }

    /// Returns true if any block was written after the header.
    pub fn has_data(&self) -> bool {
        self.length > Self::SIZE as u64
    }

    /// Serializes the header.
    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_slice(&SEGMENT_SIGNATURE);
        buf.put_u16_le(SEGMENT_FORMAT_VERSION);
        buf.put_u16_le(self.state.as_u16());
        buf.put_slice(self.guid.as_bytes());
        buf.put_u64_le(self.sequence);
        buf.put_u64_le(self.length);
    }

    /// Serializes the header to a byte array.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut cursor = &mut buf[..];
        self.serialize(&mut cursor);
        buf
    }

    /// Deserializes and validates a header read from `path`.
    pub fn from_bytes(bytes: &[u8], path: &Path) -> JournalResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(JournalError::segment_corrupted(
                path,
                format!("file is smaller than the {} byte header", Self::SIZE),
            ));
        }

        let mut buf = bytes;
        let mut signature = [0u8; 8];
        buf.copy_to_slice(&mut signature);
        if signature != SEGMENT_SIGNATURE {
            return Err(JournalError::InvalidSignature {
                path: path.to_path_buf(),
            });
        }

        let version = buf.get_u16_le();
        if version != SEGMENT_FORMAT_VERSION {
            return Err(JournalError::UnsupportedVersion {
                path: path.to_path_buf(),
                expected: SEGMENT_FORMAT_VERSION,
                found: version,
            });
        }

        let raw_state = buf.get_u16_le();
        let state = SegmentState::from_u16(raw_state).ok_or_else(|| {
            JournalError::segment_corrupted(path, format!("unknown state {}", raw_state))
        })?;

        let mut guid = [0u8; 16];
        buf.copy_to_slice(&mut guid);
        let sequence = buf.get_u64_le();
        let length = buf.get_u64_le();

        if length < Self::SIZE as u64 {
            return Err(JournalError::segment_corrupted(
                path,
                format!("length {} is shorter than the header", length),
            ));
        }

        Ok(Self {
            state,
            guid: Uuid::from_bytes(guid),
            sequence,
            length,
        })
    }

    /// Reads and validates the header of a segment file.
    pub fn read_from(path: &Path) -> JournalResult<Self> {
        let mut file = File::open(path)?;
        Self::read_from_file(&mut file, path)
    }

    pub(crate) fn read_from_file(file: &mut impl Read, path: &Path) -> JournalResult<Self> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        file.take(Self::SIZE as u64).read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn path() -> PathBuf {
        PathBuf::from("/j/db.journal-000000001")
    }

    #[test]
    fn test_header_size() {
        let header = SegmentHeader::new(Uuid::new_v4(), 1, SegmentState::Used);
        assert_eq!(header.to_bytes().len(), SegmentHeader::SIZE);
        assert!(!header.has_data());
    }

    #[test]
    fn test_header_roundtrip() {
        let mut header = SegmentHeader::new(Uuid::new_v4(), 12, SegmentState::Full);
        header.length = 4096;

        let decoded = SegmentHeader::from_bytes(&header.to_bytes(), &path()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.has_data());
    }

    #[test]
    fn test_header_validation() {
        let header = SegmentHeader::new(Uuid::new_v4(), 1, SegmentState::Used);

        let mut bytes = header.to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            SegmentHeader::from_bytes(&bytes, &path()),
            Err(JournalError::InvalidSignature { .. })
        ));

        let mut bytes = header.to_bytes();
        bytes[8] = 1;
        assert!(matches!(
            SegmentHeader::from_bytes(&bytes, &path()),
            Err(JournalError::UnsupportedVersion { found: 1, .. })
        ));

        let mut bytes = header.to_bytes();
        bytes[10] = 9;
        assert!(SegmentHeader::from_bytes(&bytes, &path()).is_err());

        let bytes = header.to_bytes();
        assert!(SegmentHeader::from_bytes(&bytes[..20], &path()).is_err());
    }

    #[test]
    fn test_state_values() {
        for state in [
            SegmentState::Free,
            SegmentState::Used,
            SegmentState::Full,
            SegmentState::Arch,
        ] {
            assert_eq!(SegmentState::from_u16(state.as_u16()), Some(state));
        }
        assert_eq!(SegmentState::from_u16(4), None);
    }
}
