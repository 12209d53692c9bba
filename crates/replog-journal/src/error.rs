//! Journal error types.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors that can occur during journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// I/O error during journal operations.
    #[error("journal I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Invalid signature in a segment, state or control file.
    #[error("invalid signature in {path}")]
    InvalidSignature { path: PathBuf },

    /// Unsupported format version.
    #[error("unsupported format version in {path}: expected {expected}, found {found}")]
    UnsupportedVersion {
        path: PathBuf,
        expected: u16,
        found: u16,
    },

    /// A segment file is corrupted.
    #[error("segment {path} corrupted: {reason}")]
    SegmentCorrupted { path: PathBuf, reason: String },

    /// Block checksum mismatch.
    #[error("block checksum mismatch at offset {offset}: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        offset: u64,
        expected: u32,
        computed: u32,
    },

    /// The shared journal state is unusable.
    #[error("journal state corrupted: {reason}")]
    StateCorrupted { reason: String },

    /// A block or operation could not be decoded.
    #[error("failed to decode journal data: {reason}")]
    Decode { reason: String },

    /// A block can never fit into a segment.
    #[error("block too large: {size} bytes exceeds maximum {max} bytes")]
    BlockTooLarge { size: u64, max: u64 },

    /// No segment became available within the retry budget.
    #[error("no journal segment available after {attempts} attempts")]
    NoCapacity { attempts: u32 },

    /// Archiving a sealed segment failed.
    #[error("cannot archive segment {path}: {reason}")]
    ArchiveFailed { path: PathBuf, reason: String },

    /// The shared process registry is full.
    #[error("too many processes attached to the journal (maximum {max})")]
    TooManyProcesses { max: usize },

    /// The journal is closed.
    #[error("journal is closed")]
    Closed,

    /// Configuration error.
    #[error("journal configuration error: {reason}")]
    Config { reason: String },
}

impl JournalError {
    /// Creates a segment corrupted error.
    pub fn segment_corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::SegmentCorrupted {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a state corrupted error.
    pub fn state_corrupted(reason: impl Into<String>) -> Self {
        Self::StateCorrupted {
            reason: reason.into(),
        }
    }

    /// Creates a decode error.
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    /// Creates an archive failure.
    pub fn archive_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ArchiveFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a config error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Returns true if the operation may succeed when retried later.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ArchiveFailed { .. } | Self::NoCapacity { .. })
    }

    /// Returns true if this is a corruption error.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::SegmentCorrupted { .. }
                | Self::ChecksumMismatch { .. }
                | Self::InvalidSignature { .. }
                | Self::UnsupportedVersion { .. }
                | Self::StateCorrupted { .. }
                | Self::Decode { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = JournalError::segment_corrupted("/j/db.journal-000000001", "bad header");
        assert!(err.is_corruption());
        assert!(!err.is_recoverable());

        let err = JournalError::archive_failed("/j/db.journal-000000001", "exit status 1");
        assert!(err.is_recoverable());
        assert!(!err.is_corruption());

        let err = JournalError::ChecksumMismatch {
            offset: 44,
            expected: 1,
            computed: 2,
        };
        assert!(err.is_corruption());
    }

    #[test]
    fn test_error_display() {
        let err = JournalError::BlockTooLarge {
            size: 100_000_000,
            max: 16_777_172,
        };
        let msg = err.to_string();
        assert!(msg.contains("100000000"));
        assert!(msg.contains("16777172"));

        let err = JournalError::NoCapacity { attempts: 60 };
        assert!(err.to_string().contains("60 attempts"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: JournalError = io_err.into();
        assert!(matches!(err, JournalError::Io { .. }));
    }
}
