//! Apply error types.

use std::io;
use std::path::PathBuf;

use replog_common::ConfigError;
use replog_journal::JournalError;
use thiserror::Error;

/// Result type for apply operations.
pub type ApplyResult<T> = Result<T, ApplyError>;

/// Errors that stop an apply pass.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// A segment could not be read or decoded.
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid apply settings.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A control file failed validation.
    #[error("control file {path} corrupted: {reason}")]
    ControlCorrupted { path: PathBuf, reason: String },

    /// Another engine is replaying to the same target.
    #[error("control file {path} is locked by another apply engine")]
    ControlLocked { path: PathBuf },

    /// A checkpoint would move backwards.
    #[error("checkpoint cannot move back from {from:?} to {to:?}")]
    ControlRegressed { from: (u64, u64), to: (u64, u64) },

    /// The next segment to replay is missing.
    #[error("segment {expected} is missing, found segment {found}")]
    SequenceGap { expected: u64, found: u64 },

    /// The replica rejected a block.
    #[error("replica failed to apply block: {reason}")]
    Applier { reason: String },
}

impl ApplyError {
    /// Creates a control file corrupted error.
    pub fn control_corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ControlCorrupted {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a replica error.
    pub fn applier(reason: impl Into<String>) -> Self {
        Self::Applier {
            reason: reason.into(),
        }
    }

    /// Returns true if on-disk data failed validation.
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::Journal(e) => e.is_corruption(),
            Self::ControlCorrupted { .. } | Self::SequenceGap { .. } => true,
            _ => false,
        }
    }

    /// Returns true if the replica rejected a block.
    pub fn is_applier(&self) -> bool {
        matches!(self, Self::Applier { .. })
    }
}
