//! Encoder and dispatch error types.

use std::io;

use replog_common::types::TxnId;
use replog_common::ConfigError;
use replog_journal::{BlobId, JournalError};
use thiserror::Error;

/// Result type for encoder and dispatch operations.
pub type ReplicatorResult<T> = Result<T, ReplicatorError>;

/// Errors surfaced to the engine by the replication producer side.
#[derive(Debug, Error)]
pub enum ReplicatorError {
    /// Writing to the journal failed.
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    /// Invalid replication settings.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error outside the journal.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A blob referenced by a record could not be read.
    #[error("cannot read blob {blob}: {reason}")]
    BlobRead { blob: BlobId, reason: String },

    /// A live replica rejected a block.
    #[error("replica {name} failed: {reason}")]
    Replica { name: String, reason: String },

    /// An earlier call on the transaction failed.
    #[error("transaction {txn_id} is unusable after an earlier replication error")]
    Poisoned { txn_id: TxnId },

    /// The dispatcher no longer accepts blocks.
    #[error("replication is shutting down")]
    ShuttingDown,
}

impl ReplicatorError {
    /// Creates a blob read error.
    pub fn blob_read(blob: BlobId, reason: impl Into<String>) -> Self {
        Self::BlobRead {
            blob,
            reason: reason.into(),
        }
    }

    /// Creates a replica delivery error.
    pub fn replica(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Replica {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if a live replica rejected a block.
    pub fn is_delivery(&self) -> bool {
        matches!(self, Self::Replica { .. })
    }

    /// Returns true if the journal ran out of segment capacity.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Journal(JournalError::NoCapacity { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifiers() {
        let err = ReplicatorError::replica("replica1", "connection lost");
        assert!(err.is_delivery());
        assert!(!err.is_capacity());
        assert_eq!(err.to_string(), "replica replica1 failed: connection lost");

        let err: ReplicatorError = JournalError::NoCapacity { attempts: 61 }.into();
        assert!(err.is_capacity());
        assert!(!err.is_delivery());
    }

    #[test]
    fn test_messages() {
        let err = ReplicatorError::blob_read(BlobId::new(12, 7), "gone");
        assert_eq!(err.to_string(), "cannot read blob 12:7: gone");

        let err = ReplicatorError::Poisoned {
            txn_id: TxnId::new(9),
        };
        assert!(err.to_string().contains("transaction 9"));
    }
}
