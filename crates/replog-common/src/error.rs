//! Configuration error types.
//!
//! Configuration problems are fatal at load time: a primary or replica refuses
//! to start with malformed or conflicting settings.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for configuration loading and validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read configuration file {path}: {source}")]
    Read {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid TOML or has unexpected fields.
    #[error("cannot parse configuration file {path}: {reason}")]
    Parse {
        /// Path of the configuration file.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },

    /// A single option has an invalid value.
    #[error("invalid value for {option}: {reason}")]
    InvalidValue {
        /// Option name as it appears in the file.
        option: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// Two options contradict each other.
    #[error("conflicting options: {reason}")]
    Conflict {
        /// Description of the conflict.
        reason: String,
    },
}

impl ConfigError {
    /// Creates an invalid value error.
    pub fn invalid(option: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            option,
            reason: reason.into(),
        }
    }

    /// Creates a conflict error.
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::invalid("journal_segment_size", "must be at least 64 KB");
        let msg = err.to_string();
        assert!(msg.contains("journal_segment_size"));
        assert!(msg.contains("64 KB"));

        let err = ConfigError::conflict("archive command and directory");
        assert!(err.to_string().starts_with("conflicting options"));
    }
}
