//! Operational replication log.
//!
//! Every replication warning and error, on both the primary and the replica
//! side, is appended to a shared text file. Several processes may write to
//! the same file, so each append happens under an exclusive file lock.
//!
//! Entries are mirrored to `tracing`. Identical error messages are written to
//! the file only once per process to keep a failing retry loop from flooding
//! the log.

use std::collections::HashSet;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use parking_lot::Mutex;

use crate::constants::OPERATIONAL_LOG_FILE;

/// Which side of replication produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogSide {
    /// The primary database (encoder, dispatch, journal).
    Primary,
    /// A replica (apply engine).
    Replica,
}

impl fmt::Display for LogSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Replica => write!(f, "replica"),
        }
    }
}

/// Severity of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Progress details, only written when verbose logging is enabled.
    Verbose,
    /// Something went wrong but was handled.
    Warning,
    /// An operation failed.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verbose => write!(f, "VERBOSE"),
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Shared operational log.
///
/// Constructed once at startup and handed out as `Arc<OperationalLog>`.
pub struct OperationalLog {
    /// Log file path, `None` to log through `tracing` only.
    path: Option<PathBuf>,
    /// Database the entries refer to.
    database: String,
    /// Whether verbose entries are written.
    verbose: bool,
    /// Error messages already written by this process.
    reported: Mutex<HashSet<String>>,
    /// Serializes appends from threads of this process.
    append_lock: Mutex<()>,
}

impl OperationalLog {
    /// Creates a log writing to `replication.log` inside `dir`.
    pub fn new(dir: Option<&Path>, database: impl Into<String>, verbose: bool) -> Self {
        Self {
            path: dir.map(|d| d.join(OPERATIONAL_LOG_FILE)),
            database: database.into(),
            verbose,
            reported: Mutex::new(HashSet::new()),
            append_lock: Mutex::new(()),
        }
    }

    /// Creates a log that only emits `tracing` events.
    pub fn tracing_only(database: impl Into<String>) -> Self {
        Self::new(None, database, false)
    }

    /// Returns the log file path.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns true if verbose entries are written.
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Logs a verbose entry.
    pub fn verbose(&self, side: LogSide, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::debug!(side = %side, database = %self.database, "{}", message);
        if self.verbose {
            self.append(side, Severity::Verbose, message);
        }
    }

    /// Logs a warning.
    pub fn warning(&self, side: LogSide, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::warn!(side = %side, database = %self.database, "{}", message);
        self.append(side, Severity::Warning, message);
    }

    /// Logs an error unless this process already logged the same message.
    ///
    /// Returns true if the entry was written.
    pub fn error(&self, side: LogSide, message: impl AsRef<str>) -> bool {
        let message = message.as_ref();
        if !self.reported.lock().insert(message.to_string()) {
            tracing::debug!(side = %side, database = %self.database, "repeated error suppressed: {}", message);
            return false;
        }
        tracing::error!(side = %side, database = %self.database, "{}", message);
        self.append(side, Severity::Error, message);
        true
    }

    /// Forgets reported errors so they are written again on recurrence.
    pub fn reset_reported(&self) {
        self.reported.lock().clear();
    }

    fn append(&self, side: LogSide, severity: Severity, message: &str) {
        let Some(path) = &self.path else {
            return;
        };

        let line = format!(
            "{} {:<7} {} {}: {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            side,
            self.database,
            severity,
            message
        );

        let _guard = self.append_lock.lock();
        if let Err(e) = Self::append_line(path, &line) {
            tracing::warn!("cannot write operational log {}: {}", path.display(), e);
        }
    }

    fn append_line(path: &Path, line: &str) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.lock_exclusive()?;
        let result = file.write_all(line.as_bytes()).and_then(|_| file.flush());
        let _ = file.unlock();
        result
    }
}

impl fmt::Debug for OperationalLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationalLog")
            .field("path", &self.path)
            .field("database", &self.database)
            .field("verbose", &self.verbose)
            .finish()
    }
}
