//! Primary-side replication configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::load_toml;
use crate::constants::{
    DEFAULT_ARCHIVE_TIMEOUT_SECS, DEFAULT_BUFFER_SIZE, DEFAULT_FILE_PREFIX,
    DEFAULT_SEGMENT_COUNT, DEFAULT_SEGMENT_SIZE, LAG_FACTOR, MIN_BUFFER_SIZE, MIN_SEGMENT_SIZE,
};
use crate::error::{ConfigError, ConfigResult};

/// Placeholder that expands to the archived copy's full path.
const ARCHIVE_PATH_PLACEHOLDER: &str = "$(archpathname)";

/// Replication settings of a primary database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationConfig {
    /// Size of a transaction's batch before it is flushed early.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Only tables whose name matches this pattern are replicated.
    #[serde(default)]
    pub include_filter: Option<String>,

    /// Tables whose name matches this pattern are never replicated.
    #[serde(default)]
    pub exclude_filter: Option<String>,

    /// Directory holding the journal segments. No journal when absent.
    #[serde(default)]
    pub journal_directory: Option<PathBuf>,

    /// Prefix of every journal file name.
    #[serde(default = "default_file_prefix")]
    pub journal_file_prefix: String,

    /// Size at which a segment is sealed.
    #[serde(default = "default_segment_size")]
    pub journal_segment_size: u64,

    /// Maximum number of segment files.
    #[serde(default = "default_segment_count")]
    pub journal_segment_count: usize,

    /// Delay used to batch durable flushes of concurrent writers (0 disables).
    #[serde(default)]
    pub journal_group_flush_delay_ms: u64,

    /// Directory that sealed segments are copied into.
    #[serde(default)]
    pub journal_archive_directory: Option<PathBuf>,

    /// Command run to archive a sealed segment.
    #[serde(default)]
    pub journal_archive_command: Option<String>,

    /// Age after which a segment holding data is sealed.
    #[serde(default = "default_archive_timeout")]
    pub journal_archive_timeout_secs: u64,

    /// Synchronous replicas, each `[user[:password]@]database`.
    #[serde(default)]
    pub sync_replicas: Vec<String>,

    /// Directory of the operational log (defaults to the journal directory).
    #[serde(default)]
    pub log_directory: Option<PathBuf>,

    /// Log verbose messages to the operational log.
    #[serde(default)]
    pub verbose_logging: bool,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_file_prefix() -> String {
    DEFAULT_FILE_PREFIX.to_string()
}

fn default_segment_size() -> u64 {
    DEFAULT_SEGMENT_SIZE
}

fn default_segment_count() -> usize {
    DEFAULT_SEGMENT_COUNT
}

fn default_archive_timeout() -> u64 {
    DEFAULT_ARCHIVE_TIMEOUT_SECS
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            include_filter: None,
            exclude_filter: None,
            journal_directory: None,
            journal_file_prefix: default_file_prefix(),
            journal_segment_size: default_segment_size(),
            journal_segment_count: default_segment_count(),
            journal_group_flush_delay_ms: 0,
            journal_archive_directory: None,
            journal_archive_command: None,
            journal_archive_timeout_secs: default_archive_timeout(),
            sync_replicas: Vec::new(),
            log_directory: None,
            verbose_logging: false,
        }
    }
}

impl ReplicationConfig {
    /// Loads configuration from a TOML file and validates it.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let config: Self = load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from a TOML string and validates it.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<string>"),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Converts configuration to a TOML string.
    pub fn to_toml(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::invalid("config", e.to_string()))
    }

    /// Returns true if anything is replicated at all.
    pub fn is_enabled(&self) -> bool {
        self.journal_directory.is_some() || !self.sync_replicas.is_empty()
    }

    /// Queued bytes above which every flush is drained synchronously.
    pub fn lag_threshold(&self) -> usize {
        self.buffer_size.saturating_mul(LAG_FACTOR)
    }

    /// Age after which a segment holding data is sealed.
    pub fn archive_timeout(&self) -> Duration {
        Duration::from_secs(self.journal_archive_timeout_secs)
    }

    /// Group flush delay.
    pub fn group_flush_delay(&self) -> Duration {
        Duration::from_millis(self.journal_group_flush_delay_ms)
    }

    /// Directory of the operational log.
    pub fn log_directory(&self) -> Option<&Path> {
        self.log_directory
            .as_deref()
            .or(self.journal_directory.as_deref())
    }

    /// Parses the synchronous replica list.
    pub fn replica_targets(&self) -> ConfigResult<Vec<ReplicaTarget>> {
        self.sync_replicas
            .iter()
            .map(|s| ReplicaTarget::parse(s))
            .collect()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::invalid(
                "buffer_size",
                format!("must be at least {} bytes", MIN_BUFFER_SIZE),
            ));
        }

        if self.journal_segment_size < MIN_SEGMENT_SIZE {
            return Err(ConfigError::invalid(
                "journal_segment_size",
                format!("must be at least {} bytes", MIN_SEGMENT_SIZE),
            ));
        }

        if self.journal_segment_count == 0 {
            return Err(ConfigError::invalid(
                "journal_segment_count",
                "must be positive",
            ));
        }

        if self.journal_archive_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "journal_archive_timeout_secs",
                "must be positive",
            ));
        }

        if self.journal_file_prefix.is_empty()
            || self
                .journal_file_prefix
                .contains(std::path::MAIN_SEPARATOR)
        {
            return Err(ConfigError::invalid(
                "journal_file_prefix",
                "must be a non-empty file name",
            ));
        }

        let archiving =
            self.journal_archive_directory.is_some() || self.journal_archive_command.is_some();
        if archiving && self.journal_directory.is_none() {
            return Err(ConfigError::conflict(
                "journal archiving is configured but journal_directory is not",
            ));
        }

        if let Some(command) = &self.journal_archive_command {
            if command.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "journal_archive_command",
                    "must not be empty",
                ));
            }
            if command.contains(ARCHIVE_PATH_PLACEHOLDER)
                && self.journal_archive_directory.is_none()
            {
                return Err(ConfigError::conflict(format!(
                    "journal_archive_command uses {} but journal_archive_directory is not set",
                    ARCHIVE_PATH_PLACEHOLDER
                )));
            }
        }

        if let (Some(journal), Some(archive)) =
            (&self.journal_directory, &self.journal_archive_directory)
        {
            if journal == archive {
                return Err(ConfigError::conflict(
                    "journal_archive_directory must differ from journal_directory",
                ));
            }
        }

        self.replica_targets()?;

        Ok(())
    }
}

/// A synchronous replica connection target.
#[derive(Clone, PartialEq, Eq)]
pub struct ReplicaTarget {
    /// Database the replica connection attaches to.
    pub database: String,
    /// Embedded user name.
    pub user: Option<String>,
    /// Embedded password.
    pub password: Option<String>,
}

impl ReplicaTarget {
    /// Parses `[user[:password]@]database`.
    pub fn parse(target: &str) -> ConfigResult<Self> {
        let target = target.trim();
        let (credentials, database) = match target.rsplit_once('@') {
            Some((credentials, database)) => (Some(credentials), database),
            None => (None, target),
        };

        if database.is_empty() {
            return Err(ConfigError::invalid(
                "sync_replicas",
                format!("missing database in '{}'", target),
            ));
        }

        let (user, password) = match credentials {
            None => (None, None),
            Some(credentials) => match credentials.split_once(':') {
                Some((user, password)) => (Some(user), Some(password.to_string())),
                None => (Some(credentials), None),
            },
        };

        if user.map_or(false, str::is_empty) {
            return Err(ConfigError::invalid(
                "sync_replicas",
                format!("empty user name in target for '{}'", database),
            ));
        }

        Ok(Self {
            database: database.to_string(),
            user: user.map(str::to_string),
            password,
        })
    }
}

impl fmt::Debug for ReplicaTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaTarget")
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl fmt::Display for ReplicaTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{}@{}", user, self.database),
            None => write!(f, "{}", self.database),
        }
    }
}
