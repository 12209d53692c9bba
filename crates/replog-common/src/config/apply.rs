//! Replica-side apply configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::load_toml;
use crate::constants::{DEFAULT_APPLY_ERROR_TIMEOUT_SECS, DEFAULT_APPLY_IDLE_TIMEOUT_SECS};
use crate::error::{ConfigError, ConfigResult};

/// Configuration of a replica host running one apply engine per target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplyConfig {
    /// Directory of the operational log.
    #[serde(default)]
    pub log_directory: Option<PathBuf>,

    /// Log verbose messages to the operational log.
    #[serde(default)]
    pub verbose_logging: bool,

    /// Apply targets.
    #[serde(default, rename = "target")]
    pub targets: Vec<ApplyTargetConfig>,
}

/// One replica database fed from one journal source directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplyTargetConfig {
    /// Replica database identity.
    pub database: String,

    /// Directory the primary archives its segments into.
    pub journal_source_directory: PathBuf,

    /// Only segments of this journal instance are applied.
    #[serde(default)]
    pub source_guid: Option<Uuid>,

    /// Directory holding the control files (defaults to the source directory).
    #[serde(default)]
    pub control_directory: Option<PathBuf>,

    /// File that decoded operations are written to by the dump applier.
    #[serde(default)]
    pub dump_file: Option<PathBuf>,

    /// Pause between passes when there was nothing to do.
    #[serde(default = "default_idle_timeout")]
    pub apply_idle_timeout_secs: u64,

    /// Pause between passes after an error.
    #[serde(default = "default_error_timeout")]
    pub apply_error_timeout_secs: u64,
}

fn default_idle_timeout() -> u64 {
    DEFAULT_APPLY_IDLE_TIMEOUT_SECS
}

fn default_error_timeout() -> u64 {
    DEFAULT_APPLY_ERROR_TIMEOUT_SECS
}

impl ApplyTargetConfig {
    /// Creates a target with default timeouts.
    pub fn new(database: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            database: database.into(),
            journal_source_directory: source.into(),
            source_guid: None,
            control_directory: None,
            dump_file: None,
            apply_idle_timeout_secs: default_idle_timeout(),
            apply_error_timeout_secs: default_error_timeout(),
        }
    }

    /// Directory holding the control files.
    pub fn control_directory(&self) -> &Path {
        self.control_directory
            .as_deref()
            .unwrap_or(&self.journal_source_directory)
    }

    /// Pause between passes when there was nothing to do.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_idle_timeout_secs)
    }

    /// Pause between passes after an error.
    pub fn error_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_error_timeout_secs)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.database.trim().is_empty() {
            return Err(ConfigError::invalid("database", "must not be empty"));
        }
        if self.journal_source_directory.as_os_str().is_empty() {
            return Err(ConfigError::invalid(
                "journal_source_directory",
                format!("must not be empty (target {})", self.database),
            ));
        }
        if self.apply_idle_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "apply_idle_timeout_secs",
                "must be positive",
            ));
        }
        if self.apply_error_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "apply_error_timeout_secs",
                "must be positive",
            ));
        }
        Ok(())
    }
}

impl ApplyConfig {
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

    /// Validates the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        for target in &self.targets {
            target.validate()?;
        }

        for (i, target) in self.targets.iter().enumerate() {
            let duplicate = self.targets[..i].iter().any(|other| {
                other.database == target.database
                    && other.journal_source_directory == target.journal_source_directory
            });
            if duplicate {
                return Err(ConfigError::conflict(format!(
                    "target {} is configured twice for the same source directory",
                    target.database
                )));
            }
        }

        Ok(())
    }
}
