//! Configuration for replog.
//!
//! The primary side reads a [`ReplicationConfig`]; each replica host reads an
//! [`ApplyConfig`] listing its apply targets. Both are TOML documents.

mod apply;
mod replication;

pub use apply::{ApplyConfig, ApplyTargetConfig};
pub use replication::{ReplicaTarget, ReplicationConfig};

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::{ConfigError, ConfigResult};

/// Reads and parses a TOML configuration file.
pub(crate) fn load_toml<T: DeserializeOwned>(path: &Path) -> ConfigResult<T> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
