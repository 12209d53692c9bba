//! # replog-common
//!
//! Common types, configuration and utilities for the replog replication
//! subsystem.
//!
//! This crate provides the foundational pieces shared by the primary-side
//! crates (`replog-journal`, `replog-encoder`) and the replica-side crate
//! (`replog-apply`):
//!
//! - **Types**: transaction identifiers and sequence helpers
//! - **Config**: primary-side [`ReplicationConfig`] and replica-side [`ApplyConfig`]
//! - **Operational log**: the shared, lock-protected replication log file
//! - **Shutdown / Wakeup**: cancellation token and wake signals for background threads
//! - **Retry**: fixed-interval retry policy with an injectable sleeper
//!
//! ## Example
//!
//! ```rust
//! use replog_common::config::ReplicationConfig;
//! use replog_common::types::TxnId;
//!
//! let config = ReplicationConfig::default();
//! assert!(config.validate().is_ok());
//! assert!(TxnId::new(7).is_valid());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod constants;
pub mod error;
pub mod oplog;
pub mod retry;
pub mod shutdown;
pub mod types;

pub use config::{ApplyConfig, ApplyTargetConfig, ReplicaTarget, ReplicationConfig};
pub use error::{ConfigError, ConfigResult};
pub use oplog::{LogSide, OperationalLog, Severity};
pub use retry::{RetryPolicy, Sleeper, ThreadSleeper};
pub use shutdown::{Shutdown, Wakeup};
pub use types::TxnId;
