//! # replog-apply
//!
//! Replica-side replay of journal segments.
//!
//! An [`ApplyEngine`] watches the directory segments are archived to and
//! replays them into an [`Applier`] exactly once. Progress and the set of
//! transactions still open are checkpointed in a [`ControlFile`] after every
//! block, so the engine can be killed at any point and restarted.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use replog_apply::{ApplyEngine, MemoryApplier};
//! use replog_common::config::ApplyTargetConfig;
//! use replog_common::{OperationalLog, Shutdown};
//!
//! let target = ApplyTargetConfig::new("replica.db", "/var/lib/replog/archive");
//! let oplog = Arc::new(OperationalLog::tracing_only("replica.db"));
//! let mut engine = ApplyEngine::new(target, MemoryApplier::new(), oplog, Arc::new(Shutdown::new()));
//! engine.run_pass().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod applier;
pub mod control;
pub mod dump;
pub mod engine;
pub mod error;

pub use applier::{Applier, MemoryApplier};
pub use control::{ActiveTransaction, ControlFile, ControlState};
pub use dump::DumpApplier;
pub use engine::{ApplyEngine, ApplyStats, PassOutcome};
pub use error::{ApplyError, ApplyResult};
