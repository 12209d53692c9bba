//! # replog-encoder
//!
//! Primary-side capture of replicated changes.
//!
//! The engine reports every change of a transaction to a [`Transaction`]
//! opened from the attachment's [`Replicator`]. Changes are encoded into
//! blocks and handed to the [`Manager`], which writes them to the journal and
//! forwards them to directly attached replicas.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use replog_common::{OperationalLog, TxnId};
//! use replog_encoder::{DispatchConfig, Manager, NoBlobs, Record, Replicator, TableFilter};
//!
//! let oplog = Arc::new(OperationalLog::tracing_only("employees"));
//! let manager = Manager::new(DispatchConfig::default(), None, Vec::new(), oplog).unwrap();
//! let replicator = Replicator::new(manager, Arc::new(TableFilter::allow_all()), Arc::new(NoBlobs));
//!
//! let mut txn = replicator.start_transaction(TxnId::new(1));
//! txn.insert("EMPLOYEE", &Record::new(&b"encoded row"[..])).unwrap();
//! txn.commit().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod replicator;

pub use batch::{Batch, NameDictionary};
pub use dispatch::{BufferPool, DispatchConfig, DispatchStats, FlushMode, Manager, ReplicaConnection};
pub use error::{ReplicatorError, ReplicatorResult};
pub use filter::TableFilter;
pub use replicator::{
    BlobStore, NoBlobs, Record, Replicator, SessionStatus, Transaction, CHARSET_NONE,
};
