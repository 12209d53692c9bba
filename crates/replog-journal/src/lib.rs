//! # replog-journal
//!
//! Durable change journal for replog.
//!
//! The journal is a directory of fixed-budget segment files shared by every
//! process attached to the same primary database. Exactly one segment is
//! `USED` at a time; sealed segments are archived by a background thread and
//! then recycled under a new sequence number.
//!
//! # Segment Format
//!
//! Each segment starts with a fixed header followed by blocks. A block holds
//! the operations of one transaction and a table of the names they refer to:
//!
//! ```text
//! +-----------+----------+---------+---------+--------+-------+-----------+----------+
//! | TxnId (8) | Proto(4) | Data(4) | Meta(4) | Flg(4) | Ts(8) | Crc32 (4) | Payload  |
//! +-----------+----------+---------+---------+--------+-------+-----------+----------+
//! |                  Operations (Data bytes) | Name table (Meta bytes)              |
//! +---------------------------------------------------------------------------------+
//! ```
//!
//! All integers are little-endian with no padding.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod archive;
pub mod config;
mod error;
mod group_flush;
mod shared;

/// Block and operation encoding.
pub mod record;

/// Segment files.
pub mod segment;

/// Sequential block reader for replay.
pub mod reader;

/// The journal manager.
pub mod journal;

pub use archive::expand_archive_command;
pub use config::JournalConfig;
pub use error::{JournalError, JournalResult};
pub use journal::{ChangeLog, JournalStats};
pub use reader::SegmentReader;
pub use record::{
    encode_block_into, BlobId, Block, BlockFlags, BlockHeader, OpTag, OpWriter, Operation,
};
pub use segment::{SegmentHeader, SegmentState};
pub use shared::StateHeader;
