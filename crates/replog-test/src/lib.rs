//! # replog-test
//!
//! End-to-end tests for replog.
//!
//! This crate contains:
//! - A primary harness: replicator, dispatcher and journal archiving into a
//!   directory
//! - A capturing live replica connection
//! - Replica-side helpers to replay archived segments into memory

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use replog_apply::{ApplyEngine, ApplyResult, MemoryApplier, PassOutcome};
use replog_common::config::ApplyTargetConfig;
use replog_common::constants::MIN_SEGMENT_SIZE;
use replog_common::{OperationalLog, Shutdown, TxnId};
use replog_encoder::{
    DispatchConfig, Manager, NoBlobs, Record, ReplicaConnection, Replicator, ReplicatorResult,
    TableFilter,
};
use replog_journal::config::parse_segment_file_name;
use replog_journal::{Block, ChangeLog, JournalConfig, Operation};

/// Buffer size that makes a [`big_record`] flush on its own.
pub const SMALL_BUFFER: usize = 16 * 1024;

/// Record size of which only one fits into a minimum-size segment.
pub const BIG_RECORD: usize = 40 * 1024;

/// Live replica connection that keeps every block it receives.
#[derive(Debug, Clone, Default)]
pub struct CaptureReplica {
    blocks: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl CaptureReplica {
    /// Creates an empty capture.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of blocks received.
    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Returns true if nothing was received.
    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    /// Decodes the received blocks.
    pub fn blocks(&self) -> Vec<Block> {
        self.blocks
            .lock()
            .iter()
            .filter_map(|bytes| Block::decode(bytes, 0).ok())
            .collect()
    }
}

impl ReplicaConnection for CaptureReplica {
    fn name(&self) -> &str {
        "capture"
    }

    fn replicate(&mut self, block: &[u8]) -> ReplicatorResult<()> {
        self.blocks.lock().push(block.to_vec());
        Ok(())
    }
}

/// A primary database's replication stack.
///
/// Segments are archived into `<dir>/archive` when the primary shuts down.
/// The writer and archiver threads are off so tests decide when blocks move.
pub struct Primary {
    /// The journal.
    pub journal: Arc<ChangeLog>,
    /// The replicator sessions start transactions from.
    pub replicator: Replicator,
    /// The live replica.
    pub capture: CaptureReplica,
    archive_dir: PathBuf,
}

impl Primary {
    /// Opens a primary under `dir` with minimum-size segments.
    pub fn open(dir: &Path, dispatch: DispatchConfig) -> ReplicatorResult<Self> {
        let archive_dir = dir.join("archive");
        let config = JournalConfig::new(dir.join("journal"))
            .with_archive_dir(&archive_dir)
            .with_segment_size(MIN_SEGMENT_SIZE)
            .with_archive_timeout(Duration::from_secs(3600))
            .with_background_archiver(false);

        let oplog = Arc::new(OperationalLog::new(Some(dir), "primary.db", true));
        let journal = ChangeLog::open(config, Arc::clone(&oplog))?;

        let capture = CaptureReplica::new();
        let manager = Manager::new(
            dispatch.with_background_writer(false),
            Some(Arc::clone(&journal)),
            vec![Box::new(capture.clone())],
            oplog,
        )?;
        let replicator = Replicator::new(manager, Arc::new(TableFilter::allow_all()), Arc::new(NoBlobs));

        Ok(Self {
            journal,
            replicator,
            capture,
            archive_dir,
        })
    }

    /// Opens a primary whose transactions flush after every big record.
    pub fn open_small(dir: &Path) -> ReplicatorResult<Self> {
        Self::open(dir, DispatchConfig::new(SMALL_BUFFER))
    }

    /// Returns where sealed segments are archived.
    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Returns the file name of a segment.
    pub fn segment_file_name(&self, sequence: u64) -> String {
        self.journal.config().segment_file_name(sequence)
    }

    /// Drains the dispatcher and detaches from the journal, archiving every
    /// segment holding data.
    pub fn shutdown(&self) -> ReplicatorResult<()> {
        self.replicator.manager().shutdown()
    }
}

/// A record filled with `fill`.
pub fn record(fill: u8, len: usize) -> Record {
    Record::new(vec![fill; len])
}

/// A record that overflows [`SMALL_BUFFER`].
pub fn big_record(fill: u8) -> Record {
    record(fill, BIG_RECORD)
}

/// A small record holding `text`.
pub fn text_record(text: &str) -> Record {
    Record::new(text.as_bytes().to_vec())
}

/// Apply settings replaying `source` with control files in `control`.
pub fn apply_target(source: &Path, control: &Path) -> ApplyTargetConfig {
    let mut target = ApplyTargetConfig::new("replica.db", source);
    target.control_directory = Some(control.to_path_buf());
    target
}

/// An apply engine over an in-memory replica.
pub fn replica_engine(source: &Path, control: &Path, replica: MemoryApplier) -> ApplyEngine<MemoryApplier> {
    ApplyEngine::new(
        apply_target(source, control),
        replica,
        Arc::new(OperationalLog::tracing_only("replica.db")),
        Arc::new(Shutdown::new()),
    )
}

/// Runs passes until one finds nothing new. Gives up after `max_passes`.
pub fn replay_until_idle(engine: &mut ApplyEngine<MemoryApplier>, max_passes: usize) -> ApplyResult<usize> {
    for pass in 1..=max_passes {
        if engine.run_pass()? == PassOutcome::Idle {
            return Ok(pass);
        }
    }
    Ok(max_passes)
}

/// Record images inserted on the replica, in commit order.
pub fn inserted(replica: &MemoryApplier) -> Vec<Bytes> {
    replica
        .committed()
        .iter()
        .filter_map(|(_, op)| match op {
            Operation::InsertRecord { record, .. } => Some(record.clone()),
            _ => None,
        })
        .collect()
}

/// Record images one transaction inserted on the replica.
pub fn inserted_by(replica: &MemoryApplier, txn_id: TxnId) -> Vec<Bytes> {
    replica
        .committed_by(txn_id)
        .into_iter()
        .filter_map(|op| match op {
            Operation::InsertRecord { record, .. } => Some(record.clone()),
            _ => None,
        })
        .collect()
}

/// Sequences of the segment files in `dir`, sorted.
pub fn segment_sequences(dir: &Path) -> io::Result<Vec<u64>> {
    let mut sequences = Vec::new();
    for entry in fs::read_dir(dir)? {
        if let Some(sequence) = parse_segment_file_name(&entry?.path()) {
            sequences.push(sequence);
        }
    }
    sequences.sort_unstable();
    Ok(sequences)
}

/// Copies every file of `from` into `to`. Returns the number copied.
pub fn copy_dir(from: &Path, to: &Path) -> io::Result<usize> {
    fs::create_dir_all(to)?;
    let mut copied = 0;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::copy(entry.path(), to.join(entry.file_name()))?;
            copied += 1;
        }
    }
    Ok(copied)
}
