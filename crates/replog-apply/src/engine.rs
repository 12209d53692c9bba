//! Replay of journal segments against a replica.
//!
//! Each pass scans the source directory, drops segments the replica no
//! longer needs and replays the rest in sequence order. Progress is
//! checkpointed after every block so a restarted engine resumes where the
//! previous one stopped without applying anything twice.
//!
//! A segment is replayed from its start while a transaction begun in it (or
//! earlier) is still open; blocks before the checkpoint are then only applied
//! for those open transactions, since everything else there is already in
//! the replica.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use replog_common::config::ApplyTargetConfig;
use replog_common::{LogSide, OperationalLog, Shutdown};
use replog_journal::config::parse_segment_file_name;
use replog_journal::{SegmentHeader, SegmentReader, SegmentState};

use crate::applier::Applier;
use crate::control::{ControlFile, ControlState};
use crate::error::{ApplyError, ApplyResult};

/// Result of one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Nothing new was replayed.
    Idle,
    /// New blocks were replayed or segments completed.
    Progress {
        /// Blocks applied past the previous checkpoint.
        blocks: u64,
        /// Segments completely replayed.
        segments: u64,
    },
}

/// Apply statistics.
#[derive(Debug, Clone, Default)]
pub struct ApplyStats {
    /// Passes run.
    pub passes: u64,
    /// Passes that failed.
    pub failed_passes: u64,
    /// Blocks handed to the applier, rewound ones included.
    pub blocks_applied: u64,
    /// Segments completely replayed.
    pub segments_completed: u64,
    /// Segment files deleted.
    pub segments_deleted: u64,
}

/// A segment file found in the source directory.
#[derive(Debug, Clone)]
struct SourceSegment {
    path: PathBuf,
    header: SegmentHeader,
}

/// Replays one journal source into one replica.
pub struct ApplyEngine<A: Applier> {
    target: ApplyTargetConfig,
    applier: A,
    oplog: Arc<OperationalLog>,
    shutdown: Arc<Shutdown>,
    stats: ApplyStats,
}

impl<A: Applier> ApplyEngine<A> {
    /// Creates an engine for `target`.
    pub fn new(
        target: ApplyTargetConfig,
        applier: A,
        oplog: Arc<OperationalLog>,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            target,
            applier,
            oplog,
            shutdown,
            stats: ApplyStats::default(),
        }
    }

    /// Returns the target settings.
    pub fn target(&self) -> &ApplyTargetConfig {
        &self.target
    }

    /// Returns the replica.
    pub fn applier(&self) -> &A {
        &self.applier
    }

    /// Returns the replica mutably.
    pub fn applier_mut(&mut self) -> &mut A {
        &mut self.applier
    }

    /// Consumes the engine, returning the replica.
    pub fn into_applier(self) -> A {
        self.applier
    }

    /// Returns statistics.
    pub fn stats(&self) -> &ApplyStats {
        &self.stats
    }

    /// Runs passes until shutdown.
    ///
    /// Errors are logged and retried after the error timeout; an idle pass
    /// waits the idle timeout before scanning again.
    pub fn run(&mut self) {
        tracing::info!(
            "apply engine for {} replaying {}",
            self.target.database,
            self.target.journal_source_directory.display()
        );

        while !self.shutdown.is_cancelled() {
            let wait = match self.run_pass() {
                Ok(PassOutcome::Progress { blocks, segments }) => {
                    tracing::debug!("replayed {} blocks, completed {} segments", blocks, segments);
                    self.oplog.reset_reported();
                    continue;
                }
                Ok(PassOutcome::Idle) => self.target.idle_timeout(),
                Err(e) => {
                    self.oplog.error(LogSide::Replica, e.to_string());
                    self.target.error_timeout()
                }
            };

            if self.shutdown.wait_timeout(wait) {
                break;
            }
        }

        tracing::info!("apply engine for {} stopped", self.target.database);
    }

    /// Runs one pass over the source directory.
    ///
    /// Replica transactions still open at the end of the pass are rolled
    /// back; the next pass replays them again from their first block.
    pub fn run_pass(&mut self) -> ApplyResult<PassOutcome> {
        self.stats.passes += 1;
        let result = self.replay_all();
        self.applier.discard();
        if result.is_err() {
            self.stats.failed_passes += 1;
        }
        result
    }

    fn replay_all(&mut self) -> ApplyResult<PassOutcome> {
        let instances = self.scan()?;
        if instances.is_empty() {
            return Ok(PassOutcome::Idle);
        }

        let replica_sequence = self.applier.replica_sequence()?;

        let mut blocks = 0;
        let mut segments = 0;
        for (guid, queue) in instances {
            if self.shutdown.is_cancelled() {
                break;
            }
            let (b, s) = self.replay_instance(guid, queue, replica_sequence)?;
            blocks += b;
            segments += s;
        }

        if blocks == 0 && segments == 0 {
            Ok(PassOutcome::Idle)
        } else {
            Ok(PassOutcome::Progress { blocks, segments })
        }
    }

    /// Collects valid segment files, grouped by journal instance and sorted
    /// by sequence.
    fn scan(&self) -> ApplyResult<BTreeMap<Uuid, Vec<SourceSegment>>> {
        let dir = &self.target.journal_source_directory;
        let mut instances: BTreeMap<Uuid, Vec<SourceSegment>> = BTreeMap::new();

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.oplog.verbose(
                    LogSide::Replica,
                    format!("source directory {} does not exist yet", dir.display()),
                );
                return Ok(instances);
            }
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(sequence) = parse_segment_file_name(&path) else {
                continue;
            };
            let metadata = entry.metadata()?;
            if !metadata.is_file() || metadata.len() < SegmentHeader::SIZE as u64 {
                continue;
            }

            let header = match SegmentHeader::read_from(&path) {
                Ok(header) => header,
                Err(e) => {
                    self.oplog
                        .error(LogSide::Replica, format!("skipping {}: {}", path.display(), e));
                    continue;
                }
            };

            if header.state == SegmentState::Free {
                continue;
            }
            if self.target.source_guid.is_some_and(|guid| guid != header.guid) {
                continue;
            }
            if header.sequence != sequence {
                self.oplog.error(
                    LogSide::Replica,
                    format!(
                        "skipping {}: file name says segment {}, header says {}",
                        path.display(),
                        sequence,
                        header.sequence
                    ),
                );
                continue;
            }
            if metadata.len() < header.length {
                self.oplog.verbose(
                    LogSide::Replica,
                    format!("{} is still being copied", path.display()),
                );
                continue;
            }

            instances.entry(header.guid).or_default().push(SourceSegment { path, header });
        }

        for queue in instances.values_mut() {
            queue.sort_by_key(|s| s.header.sequence);
            queue.dedup_by(|later, earlier| {
                let duplicate = later.header.sequence == earlier.header.sequence;
                if duplicate {
                    tracing::warn!(
                        "ignoring {}, segment {} is also in {}",
                        later.path.display(),
                        later.header.sequence,
                        earlier.path.display()
                    );
                }
                duplicate
            });
        }

        Ok(instances)
    }

    /// Replays the segments of one journal instance.
    ///
    /// Returns the number of new blocks applied and segments completed.
    fn replay_instance(
        &mut self,
        guid: Uuid,
        mut queue: Vec<SourceSegment>,
        replica_sequence: u64,
    ) -> ApplyResult<(u64, u64)> {
        let mut control = ControlFile::open(self.target.control_directory(), guid)?;

        // The replica already contains these.
        queue.retain(|segment| {
            if segment.header.sequence > replica_sequence {
                return true;
            }
            self.delete_segment(segment, "already in the replica");
            false
        });

        if control.state().db_sequence != replica_sequence {
            self.oplog.warning(
                LogSide::Replica,
                format!(
                    "replica sequence changed from {} to {}, restarting replay of {}",
                    control.state().db_sequence,
                    replica_sequence,
                    guid
                ),
            );
            control.reset(replica_sequence)?;
        }

        let checkpoint = control.state().clone();
        let threshold = checkpoint.threshold();
        queue.retain(|segment| {
            if segment.header.sequence >= threshold {
                return true;
            }
            self.delete_segment(segment, "already replayed");
            false
        });

        // A fresh checkpoint starts at whatever the source holds.
        let mut expected =
            if checkpoint.sequence == 0 && checkpoint.offset == 0 && checkpoint.active.is_empty() {
                None
            } else {
                Some(threshold)
            };

        let mut state = checkpoint.clone();
        let mut blocks = 0;
        let mut segments = 0;
        let mut held: Vec<SourceSegment> = Vec::new();

        for segment in queue {
            if self.shutdown.is_cancelled() {
                break;
            }

            let sequence = segment.header.sequence;
            if let Some(expected) = expected {
                if sequence != expected {
                    return Err(ApplyError::SequenceGap {
                        expected,
                        found: sequence,
                    });
                }
            }
            expected = Some(sequence + 1);

            blocks += self.replay_segment(&segment, &checkpoint, &mut state, &mut control)?;

            if segment.header.state == SegmentState::Used {
                // Still being written.
                break;
            }

            if !checkpoint.is_complete(sequence) {
                state.sequence = sequence;
                state.offset = 0;
                segments += 1;
                self.stats.segments_completed += 1;
            }
            control.save(state.clone())?;

            held.push(segment);
            held.retain(|segment| {
                if !state.can_delete(segment.header.sequence) {
                    return true;
                }
                self.delete_segment(segment, "replayed");
                false
            });
        }

        for segment in &held {
            tracing::debug!(
                "keeping segment {}, an open transaction needs it",
                segment.header.sequence
            );
        }

        Ok((blocks, segments))
    }

    /// Replays the blocks of one segment.
    ///
    /// Returns the number of blocks applied past the checkpoint.
    fn replay_segment(
        &mut self,
        segment: &SourceSegment,
        checkpoint: &ControlState,
        state: &mut ControlState,
        control: &mut ControlFile,
    ) -> ApplyResult<u64> {
        let sequence = segment.header.sequence;
        let mut reader = SegmentReader::open(&segment.path)?;

        let rewinding = state.active.iter().any(|t| t.sequence <= sequence);
        if sequence == checkpoint.sequence && checkpoint.offset > 0 && !rewinding {
            reader.seek(checkpoint.offset)?;
        }

        let mut applied = 0;
        loop {
            let start = reader.offset();
            let Some(block) = reader.next_block()? else {
                break;
            };

            let rewind = checkpoint.precedes(sequence, start);
            let txn_id = block.txn_id();
            let replicate = if !txn_id.is_valid() {
                !rewind
            } else {
                !rewind || state.is_active(txn_id)
            };

            if replicate {
                let operations = block.operations()?;
                self.applier.apply_block(&block, &operations)?;
                self.stats.blocks_applied += 1;
            }

            if txn_id.is_valid() {
                if block.is_begin() && !rewind {
                    state.begin(txn_id, sequence);
                }
                if block.is_end() {
                    state.end(txn_id);
                }
            }

            if !rewind {
                applied += 1;
                state.sequence = sequence;
                state.offset = reader.offset();
                control.save(state.clone())?;
            }
        }

        Ok(applied)
    }

    fn delete_segment(&mut self, segment: &SourceSegment, reason: &str) {
        match fs::remove_file(&segment.path) {
            Ok(()) => {
                self.stats.segments_deleted += 1;
                self.oplog.verbose(
                    LogSide::Replica,
                    format!("deleted segment {} ({})", segment.header.sequence, reason),
                );
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                self.oplog.warning(
                    LogSide::Replica,
                    format!("cannot delete {}: {}", segment.path.display(), e),
                );
            }
        }
    }
}

impl<A: Applier> std::fmt::Debug for ApplyEngine<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyEngine")
            .field("database", &self.target.database)
            .field("source", &self.target.journal_source_directory)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::MemoryApplier;
    use bytes::Bytes;
    use replog_common::types::TxnId;
    use replog_journal::segment::Segment;
    use replog_journal::{encode_block_into, BlockFlags, OpTag, OpWriter, Operation};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn segment_path(dir: &Path, sequence: u64) -> PathBuf {
        dir.join(format!("primary.journal-{:09}", sequence))
    }

    /// Encodes one block of `txn` holding one insert per record.
    fn block(txn: u64, flags: BlockFlags, records: &[&str], tail: Option<OpTag>) -> Vec<u8> {
        let mut data = Vec::new();
        let mut writer = OpWriter::new(&mut data);
        if flags.contains(BlockFlags::BEGIN_TRANSACTION) {
            writer.tag(OpTag::StartTransaction);
        }
        for record in records {
            writer.insert(0, record.as_bytes());
        }
        if let Some(tag) = tail {
            writer.tag(tag);
        }
        let mut out = Vec::new();
        encode_block_into(&mut out, TxnId::new(txn), flags, 0, &data, &["T".to_string()]);
        out
    }

    fn committed_txn(txn: u64, records: &[&str]) -> Vec<u8> {
        block(
            txn,
            BlockFlags::BEGIN_TRANSACTION | BlockFlags::END_TRANSACTION,
            records,
            Some(OpTag::CommitTransaction),
        )
    }

    fn write_segment(dir: &Path, guid: Uuid, sequence: u64, blocks: &[Vec<u8>], state: SegmentState) {
        let segment = Segment::create(segment_path(dir, sequence), guid, sequence).unwrap();
        for b in blocks {
            segment.append(b).unwrap();
        }
        if state != SegmentState::Used {
            segment.set_state(state).unwrap();
        }
    }

    fn engine(source: &Path, control: &Path, replica: MemoryApplier) -> ApplyEngine<MemoryApplier> {
        let mut target = ApplyTargetConfig::new("replica.db", source);
        target.control_directory = Some(control.to_path_buf());
        ApplyEngine::new(
            target,
            replica,
            Arc::new(OperationalLog::tracing_only("replica.db")),
            Arc::new(Shutdown::new()),
        )
    }

    fn inserted(replica: &MemoryApplier) -> Vec<String> {
        replica
            .committed()
            .iter()
            .filter_map(|(_, op)| match op {
                Operation::InsertRecord { record, .. } => {
                    Some(String::from_utf8_lossy(record).into_owned())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_replay_and_delete() {
        let source = TempDir::new().unwrap();
        let control = TempDir::new().unwrap();
        let guid = Uuid::new_v4();

        write_segment(source.path(), guid, 1, &[committed_txn(1, &["a", "b"])], SegmentState::Arch);
        write_segment(source.path(), guid, 2, &[committed_txn(2, &["c"])], SegmentState::Full);

        let mut engine = engine(source.path(), control.path(), MemoryApplier::new());
        let outcome = engine.run_pass().unwrap();
        assert_eq!(outcome, PassOutcome::Progress { blocks: 2, segments: 2 });
        assert_eq!(inserted(engine.applier()), vec!["a", "b", "c"]);
        assert!(!segment_path(source.path(), 1).exists());
        assert!(!segment_path(source.path(), 2).exists());

        assert_eq!(engine.run_pass().unwrap(), PassOutcome::Idle);

        let saved = ControlFile::open(control.path(), guid).unwrap();
        assert_eq!(saved.state().next_position(), 3);
    }

    #[test]
    fn test_ignores_free_foreign_and_garbage_files() {
        let source = TempDir::new().unwrap();
        let control = TempDir::new().unwrap();
        let guid = Uuid::new_v4();

        write_segment(source.path(), guid, 1, &[committed_txn(1, &["mine"])], SegmentState::Full);
        write_segment(source.path(), guid, 2, &[], SegmentState::Free);
        fs::write(segment_path(source.path(), 3), vec![0u8; 100]).unwrap();
        fs::write(source.path().join("notes.txt"), b"hello").unwrap();

        let other = TempDir::new().unwrap();
        write_segment(other.path(), Uuid::new_v4(), 9, &[committed_txn(9, &["theirs"])], SegmentState::Full);
        fs::rename(segment_path(other.path(), 9), segment_path(source.path(), 9)).unwrap();

        let mut engine = engine(source.path(), control.path(), MemoryApplier::new());
        engine.target.source_guid = Some(guid);
        engine.run_pass().unwrap();

        assert_eq!(inserted(engine.applier()), vec!["mine"]);
        assert!(segment_path(source.path(), 2).exists());
        assert!(segment_path(source.path(), 3).exists());
        assert!(segment_path(source.path(), 9).exists());
    }

    #[test]
    fn test_gap_fails_pass() {
        let source = TempDir::new().unwrap();
        let control = TempDir::new().unwrap();
        let guid = Uuid::new_v4();

        write_segment(source.path(), guid, 1, &[committed_txn(1, &["a"])], SegmentState::Full);
        let mut engine = engine(source.path(), control.path(), MemoryApplier::new());
        engine.run_pass().unwrap();

        write_segment(source.path(), guid, 3, &[committed_txn(3, &["c"])], SegmentState::Full);
        let err = engine.run_pass().unwrap_err();
        assert!(matches!(err, ApplyError::SequenceGap { expected: 2, found: 3 }));
        assert!(segment_path(source.path(), 3).exists());
        assert_eq!(engine.stats().failed_passes, 1);
    }

    #[test]
    fn test_fast_forward_and_reset() {
        let source = TempDir::new().unwrap();
        let control = TempDir::new().unwrap();
        let guid = Uuid::new_v4();

        for sequence in 1..=3 {
            write_segment(
                source.path(),
                guid,
                sequence,
                &[committed_txn(sequence, &[&format!("r{}", sequence)])],
                SegmentState::Full,
            );
        }

        let mut replica = MemoryApplier::new();
        replica.set_replica_sequence(2);
        let mut engine = engine(source.path(), control.path(), replica);
        engine.run_pass().unwrap();

        assert_eq!(inserted(engine.applier()), vec!["r3"]);
        assert!(!segment_path(source.path(), 1).exists());
        let saved = ControlFile::open(control.path(), guid).unwrap();
        assert_eq!(saved.state().db_sequence, 2);
        assert_eq!(saved.state().next_position(), 4);
    }

    #[test]
    fn test_open_transaction_keeps_segment() {
        let source = TempDir::new().unwrap();
        let control = TempDir::new().unwrap();
        let guid = Uuid::new_v4();

        write_segment(
            source.path(),
            guid,
            1,
            &[block(7, BlockFlags::BEGIN_TRANSACTION, &["x1"], None)],
            SegmentState::Full,
        );

        let mut engine = engine(source.path(), control.path(), MemoryApplier::new());
        assert_eq!(
            engine.run_pass().unwrap(),
            PassOutcome::Progress { blocks: 1, segments: 1 }
        );
        assert!(segment_path(source.path(), 1).exists());
        assert!(inserted(engine.applier()).is_empty());
        assert_eq!(engine.applier().open_transactions(), 0);

        // Rewinding to the open transaction is not progress.
        assert_eq!(engine.run_pass().unwrap(), PassOutcome::Idle);

        write_segment(
            source.path(),
            guid,
            2,
            &[block(7, BlockFlags::END_TRANSACTION, &["x2"], Some(OpTag::CommitTransaction))],
            SegmentState::Full,
        );
        engine.run_pass().unwrap();

        assert_eq!(inserted(engine.applier()), vec!["x1", "x2"]);
        assert!(!segment_path(source.path(), 1).exists());
        assert!(!segment_path(source.path(), 2).exists());
    }

    #[test]
    fn test_live_segment_resumes_at_offset() {
        let source = TempDir::new().unwrap();
        let control = TempDir::new().unwrap();
        let guid = Uuid::new_v4();

        let path = segment_path(source.path(), 1);
        let segment = Segment::create(&path, guid, 1).unwrap();
        segment.append(&committed_txn(1, &["first"])).unwrap();

        let mut engine = engine(source.path(), control.path(), MemoryApplier::new());
        engine.run_pass().unwrap();
        assert!(path.exists());

        segment.append(&committed_txn(2, &["second"])).unwrap();
        segment.set_state(SegmentState::Full).unwrap();
        assert_eq!(
            engine.run_pass().unwrap(),
            PassOutcome::Progress { blocks: 1, segments: 1 }
        );

        assert_eq!(inserted(engine.applier()), vec!["first", "second"]);
        assert!(!path.exists());
    }

    #[test]
    fn test_failed_block_retried() {
        let source = TempDir::new().unwrap();
        let control = TempDir::new().unwrap();
        let guid = Uuid::new_v4();

        write_segment(
            source.path(),
            guid,
            1,
            &[committed_txn(1, &["a"]), committed_txn(2, &["b"])],
            SegmentState::Full,
        );

        let mut replica = MemoryApplier::new();
        replica.fail_next_block("lock conflict");
        let mut engine = engine(source.path(), control.path(), replica);
        assert!(engine.run_pass().unwrap_err().is_applier());
        assert!(segment_path(source.path(), 1).exists());

        engine.run_pass().unwrap();
        assert_eq!(inserted(engine.applier()), vec!["a", "b"]);
    }

    #[test]
    fn test_autonomous_block() {
        let source = TempDir::new().unwrap();
        let control = TempDir::new().unwrap();
        let guid = Uuid::new_v4();

        let mut data = Vec::new();
        OpWriter::new(&mut data).set_sequence(0, 42);
        let mut auto = Vec::new();
        encode_block_into(
            &mut auto,
            TxnId::AUTONOMOUS,
            BlockFlags::BEGIN_TRANSACTION | BlockFlags::END_TRANSACTION,
            0,
            &data,
            &["GEN_ORDER".to_string()],
        );
        write_segment(source.path(), guid, 1, &[auto], SegmentState::Full);

        let mut engine = engine(source.path(), control.path(), MemoryApplier::new());
        engine.run_pass().unwrap();
        assert_eq!(engine.applier().sequence("GEN_ORDER"), Some(42));
        assert!(!segment_path(source.path(), 1).exists());
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let source = TempDir::new().unwrap();
        let control = TempDir::new().unwrap();

        let mut engine = engine(source.path(), control.path(), MemoryApplier::new());
        let shutdown = engine.shutdown.clone();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            shutdown.cancel();
        });
        engine.run();
        stopper.join().unwrap();
        assert!(engine.stats().passes >= 1);
    }

    #[test]
    fn test_record_payloads_survive() {
        let source = TempDir::new().unwrap();
        let control = TempDir::new().unwrap();
        let guid = Uuid::new_v4();
        write_segment(source.path(), guid, 1, &[committed_txn(4, &["payload"])], SegmentState::Full);

        let mut engine = engine(source.path(), control.path(), MemoryApplier::new());
        engine.run_pass().unwrap();
        assert_eq!(
            engine.applier().committed_by(TxnId::new(4)),
            vec![&Operation::InsertRecord {
                table: "T".into(),
                record: Bytes::from_static(b"payload"),
            }]
        );
    }
}
