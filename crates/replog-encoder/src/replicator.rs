//! Per-transaction change encoding.
//!
//! A [`Replicator`] is the replication session of one database attachment.
//! The engine opens a [`Transaction`] for every transaction it runs and
//! reports each change to it; the transaction accumulates the changes in a
//! [`Batch`] and flushes blocks to the [`Manager`] at its flush points:
//!
//! | Event | Flush |
//! |-------|-------|
//! | batch exceeds `buffer_size` | asynchronous, transaction continues |
//! | savepoint rollback | synchronous |
//! | prepare | synchronous, journal write made durable |
//! | commit | synchronous, last block |
//! | rollback / cleanup | asynchronous, last block, only if blocks were shipped |
//!
//! Any failure poisons the transaction: the error is recorded in the
//! session's [`SessionStatus`] and every later call on the transaction fails
//! without touching the batch. Rollback and cleanup are the exception once
//! blocks were shipped: they still ship a bare end block, so replicas stop
//! holding the transaction open.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use replog_common::types::TxnId;
use replog_common::LogSide;
use replog_journal::{BlobId, OpTag};

use crate::batch::Batch;
use crate::dispatch::{FlushMode, Manager};
use crate::error::{ReplicatorError, ReplicatorResult};
use crate::filter::TableFilter;

/// Character set id meaning "none".
pub const CHARSET_NONE: u8 = 0;

/// Source of blob contents referenced by records.
pub trait BlobStore: Send + Sync {
    /// Reads the whole contents of a blob.
    fn read_blob(&self, blob: BlobId) -> ReplicatorResult<Bytes>;
}

/// A blob store for databases without blobs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBlobs;

impl BlobStore for NoBlobs {
    fn read_blob(&self, blob: BlobId) -> ReplicatorResult<Bytes> {
        Err(ReplicatorError::blob_read(blob, "no blob store configured"))
    }
}

/// A record image and the blobs it references.
#[derive(Debug, Clone, Default)]
pub struct Record {
    /// Encoded record image.
    pub data: Bytes,
    /// Blobs whose contents must travel with the record.
    pub blobs: Vec<BlobId>,
}

impl Record {
    /// Creates a record without blob references.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            blobs: Vec::new(),
        }
    }

    /// Adds a blob reference.
    #[must_use]
    pub fn with_blob(mut self, blob: BlobId) -> Self {
        self.blobs.push(blob);
        self
    }
}

/// First error seen by a replication session.
#[derive(Debug, Default)]
pub struct SessionStatus {
    error: Mutex<Option<String>>,
}

impl SessionStatus {
    /// Returns true if no error was recorded.
    pub fn is_ok(&self) -> bool {
        self.error.lock().is_none()
    }

    /// Returns the first recorded error message.
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// Forgets the recorded error.
    pub fn clear(&self) {
        *self.error.lock() = None;
    }

    fn record(&self, error: &ReplicatorError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error.to_string());
        }
    }
}

struct Session {
    manager: Arc<Manager>,
    filter: Arc<TableFilter>,
    blobs: Arc<dyn BlobStore>,
    status: SessionStatus,
}

/// Replication session of one attachment.
#[derive(Clone)]
pub struct Replicator {
    session: Arc<Session>,
}

impl Replicator {
    /// Creates a session delivering through `manager`.
    pub fn new(
        manager: Arc<Manager>,
        filter: Arc<TableFilter>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            session: Arc::new(Session {
                manager,
                filter,
                blobs,
                status: SessionStatus::default(),
            }),
        }
    }

    /// Returns the session status.
    pub fn status(&self) -> &SessionStatus {
        &self.session.status
    }

    /// Returns the dispatcher.
    pub fn manager(&self) -> &Arc<Manager> {
        &self.session.manager
    }

    /// Starts capturing a transaction.
    pub fn start_transaction(&self, txn_id: TxnId) -> Transaction {
        let mut batch = Batch::new(txn_id);
        batch.push_tag(OpTag::StartTransaction);
        Transaction {
            session: Arc::clone(&self.session),
            batch,
            sequences: Vec::new(),
            poisoned: false,
        }
    }

    /// Ships a sequence change made outside any transaction.
    pub fn set_sequence(&self, name: &str, value: i64) -> ReplicatorResult<()> {
        let mut batch = Batch::new(TxnId::AUTONOMOUS);
        batch.set_sequence(name, value);

        let manager = &self.session.manager;
        let mut buffer = manager.get_buffer();
        batch.encode_block(&mut buffer, true);
        manager.flush(buffer, FlushMode::Async).map_err(|e| {
            self.session.status.record(&e);
            e
        })
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("filter", &self.session.filter)
            .field("status", &self.session.status)
            .finish()
    }
}

/// Changes of one primary transaction.
pub struct Transaction {
    session: Arc<Session>,
    batch: Batch,
    /// Pending sequence values, in first-touch order.
    sequences: Vec<(String, i64)>,
    poisoned: bool,
}

impl Transaction {
    /// Returns the transaction id.
    pub fn txn_id(&self) -> TxnId {
        self.batch.txn_id()
    }

    /// Returns the batch being built.
    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    /// Returns true if an earlier call failed.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Runs `f` unless poisoned; poisons the transaction if it fails.
    fn guarded<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> ReplicatorResult<T>,
    ) -> ReplicatorResult<T> {
        if self.poisoned {
            return Err(ReplicatorError::Poisoned {
                txn_id: self.txn_id(),
            });
        }

        let result = f(self);
        if let Err(e) = &result {
            self.poisoned = true;
            self.session.status.record(e);
            tracing::debug!(txn = %self.txn_id(), "replication failed: {}", e);
        }
        result
    }

    fn flush(&mut self, mode: FlushMode, end: bool) -> ReplicatorResult<()> {
        let manager = &self.session.manager;
        let mut buffer = manager.get_buffer();
        self.batch.encode_block(&mut buffer, end);
        manager.flush(buffer, mode)
    }

    fn flush_if_full(&mut self) -> ReplicatorResult<()> {
        if self.batch.payload_len() > self.session.manager.config().buffer_size {
            self.flush(FlushMode::Async, false)?;
        }
        Ok(())
    }

    /// Reads every referenced blob before anything is appended.
    fn read_blobs(&self, record: &Record) -> ReplicatorResult<Vec<(BlobId, Bytes)>> {
        record
            .blobs
            .iter()
            .map(|&blob| Ok((blob, self.session.blobs.read_blob(blob)?)))
            .collect()
    }

    fn append_blobs(&mut self, blobs: Vec<(BlobId, Bytes)>) {
        for (blob, data) in blobs {
            self.batch.store_blob(blob, &data);
        }
    }

    /// Records an inserted row.
    pub fn insert(&mut self, table: &str, record: &Record) -> ReplicatorResult<()> {
        self.guarded(|txn| {
            if !txn.session.filter.is_replicated(table) {
                return Ok(());
            }
            let blobs = txn.read_blobs(record)?;
            txn.append_blobs(blobs);
            txn.batch.insert(table, &record.data);
            txn.flush_if_full()
        })
    }

    /// Records an updated row.
    pub fn update(&mut self, table: &str, old: &Record, new: &Record) -> ReplicatorResult<()> {
        self.guarded(|txn| {
            if !txn.session.filter.is_replicated(table) {
                return Ok(());
            }
            let blobs = txn.read_blobs(new)?;
            txn.append_blobs(blobs);
            txn.batch.update(table, &old.data, &new.data);
            txn.flush_if_full()
        })
    }

    /// Records a deleted row.
    pub fn delete(&mut self, table: &str, record: &Record) -> ReplicatorResult<()> {
        self.guarded(|txn| {
            if !txn.session.filter.is_replicated(table) {
                return Ok(());
            }
            txn.batch.delete(table, &record.data);
            txn.flush_if_full()
        })
    }

    /// Records an executed SQL statement. Use [`CHARSET_NONE`] when the text
    /// has no character set.
    pub fn execute_sql(&mut self, sql: &str, user: &str, charset: u8) -> ReplicatorResult<()> {
        self.guarded(|txn| {
            txn.batch.execute_sql(sql, user, charset);
            txn.flush_if_full()
        })
    }

    /// Records a sequence change; shipped right before the commit.
    pub fn set_sequence(&mut self, name: &str, value: i64) -> ReplicatorResult<()> {
        self.guarded(|txn| {
            match txn.sequences.iter_mut().find(|(n, _)| n == name) {
                Some(entry) => entry.1 = value,
                None => txn.sequences.push((name.to_string(), value)),
            }
            Ok(())
        })
    }

    /// Records the start of a savepoint.
    pub fn start_savepoint(&mut self) -> ReplicatorResult<()> {
        self.guarded(|txn| {
            txn.batch.push_tag(OpTag::StartSavepoint);
            Ok(())
        })
    }

    /// Records the release of a savepoint.
    pub fn release_savepoint(&mut self) -> ReplicatorResult<()> {
        self.guarded(|txn| {
            txn.batch.push_tag(OpTag::ReleaseSavepoint);
            Ok(())
        })
    }

    /// Records a savepoint rollback and ships it before returning.
    pub fn rollback_savepoint(&mut self) -> ReplicatorResult<()> {
        self.guarded(|txn| {
            txn.batch.push_tag(OpTag::RollbackSavepoint);
            txn.flush(FlushMode::Sync, false)
        })
    }

    /// Records the first phase of a two-phase commit.
    pub fn prepare(&mut self) -> ReplicatorResult<()> {
        self.guarded(|txn| {
            txn.batch.push_tag(OpTag::PrepareTransaction);
            txn.flush(FlushMode::Prepare, false)
        })
    }

    /// Ships the transaction's last block with its commit.
    ///
    /// A transaction that changed nothing is dropped without shipping.
    pub fn commit(mut self) -> ReplicatorResult<()> {
        self.guarded(|txn| {
            for (name, value) in std::mem::take(&mut txn.sequences) {
                txn.batch.set_sequence(&name, value);
            }

            // Nothing but the start tag, never shipped: read-only.
            if txn.batch.flush_count() == 0 && txn.batch.operation_count() <= 1 {
                tracing::trace!(txn = %txn.txn_id(), "read-only transaction not replicated");
                return Ok(());
            }

            txn.batch.push_tag(OpTag::CommitTransaction);
            txn.flush(FlushMode::Sync, true)
        })
    }

    /// Ships a rollback, if the transaction shipped anything before.
    pub fn rollback(self) -> ReplicatorResult<()> {
        self.finish(OpTag::RollbackTransaction)
    }

    /// Ships a cleanup after a failed transaction, if it shipped anything
    /// before.
    pub fn cleanup(self) -> ReplicatorResult<()> {
        self.finish(OpTag::CleanupTransaction)
    }

    fn finish(mut self, tag: OpTag) -> ReplicatorResult<()> {
        if self.poisoned && self.batch.flush_count() > 0 {
            return self.abandon(tag);
        }
        self.guarded(|txn| {
            if txn.batch.flush_count() == 0 {
                return Ok(());
            }
            txn.batch.push_tag(tag);
            txn.flush(FlushMode::Async, true)
        })
    }
}

impl Transaction {
    /// Ends a poisoned transaction that already shipped blocks. Unshipped
    /// operations are dropped; only `tag` goes out.
    fn abandon(&mut self, tag: OpTag) -> ReplicatorResult<()> {
        self.batch.discard_pending();
        self.batch.push_tag(tag);
        let result = self.flush(FlushMode::Async, true);

        let oplog = self.session.manager.oplog();
        match &result {
            Ok(()) => oplog.warning(
                LogSide::Primary,
                format!(
                    "transaction {} failed after shipping {} block(s), ended with {:?}",
                    self.txn_id(),
                    self.batch.flush_count() - 1,
                    tag
                ),
            ),
            Err(e) => {
                oplog.error(
                    LogSide::Primary,
                    format!("cannot end failed transaction {}: {}", self.txn_id(), e),
                );
            }
        }
        result
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("txn_id", &self.txn_id())
            .field("flushes", &self.batch.flush_count())
            .field("operations", &self.batch.operation_count())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchConfig, ReplicaConnection};
    use replog_common::OperationalLog;
    use replog_journal::{Block, Operation};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Clone, Default)]
    struct Capture {
        blocks: Arc<Mutex<Vec<Vec<u8>>>>,
        failing: Arc<AtomicBool>,
    }

    impl Capture {
        fn decoded(&self) -> Vec<Block> {
            self.blocks
                .lock()
                .iter()
                .map(|b| Block::decode(b, 0).unwrap())
                .collect()
        }
    }

    impl ReplicaConnection for Capture {
        fn name(&self) -> &str {
            "capture"
        }

        fn replicate(&mut self, block: &[u8]) -> ReplicatorResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ReplicatorError::replica("capture", "down"));
            }
            self.blocks.lock().push(block.to_vec());
            Ok(())
        }
    }

    struct MapBlobs(HashMap<BlobId, Bytes>);

    impl BlobStore for MapBlobs {
        fn read_blob(&self, blob: BlobId) -> ReplicatorResult<Bytes> {
            self.0
                .get(&blob)
                .cloned()
                .ok_or_else(|| ReplicatorError::blob_read(blob, "not found"))
        }
    }

    fn setup_with(
        buffer_size: usize,
        filter: TableFilter,
        blobs: Arc<dyn BlobStore>,
    ) -> (Replicator, Capture) {
        let capture = Capture::default();
        let manager = Manager::new(
            DispatchConfig::new(buffer_size).with_background_writer(false),
            None,
            vec![Box::new(capture.clone())],
            Arc::new(OperationalLog::tracing_only("test")),
        )
        .unwrap();
        (
            Replicator::new(manager, Arc::new(filter), blobs),
            capture,
        )
    }

    fn setup() -> (Replicator, Capture) {
        setup_with(64 * 1024, TableFilter::allow_all(), Arc::new(NoBlobs))
    }

    #[test]
    fn test_commit_ships_one_block() {
        let (replicator, capture) = setup();
        let mut txn = replicator.start_transaction(TxnId::new(1));
        for i in 0..3u8 {
            txn.insert("T1", &Record::new(vec![i])).unwrap();
        }
        txn.commit().unwrap();

        let blocks = capture.decoded();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].is_begin() && blocks[0].is_end());
        let ops = blocks[0].operations().unwrap();
        assert_eq!(ops.len(), 5);
        assert_eq!(ops[0], Operation::StartTransaction);
        assert_eq!(ops[4], Operation::CommitTransaction);
    }

    #[test]
    fn test_read_only_transaction_is_discarded() {
        let (replicator, capture) = setup();
        replicator.start_transaction(TxnId::new(1)).commit().unwrap();
        replicator.start_transaction(TxnId::new(2)).rollback().unwrap();
        assert!(capture.blocks.lock().is_empty());
    }

    #[test]
    fn test_filtered_tables_are_skipped() {
        let (replicator, capture) = setup_with(
            64 * 1024,
            TableFilter::new(None, Some("TMP_.*")).unwrap(),
            Arc::new(NoBlobs),
        );
        let mut txn = replicator.start_transaction(TxnId::new(1));
        txn.insert("TMP_X", &Record::new(&b"a"[..])).unwrap();
        txn.commit().unwrap();
        assert!(capture.blocks.lock().is_empty());

        let mut txn = replicator.start_transaction(TxnId::new(2));
        txn.insert("TMP_X", &Record::new(&b"a"[..])).unwrap();
        txn.delete("KEEP", &Record::new(&b"b"[..])).unwrap();
        txn.commit().unwrap();
        let ops = capture.decoded()[0].operations().unwrap();
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn test_savepoint_rollback_flushes() {
        let (replicator, capture) = setup();
        let mut txn = replicator.start_transaction(TxnId::new(2));
        txn.start_savepoint().unwrap();
        txn.rollback_savepoint().unwrap();
        assert_eq!(capture.blocks.lock().len(), 1);

        txn.rollback().unwrap();
        let blocks = capture.decoded();
        assert_eq!(blocks.len(), 1, "rollback is asynchronous");

        replicator.manager().shutdown().unwrap();
        let blocks = capture.decoded();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[1].is_end());
        assert_eq!(
            blocks[1].operations().unwrap(),
            vec![Operation::RollbackTransaction]
        );
    }

    #[test]
    fn test_sequences_before_commit() {
        let (replicator, capture) = setup();
        let mut txn = replicator.start_transaction(TxnId::new(3));
        txn.set_sequence("G1", 1).unwrap();
        txn.set_sequence("G2", 5).unwrap();
        txn.set_sequence("G1", 2).unwrap();
        txn.commit().unwrap();

        let ops = capture.decoded()[0].operations().unwrap();
        assert_eq!(
            ops,
            vec![
                Operation::StartTransaction,
                Operation::SetSequence {
                    name: "G1".to_string(),
                    value: 2
                },
                Operation::SetSequence {
                    name: "G2".to_string(),
                    value: 5
                },
                Operation::CommitTransaction,
            ]
        );
    }

    #[test]
    fn test_autonomous_sequence() {
        let (replicator, capture) = setup();
        replicator.set_sequence("GEN", 100).unwrap();
        replicator.manager().shutdown().unwrap();

        let blocks = capture.decoded();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].txn_id(), TxnId::AUTONOMOUS);
        assert!(blocks[0].is_begin() && blocks[0].is_end());
    }

    #[test]
    fn test_blobs_travel_with_record() {
        let blob = BlobId::new(1, 42);
        let blobs = MapBlobs(HashMap::from([(blob, Bytes::from_static(b"blob data"))]));
        let (replicator, capture) = setup_with(64 * 1024, TableFilter::allow_all(), Arc::new(blobs));

        let mut txn = replicator.start_transaction(TxnId::new(4));
        txn.insert("DOCS", &Record::new(&b"row"[..]).with_blob(blob))
            .unwrap();
        txn.commit().unwrap();

        let ops = capture.decoded()[0].operations().unwrap();
        assert_eq!(
            ops[1],
            Operation::StoreBlob {
                blob,
                data: Bytes::from_static(b"blob data")
            }
        );
        assert!(matches!(ops[2], Operation::InsertRecord { .. }));
    }

    #[test]
    fn test_missing_blob_poisons_transaction() {
        let (replicator, capture) = setup();
        let mut txn = replicator.start_transaction(TxnId::new(5));
        txn.insert("A", &Record::new(&b"1"[..])).unwrap();

        let err = txn
            .insert("A", &Record::new(&b"2"[..]).with_blob(BlobId::new(1, 1)))
            .unwrap_err();
        assert!(matches!(err, ReplicatorError::BlobRead { .. }));
        assert!(txn.is_poisoned());
        // Nothing of the failed call was appended.
        assert_eq!(txn.batch().operation_count(), 2);

        assert!(matches!(
            txn.insert("A", &Record::new(&b"3"[..])),
            Err(ReplicatorError::Poisoned { .. })
        ));
        assert!(txn.commit().is_err());
        assert!(!replicator.status().is_ok());
        assert!(replicator.status().error().unwrap().contains("cannot read blob"));
        assert!(capture.blocks.lock().is_empty());
    }

    #[test]
    fn test_poisoned_after_flush_still_ends() {
        let (replicator, capture) = setup_with(1024, TableFilter::allow_all(), Arc::new(NoBlobs));
        let mut txn = replicator.start_transaction(TxnId::new(8));
        txn.insert("BIG", &Record::new(vec![0u8; 600])).unwrap();
        txn.insert("BIG", &Record::new(vec![1u8; 600])).unwrap();
        assert_eq!(txn.batch().flush_count(), 1);

        txn.delete("BIG", &Record::new(&b"unshipped"[..])).unwrap();
        assert!(txn
            .insert("BIG", &Record::new(&b"x"[..]).with_blob(BlobId::new(1, 9)))
            .is_err());
        assert!(txn.is_poisoned());

        txn.rollback().unwrap();
        replicator.manager().shutdown().unwrap();

        let blocks = capture.decoded();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].is_begin() && !blocks[0].is_end());
        assert!(!blocks[1].is_begin() && blocks[1].is_end());
        assert_eq!(
            blocks[1].operations().unwrap(),
            vec![Operation::RollbackTransaction]
        );
    }

    #[test]
    fn test_poisoned_before_flush_ships_nothing() {
        let (replicator, capture) = setup();
        let mut txn = replicator.start_transaction(TxnId::new(9));
        txn.insert("A", &Record::new(&b"1"[..])).unwrap();
        assert!(txn
            .insert("A", &Record::new(&b"2"[..]).with_blob(BlobId::new(1, 1)))
            .is_err());

        assert!(matches!(txn.cleanup(), Err(ReplicatorError::Poisoned { .. })));
        replicator.manager().shutdown().unwrap();
        assert!(capture.blocks.lock().is_empty());
    }

    #[test]
    fn test_overflow_flushes_early() {
        let (replicator, capture) = setup_with(1024, TableFilter::allow_all(), Arc::new(NoBlobs));
        let mut txn = replicator.start_transaction(TxnId::new(6));
        for _ in 0..4 {
            txn.insert("BIG", &Record::new(vec![0u8; 600])).unwrap();
        }
        txn.commit().unwrap();

        let blocks = capture.decoded();
        assert!(blocks.len() >= 2);
        assert!(blocks[0].is_begin());
        assert!(blocks[1..].iter().all(|b| !b.is_begin()));
        assert!(blocks.last().unwrap().is_end());

        let inserts = blocks
            .iter()
            .flat_map(|b| b.operations().unwrap())
            .filter(|op| matches!(op, Operation::InsertRecord { .. }))
            .count();
        assert_eq!(inserts, 4);
    }

    #[test]
    fn test_failed_commit_is_reported() {
        let (replicator, capture) = setup();
        capture.failing.store(true, Ordering::SeqCst);

        let mut txn = replicator.start_transaction(TxnId::new(7));
        txn.insert("A", &Record::new(&b"1"[..])).unwrap();
        let err = txn.commit().unwrap_err();
        assert!(err.is_delivery());
        assert!(replicator.status().error().is_some());

        replicator.status().clear();
        assert!(replicator.status().is_ok());
    }
}
