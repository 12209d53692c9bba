//! The replica side of replay.
//!
//! The engine hands every replicated block to an [`Applier`] together with
//! its decoded operations. The applier owns transaction boundaries on the
//! replica: work of a transaction becomes visible on its commit and is thrown
//! away on rollback or [`discard`](Applier::discard).

use std::collections::{BTreeMap, HashMap};

use replog_common::types::TxnId;
use replog_journal::{Block, Operation};

use crate::error::{ApplyError, ApplyResult};

/// A replica database.
pub trait Applier: Send {
    /// Returns the last journal segment already contained in the replica.
    ///
    /// Segments up to this one are never replayed. The value changes when
    /// the replica is reseeded from a newer copy of the primary.
    fn replica_sequence(&mut self) -> ApplyResult<u64>;

    /// Applies the operations of one block.
    fn apply_block(&mut self, block: &Block, operations: &[Operation]) -> ApplyResult<()>;

    /// Rolls back every transaction still open on the replica.
    fn discard(&mut self);
}

impl<A: Applier + ?Sized> Applier for Box<A> {
    fn replica_sequence(&mut self) -> ApplyResult<u64> {
        (**self).replica_sequence()
    }

    fn apply_block(&mut self, block: &Block, operations: &[Operation]) -> ApplyResult<()> {
        (**self).apply_block(block, operations)
    }

    fn discard(&mut self) {
        (**self).discard()
    }
}

/// Work of one open transaction.
#[derive(Debug, Default)]
struct PendingTransaction {
    operations: Vec<Operation>,
    savepoints: Vec<usize>,
}

impl PendingTransaction {
    fn apply(&mut self, operation: &Operation) {
        match operation {
            Operation::StartTransaction | Operation::PrepareTransaction => {}
            Operation::StartSavepoint => self.savepoints.push(self.operations.len()),
            Operation::ReleaseSavepoint => {
                self.savepoints.pop();
            }
            Operation::RollbackSavepoint => {
                if let Some(mark) = self.savepoints.pop() {
                    self.operations.truncate(mark);
                }
            }
            other => self.operations.push(other.clone()),
        }
    }
}

/// In-memory replica.
///
/// Committed operations are kept in commit order; sequence values are kept
/// by name. Useful for tests and for checking what a journal contains.
#[derive(Debug, Default)]
pub struct MemoryApplier {
    replica_sequence: u64,
    pending: HashMap<TxnId, PendingTransaction>,
    committed: Vec<(TxnId, Operation)>,
    sequences: BTreeMap<String, i64>,
    blocks: u64,
    failure: Option<(u64, String)>,
}

impl MemoryApplier {
    /// Creates an empty replica.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the replica as containing every segment up to `sequence`.
    pub fn set_replica_sequence(&mut self, sequence: u64) {
        self.replica_sequence = sequence;
    }

    /// Makes the next [`apply_block`](Applier::apply_block) call fail.
    pub fn fail_next_block(&mut self, reason: impl Into<String>) {
        self.fail_after(0, reason);
    }

    /// Lets `blocks` more blocks through, then fails the next one once.
    pub fn fail_after(&mut self, blocks: u64, reason: impl Into<String>) {
        self.failure = Some((blocks, reason.into()));
    }

    /// Returns committed operations with the transaction that made them.
    pub fn committed(&self) -> &[(TxnId, Operation)] {
        &self.committed
    }

    /// Returns committed operations of one transaction.
    pub fn committed_by(&self, txn_id: TxnId) -> Vec<&Operation> {
        self.committed
            .iter()
            .filter(|(id, _)| *id == txn_id)
            .map(|(_, op)| op)
            .collect()
    }

    /// Returns the current value of a sequence.
    pub fn sequence(&self, name: &str) -> Option<i64> {
        self.sequences.get(name).copied()
    }

    /// Returns the number of open transactions.
    pub fn open_transactions(&self) -> usize {
        self.pending.len()
    }

    /// Returns the number of blocks applied.
    pub fn blocks_applied(&self) -> u64 {
        self.blocks
    }

    fn commit_operation(&mut self, txn_id: TxnId, operation: Operation) {
        if let Operation::SetSequence { name, value } = &operation {
            self.sequences.insert(name.clone(), *value);
        }
        self.committed.push((txn_id, operation));
    }
}

impl Applier for MemoryApplier {
    fn replica_sequence(&mut self) -> ApplyResult<u64> {
        Ok(self.replica_sequence)
    }

    fn apply_block(&mut self, block: &Block, operations: &[Operation]) -> ApplyResult<()> {
        match self.failure.take() {
            Some((0, reason)) => return Err(ApplyError::applier(reason)),
            Some((left, reason)) => self.failure = Some((left - 1, reason)),
            None => {}
        }
        self.blocks += 1;

        let txn_id = block.txn_id();
        if !txn_id.is_valid() {
            for operation in operations {
                self.commit_operation(txn_id, operation.clone());
            }
            return Ok(());
        }

        for operation in operations {
            match operation {
                Operation::CommitTransaction => {
                    let pending = self.pending.remove(&txn_id).unwrap_or_default();
                    for op in pending.operations {
                        self.commit_operation(txn_id, op);
                    }
                }
                Operation::RollbackTransaction | Operation::CleanupTransaction => {
                    self.pending.remove(&txn_id);
                }
                other => self.pending.entry(txn_id).or_default().apply(other),
            }
        }
        Ok(())
    }

    fn discard(&mut self) {
        self.pending.clear();
    }
}
