//! Text dump of replayed changes.
//!
//! Used by `replogd` when no database applier is linked in. Each committed
//! operation becomes one line; work of transactions that roll back or stay
//! open is never written.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use replog_common::types::TxnId;
use replog_journal::{Block, Operation};

use crate::applier::Applier;
use crate::error::ApplyResult;

/// Writes committed operations to a text file.
pub struct DumpApplier {
    path: PathBuf,
    out: BufWriter<File>,
    pending: HashMap<TxnId, PendingLines>,
    lines: u64,
}

/// Lines of one open transaction and its savepoint marks.
#[derive(Debug, Default)]
struct PendingLines {
    lines: Vec<String>,
    savepoints: Vec<usize>,
}

impl PendingLines {
    fn apply(&mut self, operation: &Operation) {
        match operation {
            Operation::StartSavepoint => self.savepoints.push(self.lines.len()),
            Operation::ReleaseSavepoint => {
                self.savepoints.pop();
            }
            Operation::RollbackSavepoint => {
                if let Some(mark) = self.savepoints.pop() {
                    self.lines.truncate(mark);
                }
            }
            other => self.lines.extend(describe(other)),
        }
    }
}

impl DumpApplier {
    /// Opens `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> ApplyResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
            pending: HashMap::new(),
            lines: 0,
        })
    }

    /// Returns the dump file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of lines written.
    pub fn lines_written(&self) -> u64 {
        self.lines
    }

    fn write_lines(&mut self, txn_id: TxnId, lines: Vec<String>) -> ApplyResult<()> {
        for line in lines {
            writeln!(self.out, "{} {}", txn_id, line)?;
            self.lines += 1;
        }
        self.out.flush()?;
        Ok(())
    }
}

/// Formats one operation, or `None` for transaction control.
fn describe(operation: &Operation) -> Option<String> {
    let line = match operation {
        Operation::InsertRecord { table, record } => {
            format!("INSERT {} ({} bytes)", table, record.len())
        }
        Operation::UpdateRecord { table, old, new } => {
            format!("UPDATE {} ({} -> {} bytes)", table, old.len(), new.len())
        }
        Operation::DeleteRecord { table, record } => {
            format!("DELETE {} ({} bytes)", table, record.len())
        }
        Operation::StoreBlob { blob, data } => format!("BLOB {} ({} bytes)", blob, data.len()),
        Operation::ExecuteSql { user, sql } => format!("SQL [{}] {}", user, sql),
        Operation::ExecuteSqlIntl { charset, user, sql } => {
            format!("SQL [{}, charset {}] {}", user, charset, sql)
        }
        Operation::SetSequence { name, value } => format!("SEQUENCE {} = {}", name, value),
        _ => return None,
    };
    Some(line)
}

impl Applier for DumpApplier {
    fn replica_sequence(&mut self) -> ApplyResult<u64> {
        Ok(0)
    }

    fn apply_block(&mut self, block: &Block, operations: &[Operation]) -> ApplyResult<()> {
        let txn_id = block.txn_id();
        if !txn_id.is_valid() {
            let lines = operations.iter().filter_map(describe).collect();
            return self.write_lines(txn_id, lines);
        }

        for operation in operations {
            match operation {
                Operation::CommitTransaction => {
                    let pending = self.pending.remove(&txn_id).unwrap_or_default();
                    self.write_lines(txn_id, pending.lines)?;
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
        if let Err(e) = self.out.flush() {
            tracing::warn!("cannot flush {}: {}", self.path.display(), e);
        }
    }
}

impl std::fmt::Debug for DumpApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DumpApplier")
            .field("path", &self.path)
            .field("lines", &self.lines)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replog_journal::{encode_block_into, BlockFlags, OpTag, OpWriter};
    use tempfile::TempDir;

    fn apply(dump: &mut DumpApplier, txn: u64, build: impl FnOnce(&mut OpWriter<'_>)) {
        let mut data = Vec::new();
        build(&mut OpWriter::new(&mut data));
        let mut out = Vec::new();
        encode_block_into(
            &mut out,
            TxnId::new(txn),
            BlockFlags::END_TRANSACTION,
            0,
            &data,
            &["ORDERS".to_string(), "SYSDBA".to_string()],
        );
        let block = Block::decode(&out, 0).unwrap();
        let ops = block.operations().unwrap();
        dump.apply_block(&block, &ops).unwrap();
    }

    #[test]
    fn test_committed_lines_only() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out").join("replica.dump");
        let mut dump = DumpApplier::open(&path).unwrap();

        apply(&mut dump, 1, |w| {
            w.tag(OpTag::StartTransaction);
            w.insert(0, b"abc");
            w.update(0, b"abc", b"abcd");
            w.execute_sql(1, "DELETE FROM ORDERS");
            w.tag(OpTag::CommitTransaction);
        });
        apply(&mut dump, 2, |w| {
            w.tag(OpTag::StartTransaction);
            w.delete(0, b"gone");
            w.tag(OpTag::RollbackTransaction);
        });
        apply(&mut dump, 3, |w| w.insert(0, b"open"));
        dump.discard();

        assert_eq!(dump.lines_written(), 3);
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("INSERT ORDERS (3 bytes)"));
        assert!(lines[1].ends_with("UPDATE ORDERS (3 -> 4 bytes)"));
        assert!(lines[2].ends_with("SQL [SYSDBA] DELETE FROM ORDERS"));
        assert!(!content.contains("gone"));
        assert!(!content.contains("DELETE ORDERS"));
    }

    #[test]
    fn test_savepoint_rollback_not_written() {
        let tmp = TempDir::new().unwrap();
        let mut dump = DumpApplier::open(tmp.path().join("replica.dump")).unwrap();

        apply(&mut dump, 1, |w| {
            w.tag(OpTag::StartTransaction);
            w.insert(0, b"kept");
            w.tag(OpTag::StartSavepoint);
            w.insert(0, b"undone!");
            w.tag(OpTag::RollbackSavepoint);
            w.tag(OpTag::StartSavepoint);
            w.insert(0, b"released");
            w.tag(OpTag::ReleaseSavepoint);
            w.tag(OpTag::CommitTransaction);
        });

        assert_eq!(dump.lines_written(), 2);
        let content = std::fs::read_to_string(dump.path()).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines, vec!["1 INSERT ORDERS (4 bytes)", "1 INSERT ORDERS (8 bytes)"]);
    }

    #[test]
    fn test_savepoint_spans_blocks() {
        let tmp = TempDir::new().unwrap();
        let mut dump = DumpApplier::open(tmp.path().join("replica.dump")).unwrap();

        apply(&mut dump, 4, |w| {
            w.tag(OpTag::StartTransaction);
            w.insert(0, b"a");
            w.tag(OpTag::StartSavepoint);
            w.insert(0, b"bb");
        });
        apply(&mut dump, 4, |w| {
            w.tag(OpTag::RollbackSavepoint);
            w.insert(0, b"ccc");
            w.tag(OpTag::CommitTransaction);
        });

        let content = std::fs::read_to_string(dump.path()).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines, vec!["4 INSERT ORDERS (1 bytes)", "4 INSERT ORDERS (3 bytes)"]);
    }

    #[test]
    fn test_autonomous_written_immediately() {
        let tmp = TempDir::new().unwrap();
        let mut dump = DumpApplier::open(tmp.path().join("replica.dump")).unwrap();
        apply(&mut dump, 0, |w| w.set_sequence(0, 17));
        assert_eq!(dump.lines_written(), 1);
        let content = std::fs::read_to_string(dump.path()).unwrap();
        assert!(content.contains("SEQUENCE ORDERS = 17"));
    }
}
