//! In-memory accumulation of one transaction's operations.

use std::collections::HashMap;

use replog_common::types::{now_micros, TxnId};
use replog_journal::{encode_block_into, BlobId, BlockFlags, OpTag, OpWriter};

/// Assigns ids to the names used by the operations of one block.
#[derive(Debug, Default)]
pub struct NameDictionary {
    names: Vec<String>,
    ids: HashMap<String, u32>,
    last: Option<u32>,
    fast_hits: u64,
}

impl NameDictionary {
    /// Creates an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id of `name`, assigning the next one on first use.
    pub fn id(&mut self, name: &str) -> u32 {
        if let Some(last) = self.last {
            if self.names[last as usize] == name {
                self.fast_hits += 1;
                return last;
            }
        }

        let id = match self.ids.get(name) {
            Some(&id) => id,
            None => {
                let id = self.names.len() as u32;
                self.names.push(name.to_string());
                self.ids.insert(name.to_string(), id);
                id
            }
        };
        self.last = Some(id);
        id
    }

    /// Returns the names in id order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of lookups answered by the last-used entry.
    pub fn fast_hits(&self) -> u64 {
        self.fast_hits
    }

    /// Returns true if no name was assigned.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Forgets every name.
    pub fn clear(&mut self) {
        self.names.clear();
        self.ids.clear();
        self.last = None;
    }
}

/// The block being built for one transaction.
#[derive(Debug)]
pub struct Batch {
    txn_id: TxnId,
    payload: Vec<u8>,
    names: NameDictionary,
    /// Blocks already flushed for this transaction.
    flushes: u32,
    /// Operations in the current block.
    operations: u32,
}

impl Batch {
    /// Creates an empty batch.
    pub fn new(txn_id: TxnId) -> Self {
        Self {
            txn_id,
            payload: Vec::new(),
            names: NameDictionary::new(),
            flushes: 0,
            operations: 0,
        }
    }

    /// Returns the owning transaction.
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Number of blocks flushed so far.
    pub fn flush_count(&self) -> u32 {
        self.flushes
    }

    /// Number of operations in the current block.
    pub fn operation_count(&self) -> u32 {
        self.operations
    }

    /// Size of the encoded operations of the current block.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Returns the name dictionary of the current block.
    pub fn names(&self) -> &NameDictionary {
        &self.names
    }

    /// Appends an operation without a body.
    pub fn push_tag(&mut self, tag: OpTag) {
        OpWriter::new(&mut self.payload).tag(tag);
        self.operations += 1;
    }

    /// Appends an insert.
    pub fn insert(&mut self, table: &str, record: &[u8]) {
        let id = self.names.id(table);
        OpWriter::new(&mut self.payload).insert(id, record);
        self.operations += 1;
    }

    /// Appends an update.
    pub fn update(&mut self, table: &str, old: &[u8], new: &[u8]) {
        let id = self.names.id(table);
        OpWriter::new(&mut self.payload).update(id, old, new);
        self.operations += 1;
    }

    /// Appends a delete.
    pub fn delete(&mut self, table: &str, record: &[u8]) {
        let id = self.names.id(table);
        OpWriter::new(&mut self.payload).delete(id, record);
        self.operations += 1;
    }

    /// Appends blob contents.
    pub fn store_blob(&mut self, blob: BlobId, data: &[u8]) {
        OpWriter::new(&mut self.payload).store_blob(blob, data);
        self.operations += 1;
    }

    /// Appends an SQL statement. Character set `0` means none.
    pub fn execute_sql(&mut self, sql: &str, user: &str, charset: u8) {
        let id = self.names.id(user);
        let mut writer = OpWriter::new(&mut self.payload);
        if charset == 0 {
            writer.execute_sql(id, sql);
        } else {
            writer.execute_sql_intl(charset, id, sql);
        }
        self.operations += 1;
    }

    /// Appends a sequence change.
    pub fn set_sequence(&mut self, name: &str, value: i64) {
        let id = self.names.id(name);
        OpWriter::new(&mut self.payload).set_sequence(id, value);
        self.operations += 1;
    }

    /// Drops the operations of the current block.
    pub fn discard_pending(&mut self) {
        self.payload.clear();
        self.names.clear();
        self.operations = 0;
    }

    /// Frames the current block into `out` and starts a new one.
    ///
    /// The first block of a transaction carries `BEGIN_TRANSACTION`; `end`
    /// marks the last one.
    pub fn encode_block(&mut self, out: &mut Vec<u8>, end: bool) -> usize {
        let mut flags = BlockFlags::empty();
        if self.flushes == 0 {
            flags |= BlockFlags::BEGIN_TRANSACTION;
        }
        if end {
            flags |= BlockFlags::END_TRANSACTION;
        }

        let written = encode_block_into(
            out,
            self.txn_id,
            flags,
            now_micros(),
            &self.payload,
            self.names.names(),
        );

        self.payload.clear();
        self.names.clear();
        self.operations = 0;
        self.flushes += 1;
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replog_journal::{Block, Operation};

    #[test]
    fn test_dictionary_fast_path() {
        let mut dict = NameDictionary::new();
        assert_eq!(dict.id("T1"), 0);
        assert_eq!(dict.id("T1"), 0);
        assert_eq!(dict.id("T2"), 1);
        assert_eq!(dict.id("T1"), 0);
        assert_eq!(dict.id("T3"), 2);

        assert_eq!(dict.fast_hits(), 1);
        assert_eq!(dict.names(), &["T1", "T2", "T3"]);

        dict.clear();
        assert!(dict.is_empty());
        assert_eq!(dict.id("T3"), 0);
    }

    #[test]
    fn test_names_survive_encoding() {
        let mut batch = Batch::new(TxnId::new(5));
        batch.push_tag(OpTag::StartTransaction);
        batch.insert("A", b"1");
        batch.insert("A", b"2");
        batch.update("B", b"old", b"new");
        batch.delete("A", b"3");
        batch.set_sequence("GEN", 11);
        batch.execute_sql("drop table x", "SYSDBA", 0);
        batch.execute_sql("select 1", "SYSDBA", 4);
        assert_eq!(batch.operation_count(), 8);

        let mut out = Vec::new();
        let len = batch.encode_block(&mut out, true);
        assert_eq!(len, out.len());
        assert_eq!(batch.operation_count(), 0);
        assert_eq!(batch.payload_len(), 0);
        assert_eq!(batch.flush_count(), 1);

        let block = Block::decode(&out, 0).unwrap();
        assert!(block.is_begin());
        assert!(block.is_end());
        assert_eq!(block.names, vec!["A", "B", "GEN", "SYSDBA"]);

        let ops = block.operations().unwrap();
        assert_eq!(ops[0], Operation::StartTransaction);
        let tables: Vec<&str> = ops
            .iter()
            .filter_map(|op| match op {
                Operation::InsertRecord { table, .. }
                | Operation::UpdateRecord { table, .. }
                | Operation::DeleteRecord { table, .. } => Some(table.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(tables, vec!["A", "A", "B", "A"]);
        assert_eq!(
            ops[5],
            Operation::SetSequence {
                name: "GEN".to_string(),
                value: 11
            }
        );
        assert!(matches!(&ops[6], Operation::ExecuteSql { user, .. } if user == "SYSDBA"));
        assert!(matches!(&ops[7], Operation::ExecuteSqlIntl { charset: 4, .. }));
    }

    #[test]
    fn test_only_first_block_begins() {
        let mut batch = Batch::new(TxnId::new(1));
        batch.insert("T", b"a");
        let mut first = Vec::new();
        batch.encode_block(&mut first, false);

        batch.insert("U", b"b");
        let mut second = Vec::new();
        batch.encode_block(&mut second, true);

        let first = Block::decode(&first, 0).unwrap();
        let second = Block::decode(&second, 0).unwrap();
        assert!(first.is_begin() && !first.is_end());
        assert!(!second.is_begin() && second.is_end());

        // Every block carries its own name table.
        assert_eq!(second.names, vec!["U"]);
    }
}
