//! Operation tags and their encoding.

use std::fmt;

use bytes::{Buf, BufMut, Bytes};
use replog_common::constants::MAX_BLOB_CHUNK;

use crate::error::{JournalError, JournalResult};

/// Operation tag identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpTag {
    /// Transaction started.
    StartTransaction = 1,
    /// Transaction prepared for two-phase commit.
    PrepareTransaction = 2,
    /// Transaction committed.
    CommitTransaction = 3,
    /// Transaction rolled back.
    RollbackTransaction = 4,
    /// Transaction cleaned up after a failure.
    CleanupTransaction = 5,
    /// Savepoint started.
    StartSavepoint = 6,
    /// Savepoint released.
    ReleaseSavepoint = 7,
    /// Savepoint rolled back.
    RollbackSavepoint = 8,
    /// Record inserted.
    InsertRecord = 9,
    /// Record updated.
    UpdateRecord = 10,
    /// Record deleted.
    DeleteRecord = 11,
    /// Blob contents stored.
    StoreBlob = 12,
    /// SQL statement executed.
    ExecuteSql = 13,
    /// SQL statement executed with an explicit character set.
    ExecuteSqlIntl = 14,
    /// Sequence value changed.
    SetSequence = 15,
}

impl OpTag {
    /// Converts the tag to a u8.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Creates a tag from a u8.
    pub fn from_u8(value: u8) -> JournalResult<Self> {
        match value {
            1 => Ok(Self::StartTransaction),
            2 => Ok(Self::PrepareTransaction),
            3 => Ok(Self::CommitTransaction),
            4 => Ok(Self::RollbackTransaction),
            5 => Ok(Self::CleanupTransaction),
            6 => Ok(Self::StartSavepoint),
            7 => Ok(Self::ReleaseSavepoint),
            8 => Ok(Self::RollbackSavepoint),
            9 => Ok(Self::InsertRecord),
            10 => Ok(Self::UpdateRecord),
            11 => Ok(Self::DeleteRecord),
            12 => Ok(Self::StoreBlob),
            13 => Ok(Self::ExecuteSql),
            14 => Ok(Self::ExecuteSqlIntl),
            15 => Ok(Self::SetSequence),
            _ => Err(JournalError::decode(format!(
                "unknown operation tag: {}",
                value
            ))),
        }
    }

    /// Returns true if the tag changes a record.
    pub const fn is_record_change(self) -> bool {
        matches!(
            self,
            Self::InsertRecord | Self::UpdateRecord | Self::DeleteRecord
        )
    }
}

/// Identity of a blob inside the primary database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId {
    /// Relation owning the blob.
    pub relation: u32,
    /// Blob number within the relation.
    pub number: u64,
}

impl BlobId {
    /// Creates a blob id.
    pub const fn new(relation: u32, number: u64) -> Self {
        Self { relation, number }
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.relation, self.number)
    }
}

/// A decoded operation with its names resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Transaction started.
    StartTransaction,
    /// Transaction prepared.
    PrepareTransaction,
    /// Transaction committed.
    CommitTransaction,
    /// Transaction rolled back.
    RollbackTransaction,
    /// Transaction cleaned up.
    CleanupTransaction,
    /// Savepoint started.
    StartSavepoint,
    /// Savepoint released.
    ReleaseSavepoint,
    /// Savepoint rolled back.
    RollbackSavepoint,
    /// Record inserted.
    InsertRecord {
        /// Table name.
        table: String,
        /// Record image.
        record: Bytes,
    },
    /// Record updated.
    UpdateRecord {
        /// Table name.
        table: String,
        /// Record image before the update.
        old: Bytes,
        /// Record image after the update.
        new: Bytes,
    },
    /// Record deleted.
    DeleteRecord {
        /// Table name.
        table: String,
        /// Image of the deleted record.
        record: Bytes,
    },
    /// Blob contents stored.
    StoreBlob {
        /// Blob identity.
        blob: BlobId,
        /// Blob contents, chunks concatenated.
        data: Bytes,
    },
    /// SQL statement executed.
    ExecuteSql {
        /// User that executed the statement.
        user: String,
        /// Statement text.
        sql: String,
    },
    /// SQL statement executed with an explicit character set.
    ExecuteSqlIntl {
        /// Character set of the statement text.
        charset: u8,
        /// User that executed the statement.
        user: String,
        /// Statement text.
        sql: String,
    },
    /// Sequence value changed.
    SetSequence {
        /// Sequence name.
        name: String,
        /// New value.
        value: i64,
    },
}

impl Operation {
    /// Returns the tag of the operation.
    pub fn tag(&self) -> OpTag {
        match self {
            Self::StartTransaction => OpTag::StartTransaction,
            Self::PrepareTransaction => OpTag::PrepareTransaction,
            Self::CommitTransaction => OpTag::CommitTransaction,
            Self::RollbackTransaction => OpTag::RollbackTransaction,
            Self::CleanupTransaction => OpTag::CleanupTransaction,
            Self::StartSavepoint => OpTag::StartSavepoint,
            Self::ReleaseSavepoint => OpTag::ReleaseSavepoint,
            Self::RollbackSavepoint => OpTag::RollbackSavepoint,
            Self::InsertRecord { .. } => OpTag::InsertRecord,
            Self::UpdateRecord { .. } => OpTag::UpdateRecord,
            Self::DeleteRecord { .. } => OpTag::DeleteRecord,
            Self::StoreBlob { .. } => OpTag::StoreBlob,
            Self::ExecuteSql { .. } => OpTag::ExecuteSql,
            Self::ExecuteSqlIntl { .. } => OpTag::ExecuteSqlIntl,
            Self::SetSequence { .. } => OpTag::SetSequence,
        }
    }
}

/// Appends encoded operations to a payload buffer.
///
/// Names are written as indexes into the block's name table; resolving them
/// is up to the caller.
pub struct OpWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> OpWriter<'a> {
    /// Creates a writer appending to `buf`.
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    /// Appends an operation that has no body.
    pub fn tag(&mut self, tag: OpTag) {
        self.buf.put_u8(tag.as_u8());
    }

    /// Appends an insert.
    pub fn insert(&mut self, table: u32, record: &[u8]) {
        self.tag(OpTag::InsertRecord);
        self.buf.put_u32_le(table);
        self.put_bytes(record);
    }

    /// Appends an update.
    pub fn update(&mut self, table: u32, old: &[u8], new: &[u8]) {
        self.tag(OpTag::UpdateRecord);
        self.buf.put_u32_le(table);
        self.put_bytes(old);
        self.put_bytes(new);
    }

    /// Appends a delete.
    pub fn delete(&mut self, table: u32, record: &[u8]) {
        self.tag(OpTag::DeleteRecord);
        self.buf.put_u32_le(table);
        self.put_bytes(record);
    }

    /// Appends blob contents split into chunks, ending with an empty chunk.
    pub fn store_blob(&mut self, blob: BlobId, data: &[u8]) {
        self.tag(OpTag::StoreBlob);
        self.buf.put_u32_le(blob.relation);
        self.buf.put_u64_le(blob.number);
        for chunk in data.chunks(MAX_BLOB_CHUNK) {
            self.buf.put_u16_le(chunk.len() as u16);
            self.buf.put_slice(chunk);
        }
        self.buf.put_u16_le(0);
    }

    /// Appends an SQL statement.
    pub fn execute_sql(&mut self, user: u32, sql: &str) {
        self.tag(OpTag::ExecuteSql);
        self.buf.put_u32_le(user);
        self.put_bytes(sql.as_bytes());
    }

    /// Appends an SQL statement with an explicit character set.
    pub fn execute_sql_intl(&mut self, charset: u8, user: u32, sql: &str) {
        self.tag(OpTag::ExecuteSqlIntl);
        self.buf.put_u8(charset);
        self.buf.put_u32_le(user);
        self.put_bytes(sql.as_bytes());
    }

    /// Appends a sequence change.
    pub fn set_sequence(&mut self, name: u32, value: i64) {
        self.tag(OpTag::SetSequence);
        self.buf.put_u32_le(name);
        self.buf.put_i64_le(value);
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_u32_le(bytes.len() as u32);
        self.buf.put_slice(bytes);
    }
}

/// Cursor over an encoded payload.
struct OpReader<'a> {
    buf: &'a [u8],
    names: &'a [String],
}

impl<'a> OpReader<'a> {
    fn need(&self, len: usize, what: &str) -> JournalResult<()> {
        if self.buf.remaining() < len {
            return Err(JournalError::decode(format!(
                "truncated {}: need {} bytes, {} left",
                what,
                len,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self, what: &str) -> JournalResult<u8> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self, what: &str) -> JournalResult<u32> {
        self.need(4, what)?;
        Ok(self.buf.get_u32_le())
    }

    fn name(&mut self, what: &str) -> JournalResult<String> {
        let index = self.u32(what)? as usize;
        self.names.get(index).cloned().ok_or_else(|| {
            JournalError::decode(format!(
                "{} refers to name {} but the block has {} names",
                what,
                index,
                self.names.len()
            ))
        })
    }

    fn bytes(&mut self, what: &str) -> JournalResult<Bytes> {
        let len = self.u32(what)? as usize;
        self.need(len, what)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    fn text(&mut self, what: &str) -> JournalResult<String> {
        let bytes = self.bytes(what)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| JournalError::decode(format!("{} is not UTF-8: {}", what, e)))
    }

    fn blob(&mut self) -> JournalResult<Operation> {
        self.need(12, "blob id")?;
        let blob = BlobId::new(self.buf.get_u32_le(), self.buf.get_u64_le());
        let mut data = Vec::new();
        loop {
            self.need(2, "blob chunk")?;
            let len = self.buf.get_u16_le() as usize;
            if len == 0 {
                break;
            }
            self.need(len, "blob chunk")?;
            data.extend_from_slice(&self.buf[..len]);
            self.buf.advance(len);
        }
        Ok(Operation::StoreBlob {
            blob,
            data: Bytes::from(data),
        })
    }

    fn next(&mut self) -> JournalResult<Operation> {
        let op = match OpTag::from_u8(self.u8("operation tag")?)? {
            OpTag::StartTransaction => Operation::StartTransaction,
            OpTag::PrepareTransaction => Operation::PrepareTransaction,
            OpTag::CommitTransaction => Operation::CommitTransaction,
            OpTag::RollbackTransaction => Operation::RollbackTransaction,
            OpTag::CleanupTransaction => Operation::CleanupTransaction,
            OpTag::StartSavepoint => Operation::StartSavepoint,
            OpTag::ReleaseSavepoint => Operation::ReleaseSavepoint,
            OpTag::RollbackSavepoint => Operation::RollbackSavepoint,
            OpTag::InsertRecord => Operation::InsertRecord {
                table: self.name("insert table")?,
                record: self.bytes("insert record")?,
            },
            OpTag::UpdateRecord => Operation::UpdateRecord {
                table: self.name("update table")?,
                old: self.bytes("update old record")?,
                new: self.bytes("update new record")?,
            },
            OpTag::DeleteRecord => Operation::DeleteRecord {
                table: self.name("delete table")?,
                record: self.bytes("delete record")?,
            },
            OpTag::StoreBlob => self.blob()?,
            OpTag::ExecuteSql => Operation::ExecuteSql {
                user: self.name("statement user")?,
                sql: self.text("statement text")?,
            },
            OpTag::ExecuteSqlIntl => Operation::ExecuteSqlIntl {
                charset: self.u8("statement charset")?,
                user: self.name("statement user")?,
                sql: self.text("statement text")?,
            },
            OpTag::SetSequence => {
                let name = self.name("sequence name")?;
                self.need(8, "sequence value")?;
                Operation::SetSequence {
                    name,
                    value: self.buf.get_i64_le(),
                }
            }
        };
        Ok(op)
    }
}

/// Decodes every operation of a block payload.
pub fn decode_operations(data: &[u8], names: &[String]) -> JournalResult<Vec<Operation>> {
    let mut reader = OpReader { buf: data, names };
    let mut ops = Vec::new();
    while reader.buf.has_remaining() {
        ops.push(reader.next()?);
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["ORDERS".to_string(), "SYSDBA".to_string(), "GEN_ORDER".to_string()]
    }

    #[test]
    fn test_tag_values() {
        assert_eq!(OpTag::StartTransaction.as_u8(), 1);
        assert_eq!(OpTag::SetSequence.as_u8(), 15);
        for value in 1..=15u8 {
            assert_eq!(OpTag::from_u8(value).unwrap().as_u8(), value);
        }
        assert!(OpTag::from_u8(0).is_err());
        assert!(OpTag::from_u8(16).is_err());
        assert!(OpTag::UpdateRecord.is_record_change());
        assert!(!OpTag::StoreBlob.is_record_change());
    }

    #[test]
    fn test_decode_mixed_payload() {
        let mut data = Vec::new();
        let mut writer = OpWriter::new(&mut data);
        writer.tag(OpTag::StartTransaction);
        writer.update(0, b"old", b"new");
        writer.execute_sql_intl(4, 1, "CREATE TABLE T (ID INT)");
        writer.set_sequence(2, -17);
        writer.tag(OpTag::CommitTransaction);

        let ops = decode_operations(&data, &names()).unwrap();
        assert_eq!(
            ops,
            vec![
                Operation::StartTransaction,
                Operation::UpdateRecord {
                    table: "ORDERS".to_string(),
                    old: Bytes::from_static(b"old"),
                    new: Bytes::from_static(b"new"),
                },
                Operation::ExecuteSqlIntl {
                    charset: 4,
                    user: "SYSDBA".to_string(),
                    sql: "CREATE TABLE T (ID INT)".to_string(),
                },
                Operation::SetSequence {
                    name: "GEN_ORDER".to_string(),
                    value: -17,
                },
                Operation::CommitTransaction,
            ]
        );
        assert_eq!(ops[1].tag(), OpTag::UpdateRecord);
    }

    #[test]
    fn test_blob_chunking() {
        let contents: Vec<u8> = (0..MAX_BLOB_CHUNK * 2 + 10).map(|i| i as u8).collect();
        let mut data = Vec::new();
        OpWriter::new(&mut data).store_blob(BlobId::new(7, 99), &contents);

        // tag + id + three chunks with prefixes + terminator
        assert_eq!(data.len(), 1 + 12 + contents.len() + 3 * 2 + 2);

        let ops = decode_operations(&data, &[]).unwrap();
        assert_eq!(
            ops,
            vec![Operation::StoreBlob {
                blob: BlobId::new(7, 99),
                data: Bytes::from(contents),
            }]
        );
    }

    #[test]
    fn test_empty_blob() {
        let mut data = Vec::new();
        OpWriter::new(&mut data).store_blob(BlobId::new(1, 1), &[]);
        let ops = decode_operations(&data, &[]).unwrap();
        assert!(matches!(&ops[0], Operation::StoreBlob { data, .. } if data.is_empty()));
    }

    #[test]
    fn test_unknown_name_index() {
        let mut data = Vec::new();
        OpWriter::new(&mut data).delete(5, b"row");
        let err = decode_operations(&data, &names()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_truncated_payload() {
        let mut data = Vec::new();
        OpWriter::new(&mut data).insert(0, b"a fairly long record image");
        data.truncate(data.len() - 4);
        assert!(decode_operations(&data, &names()).is_err());
    }
}
