//! Block header and block framing.
//!
//! The header is a fixed 36-byte structure that precedes every block.

use bytes::{Buf, BufMut, Bytes};
use replog_common::TxnId;

use super::names::{decode_names, encode_names};
use super::ops::{decode_operations, Operation};
use crate::error::{JournalError, JournalResult};

/// Version of the operation encoding carried by each block.
pub const BLOCK_PROTOCOL_VERSION: u32 = 2;

bitflags::bitflags! {
    /// Transaction boundary flags of a block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BlockFlags: u32 {
        /// First block of a transaction.
        const BEGIN_TRANSACTION = 0b0000_0001;
        /// Last block of a transaction.
        const END_TRANSACTION = 0b0000_0010;
    }
}

/// Block header (36 bytes).
///
/// Layout:
/// - txn_id: 8 bytes
/// - protocol: 4 bytes
/// - data_length: 4 bytes
/// - meta_length: 4 bytes
/// - flags: 4 bytes
/// - timestamp: 8 bytes (microseconds since the Unix epoch)
/// - checksum: 4 bytes (CRC32 of the other fields, the data and the names)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Transaction that produced the block.
    pub txn_id: TxnId,
    /// Operation encoding version.
    pub protocol: u32,
    /// Length of the encoded operations.
    pub data_length: u32,
    /// Length of the name table.
    pub meta_length: u32,
    /// Transaction boundary flags.
    pub flags: BlockFlags,
    /// Time the block was flushed.
    pub timestamp: u64,
    /// CRC32 checksum.
    pub checksum: u32,
}

impl BlockHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 36;

    /// Serializes the header.
    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.txn_id.as_u64());
        buf.put_u32_le(self.protocol);
        buf.put_u32_le(self.data_length);
        buf.put_u32_le(self.meta_length);
        buf.put_u32_le(self.flags.bits());
        buf.put_u64_le(self.timestamp);
        buf.put_u32_le(self.checksum);
    }

    /// Serializes the header to a byte array.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut cursor = &mut buf[..];
        self.serialize(&mut cursor);
        buf
    }

    /// Deserializes a header.
    pub fn deserialize(buf: &mut impl Buf) -> JournalResult<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(JournalError::decode(format!(
                "not enough bytes for block header: {} < {}",
                buf.remaining(),
                Self::SIZE
            )));
        }

        Ok(Self {
            txn_id: TxnId::new(buf.get_u64_le()),
            protocol: buf.get_u32_le(),
            data_length: buf.get_u32_le(),
            meta_length: buf.get_u32_le(),
            flags: BlockFlags::from_bits_truncate(buf.get_u32_le()),
            timestamp: buf.get_u64_le(),
            checksum: buf.get_u32_le(),
        })
    }

    /// Deserializes a header from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> JournalResult<Self> {
        Self::deserialize(&mut &bytes[..])
    }

    /// Length of the payload that follows the header.
    pub fn payload_size(&self) -> u64 {
        u64::from(self.data_length) + u64::from(self.meta_length)
    }

    /// Total block size (header + data + names).
    pub fn total_size(&self) -> u64 {
        Self::SIZE as u64 + self.payload_size()
    }

    /// Computes the checksum over the header fields, the data and the names.
    pub fn compute_checksum(&self, data: &[u8], meta: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.to_bytes()[..Self::SIZE - 4]);
        hasher.update(data);
        hasher.update(meta);
        hasher.finalize()
    }

    /// Verifies the checksum.
    pub fn verify_checksum(&self, data: &[u8], meta: &[u8]) -> bool {
        self.checksum == self.compute_checksum(data, meta)
    }
}

/// Appends one framed block to `out`.
///
/// Returns the number of bytes appended.
pub fn encode_block_into(
    out: &mut Vec<u8>,
    txn_id: TxnId,
    flags: BlockFlags,
    timestamp: u64,
    data: &[u8],
    names: &[String],
) -> usize {
    let start = out.len();
    out.resize(start + BlockHeader::SIZE, 0);
    out.extend_from_slice(data);
    let meta_start = out.len();
    encode_names(out, names);

    let mut header = BlockHeader {
        txn_id,
        protocol: BLOCK_PROTOCOL_VERSION,
        data_length: data.len() as u32,
        meta_length: (out.len() - meta_start) as u32,
        flags,
        timestamp,
        checksum: 0,
    };
    header.checksum =
        header.compute_checksum(&out[start + BlockHeader::SIZE..meta_start], &out[meta_start..]);
    out[start..start + BlockHeader::SIZE].copy_from_slice(&header.to_bytes());

    out.len() - start
}

/// A decoded block.
#[derive(Debug, Clone)]
pub struct Block {
    /// Block header.
    pub header: BlockHeader,
    /// Encoded operations.
    pub data: Bytes,
    /// Names referenced by the operations.
    pub names: Vec<String>,
}

impl Block {
    /// Decodes a framed block and verifies its checksum.
    ///
    /// `offset` is only used for error reporting.
    pub fn decode(bytes: &[u8], offset: u64) -> JournalResult<Self> {
        let header = BlockHeader::from_bytes(bytes)?;
        if header.protocol != BLOCK_PROTOCOL_VERSION {
            return Err(JournalError::decode(format!(
                "unsupported block protocol {} at offset {}",
                header.protocol, offset
            )));
        }

        let total = header.total_size();
        if (bytes.len() as u64) < total {
            return Err(JournalError::decode(format!(
                "truncated block at offset {}: {} < {}",
                offset,
                bytes.len(),
                total
            )));
        }

        let data_end = BlockHeader::SIZE + header.data_length as usize;
        let data = &bytes[BlockHeader::SIZE..data_end];
        let meta = &bytes[data_end..total as usize];

        let computed = header.compute_checksum(data, meta);
        if computed != header.checksum {
            return Err(JournalError::ChecksumMismatch {
                offset,
                expected: header.checksum,
                computed,
            });
        }

        Ok(Self {
            header,
            data: Bytes::copy_from_slice(data),
            names: decode_names(meta)?,
        })
    }

    /// Returns the transaction that produced the block.
    pub fn txn_id(&self) -> TxnId {
        self.header.txn_id
    }

    /// Returns true if the block starts a transaction.
    pub fn is_begin(&self) -> bool {
        self.header.flags.contains(BlockFlags::BEGIN_TRANSACTION)
    }

    /// Returns true if the block ends a transaction.
    pub fn is_end(&self) -> bool {
        self.header.flags.contains(BlockFlags::END_TRANSACTION)
    }

    /// Decodes the operations of the block.
    pub fn operations(&self) -> JournalResult<Vec<Operation>> {
        decode_operations(&self.data, &self.names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ops::{OpTag, OpWriter};

    fn sample_block(flags: BlockFlags) -> Vec<u8> {
        let mut data = Vec::new();
        let mut writer = OpWriter::new(&mut data);
        writer.tag(OpTag::StartTransaction);
        writer.insert(0, b"row-1");
        writer.tag(OpTag::CommitTransaction);

        let mut out = Vec::new();
        encode_block_into(
            &mut out,
            TxnId::new(42),
            flags,
            1_700_000_000_000_000,
            &data,
            &["CUSTOMERS".to_string()],
        );
        out
    }

    #[test]
    fn test_header_size() {
        let header = BlockHeader {
            txn_id: TxnId::new(1),
            protocol: BLOCK_PROTOCOL_VERSION,
            data_length: 10,
            meta_length: 4,
            flags: BlockFlags::empty(),
            timestamp: 0,
            checksum: 0,
        };
        assert_eq!(header.to_bytes().len(), BlockHeader::SIZE);
        assert_eq!(header.total_size(), 50);
    }

    #[test]
    fn test_block_decode() {
        let bytes = sample_block(BlockFlags::BEGIN_TRANSACTION | BlockFlags::END_TRANSACTION);
        let block = Block::decode(&bytes, 0).unwrap();

        assert_eq!(block.txn_id(), TxnId::new(42));
        assert!(block.is_begin());
        assert!(block.is_end());
        assert_eq!(block.header.total_size(), bytes.len() as u64);
        assert_eq!(block.names, vec!["CUSTOMERS".to_string()]);

        let ops = block.operations().unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(
            ops[1],
            Operation::InsertRecord {
                table: "CUSTOMERS".to_string(),
                record: Bytes::from_static(b"row-1"),
            }
        );
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut bytes = sample_block(BlockFlags::BEGIN_TRANSACTION);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let err = Block::decode(&bytes, 128).unwrap_err();
        assert!(matches!(err, JournalError::ChecksumMismatch { offset: 128, .. }));
    }

    #[test]
    fn test_truncated_block() {
        let bytes = sample_block(BlockFlags::empty());
        let err = Block::decode(&bytes[..bytes.len() - 3], 0).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_blocks_are_appended() {
        let mut out = Vec::new();
        let first = encode_block_into(&mut out, TxnId::new(1), BlockFlags::empty(), 0, b"", &[]);
        let second = encode_block_into(&mut out, TxnId::new(2), BlockFlags::empty(), 0, b"", &[]);
        assert_eq!(out.len(), first + second);

        let block = Block::decode(&out[first..], first as u64).unwrap();
        assert_eq!(block.txn_id(), TxnId::new(2));
    }
}
