//! Journal record encoding.
//!
//! A block is the unit written to the journal: one header, the encoded
//! operations of a single transaction, and the table of names they refer to.

pub mod block;
pub mod names;
pub mod ops;

pub use block::{encode_block_into, Block, BlockFlags, BlockHeader, BLOCK_PROTOCOL_VERSION};
pub use ops::{decode_operations, BlobId, OpTag, OpWriter, Operation};
