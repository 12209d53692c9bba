//! Name table appended to every block.
//!
//! Operations refer to table, user and sequence names by their index in this
//! table, so each distinct name is stored once per block.

use bytes::{Buf, BufMut};

use crate::error::{JournalError, JournalResult};

/// Appends a name table: a count followed by length-prefixed UTF-8 names.
pub fn encode_names(out: &mut Vec<u8>, names: &[String]) {
    out.put_u32_le(names.len() as u32);
    for name in names {
        out.put_u32_le(name.len() as u32);
        out.put_slice(name.as_bytes());
    }
}

/// Decodes a name table.
pub fn decode_names(mut buf: &[u8]) -> JournalResult<Vec<String>> {
    if buf.remaining() < 4 {
        return Err(JournalError::decode("name table is missing its count"));
    }
    let count = buf.get_u32_le() as usize;

    // Every entry needs at least its length prefix.
    if count > buf.remaining() / 4 {
        return Err(JournalError::decode(format!(
            "name table claims {} entries in {} bytes",
            count,
            buf.remaining()
        )));
    }

    let mut names = Vec::with_capacity(count);
    for index in 0..count {
        if buf.remaining() < 4 {
            return Err(JournalError::decode(format!("name {} is truncated", index)));
        }
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(JournalError::decode(format!("name {} is truncated", index)));
        }
        let name = std::str::from_utf8(&buf[..len])
            .map_err(|e| JournalError::decode(format!("name {} is not UTF-8: {}", index, e)))?
            .to_string();
        buf.advance(len);
        names.push(name);
    }

    if buf.has_remaining() {
        return Err(JournalError::decode(format!(
            "{} trailing bytes after name table",
            buf.remaining()
        )));
    }

    Ok(names)
}
