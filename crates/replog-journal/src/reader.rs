//! Sequential reader for segment files.
//!
//! Used on the replica side to replay archived segments. Blocks are read up
//! to the logical length recorded in the segment header; anything after it
//! is ignored.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{JournalError, JournalResult};
use crate::record::{Block, BlockHeader};
use crate::segment::SegmentHeader;

/// Reads the blocks of one segment file in order.
pub struct SegmentReader {
    path: PathBuf,
    reader: BufReader<File>,
    header: SegmentHeader,
    /// Offset of the next block.
    offset: u64,
}

impl SegmentReader {
    /// Opens a segment file and validates its header.
    pub fn open(path: impl AsRef<Path>) -> JournalResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut reader = BufReader::new(File::open(&path)?);
        let header = SegmentHeader::read_from_file(&mut reader, &path)?;

        Ok(Self {
            path,
            reader,
            header,
            offset: SegmentHeader::SIZE as u64,
        })
    }

    /// Returns the segment header read at open time.
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Returns the segment path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the offset of the next block.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Positions the reader at `offset`, which must be a block boundary.
    pub fn seek(&mut self, offset: u64) -> JournalResult<()> {
        if offset < SegmentHeader::SIZE as u64 || offset > self.header.length {
            return Err(JournalError::segment_corrupted(
                self.path.clone(),
                format!(
                    "offset {} outside of blocks [{}, {}]",
                    offset,
                    SegmentHeader::SIZE,
                    self.header.length
                ),
            ));
        }
        self.reader.seek(SeekFrom::Start(offset))?;
        self.offset = offset;
        Ok(())
    }

    /// Reads the next block, or `None` at the end of the segment.
    pub fn next_block(&mut self) -> JournalResult<Option<Block>> {
        if self.offset >= self.header.length {
            return Ok(None);
        }

        let remaining = self.header.length - self.offset;
        if remaining < BlockHeader::SIZE as u64 {
            return Err(self.truncated(remaining));
        }

        let mut bytes = vec![0u8; BlockHeader::SIZE];
        self.read_exact(&mut bytes, remaining)?;

        let block_header = BlockHeader::from_bytes(&bytes)?;
        let total = block_header.total_size();
        if total > remaining {
            return Err(self.truncated(remaining));
        }

        bytes.resize(total as usize, 0);
        self.read_exact(&mut bytes[BlockHeader::SIZE..], remaining)?;

        let block = Block::decode(&bytes, self.offset)?;
        self.offset += total;
        Ok(Some(block))
    }

    fn read_exact(&mut self, buf: &mut [u8], remaining: u64) -> JournalResult<()> {
        match self.reader.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(self.truncated(remaining)),
            Err(e) => Err(e.into()),
        }
    }

    fn truncated(&self, remaining: u64) -> JournalError {
        JournalError::segment_corrupted(
            self.path.clone(),
            format!(
                "block at offset {} is cut off ({} bytes left)",
                self.offset, remaining
            ),
        )
    }
}

impl Iterator for SegmentReader {
    type Item = JournalResult<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_block().transpose()
    }
}

impl std::fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader")
            .field("path", &self.path)
            .field("sequence", &self.header.sequence)
            .field("offset", &self.offset)
            .finish()
    }
}
