//! Group flush.
//!
//! Durable writes wait a short, configurable delay before forcing the segment
//! to stable storage. Writers that arrive during the delay find their data
//! already covered by the first writer's flush and return without one.

use std::time::Duration;

use parking_lot::Mutex;

use crate::error::JournalResult;
use crate::segment::Segment;

/// Batches fsyncs of concurrent writers.
pub(crate) struct GroupFlush {
    /// Time to wait for other writers before flushing.
    delay: Duration,
    /// Serializes flushes so waiting writers can piggyback.
    flushing: Mutex<()>,
}

impl GroupFlush {
    /// Creates a group flush with the given delay.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            flushing: Mutex::new(()),
        }
    }

    /// Makes everything up to `length` of segment `sequence` durable.
    ///
    /// Returns true if this call performed the flush.
    pub fn flush(&self, segment: &Segment, sequence: u64, length: u64) -> JournalResult<bool> {
        if segment.is_synced(sequence, length) {
            return Ok(false);
        }

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let _flushing = self.flushing.lock();
        if segment.is_synced(sequence, length) {
            return Ok(false);
        }

        segment.sync()?;
        Ok(true)
    }
}

impl std::fmt::Debug for GroupFlush {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupFlush")
            .field("delay", &self.delay)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[test]
    fn test_flush_once() {
        let tmp = TempDir::new().unwrap();
        let segment = Segment::create(tmp.path().join("db.journal-000000001"), Uuid::new_v4(), 1)
            .unwrap();
        let flush = GroupFlush::new(Duration::ZERO);

        let len = segment.append(b"block").unwrap();
        assert!(flush.flush(&segment, 1, len).unwrap());
        assert!(!flush.flush(&segment, 1, len).unwrap());
    }

    #[test]
    fn test_concurrent_writers_share_flush() {
        let tmp = TempDir::new().unwrap();
        let segment = Arc::new(
            Segment::create(tmp.path().join("db.journal-000000001"), Uuid::new_v4(), 1).unwrap(),
        );
        let flush = Arc::new(GroupFlush::new(Duration::from_millis(50)));
        let performed = Arc::new(AtomicU64::new(0));

        let lengths: Vec<u64> = (0..4)
            .map(|i| segment.append(format!("block {}", i).as_bytes()).unwrap())
            .collect();

        let handles: Vec<_> = lengths
            .into_iter()
            .map(|len| {
                let segment = Arc::clone(&segment);
                let flush = Arc::clone(&flush);
                let performed = Arc::clone(&performed);
                std::thread::spawn(move || {
                    if flush.flush(&segment, 1, len).unwrap() {
                        performed.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // Every write was appended before any flush, so the first flush
        // covers them all.
        assert_eq!(performed.load(Ordering::SeqCst), 1);
        assert!(segment.is_synced(1, segment.length()));
    }
}
