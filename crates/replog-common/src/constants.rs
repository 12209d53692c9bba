//! System-wide constants for replog.
//!
//! Defaults mirror the values a primary uses when an option is absent from
//! its configuration file.

// =============================================================================
// Batch and Queue Constants
// =============================================================================

/// Default replication buffer size (1 MB).
///
/// A transaction's batch is flushed asynchronously once its payload grows past
/// this size.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Minimum replication buffer size (64 KB).
pub const MIN_BUFFER_SIZE: usize = 64 * 1024;

/// Multiplier applied to the buffer size to obtain the dispatch lag threshold.
///
/// Once more than `buffer_size * LAG_FACTOR` bytes are queued, every flush is
/// drained synchronously.
pub const LAG_FACTOR: usize = 8;

/// Maximum size of one blob chunk inside a StoreBlob operation.
pub const MAX_BLOB_CHUNK: usize = u16::MAX as usize;

// =============================================================================
// Journal Constants
// =============================================================================

/// Default journal segment size (16 MB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Minimum journal segment size (64 KB).
pub const MIN_SEGMENT_SIZE: u64 = 64 * 1024;

/// Default maximum number of journal segments.
pub const DEFAULT_SEGMENT_COUNT: usize = 8;

/// Default archive timeout in seconds.
///
/// A `USED` segment holding data is sealed once it is older than this.
pub const DEFAULT_ARCHIVE_TIMEOUT_SECS: u64 = 60;

/// Number of attempts made to obtain segment capacity before failing.
pub const CAPACITY_RETRY_ATTEMPTS: u32 = 60;

/// Pause between capacity attempts in milliseconds.
pub const CAPACITY_RETRY_INTERVAL_MS: u64 = 1_000;

/// Maximum number of processes tracked in the shared journal state.
pub const MAX_PROCESSES: usize = 32;

/// Default journal file prefix.
pub const DEFAULT_FILE_PREFIX: &str = "replog";

// =============================================================================
// Apply Constants
// =============================================================================

/// Default pause between apply passes when there was nothing to do.
pub const DEFAULT_APPLY_IDLE_TIMEOUT_SECS: u64 = 10;

/// Default pause between apply passes after an error.
pub const DEFAULT_APPLY_ERROR_TIMEOUT_SECS: u64 = 60;

// =============================================================================
// Operational Log
// =============================================================================

/// File name of the operational replication log.
pub const OPERATIONAL_LOG_FILE: &str = "replication.log";
