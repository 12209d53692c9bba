//! Journal configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use replog_common::constants::{
    DEFAULT_ARCHIVE_TIMEOUT_SECS, DEFAULT_FILE_PREFIX, DEFAULT_SEGMENT_COUNT,
    DEFAULT_SEGMENT_SIZE, MIN_SEGMENT_SIZE,
};
use replog_common::{ReplicationConfig, RetryPolicy};

use crate::archive::ARCHIVE_PATH_NAME;
use crate::segment::SegmentHeader;

/// Infix between the file prefix and the sequence number of a segment.
const SEGMENT_INFIX: &str = ".journal-";

/// Width of the zero-padded sequence number in segment file names.
const SEQUENCE_WIDTH: usize = 9;

/// Suffix of the shared state file.
const STATE_SUFFIX: &str = ".state";

/// Configuration for the change journal.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Directory where segments are stored.
    pub dir: PathBuf,

    /// Prefix of every journal file name.
    pub file_prefix: String,

    /// Size at which a segment is sealed.
    pub segment_size: u64,

    /// Maximum number of segment files.
    pub segment_count: usize,

    /// Delay used to batch durable flushes of concurrent writers.
    pub group_flush_delay: Duration,

    /// Directory that sealed segments are copied into.
    pub archive_dir: Option<PathBuf>,

    /// Command run to archive a sealed segment.
    pub archive_command: Option<String>,

    /// Age after which a segment holding data is sealed.
    pub archive_timeout: Duration,

    /// Retry policy used while waiting for segment capacity.
    pub capacity_retry: RetryPolicy,

    /// Run the archiver thread in this process.
    ///
    /// Without it, sealed segments are archived by other attached processes
    /// or by explicit `archive_pending` calls.
    pub background_archiver: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/journal"),
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            segment_size: DEFAULT_SEGMENT_SIZE,
            segment_count: DEFAULT_SEGMENT_COUNT,
            group_flush_delay: Duration::ZERO,
            archive_dir: None,
            archive_command: None,
            archive_timeout: Duration::from_secs(DEFAULT_ARCHIVE_TIMEOUT_SECS),
            capacity_retry: RetryPolicy::default(),
            background_archiver: true,
        }
    }
}

impl JournalConfig {
    /// Creates a journal configuration for the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Derives the journal configuration of a primary.
    ///
    /// Returns `None` when the primary has no journal directory.
    pub fn from_replication(config: &ReplicationConfig) -> Option<Self> {
        let dir = config.journal_directory.as_ref()?;
        Some(Self {
            dir: dir.clone(),
            file_prefix: config.journal_file_prefix.clone(),
            segment_size: config.journal_segment_size,
            segment_count: config.journal_segment_count,
            group_flush_delay: config.group_flush_delay(),
            archive_dir: config.journal_archive_directory.clone(),
            archive_command: config.journal_archive_command.clone(),
            archive_timeout: config.archive_timeout(),
            capacity_retry: RetryPolicy::default(),
            background_archiver: true,
        })
    }

    /// Sets the file prefix.
    #[must_use]
    pub fn with_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    /// Sets the segment size.
    #[must_use]
    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Sets the maximum number of segments.
    #[must_use]
    pub fn with_segment_count(mut self, count: usize) -> Self {
        self.segment_count = count;
        self
    }

    /// Sets the group flush delay.
    #[must_use]
    pub fn with_group_flush_delay(mut self, delay: Duration) -> Self {
        self.group_flush_delay = delay;
        self
    }

    /// Sets the archive directory.
    #[must_use]
    pub fn with_archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.archive_dir = Some(dir.into());
        self
    }

    /// Sets the archive command.
    #[must_use]
    pub fn with_archive_command(mut self, command: impl Into<String>) -> Self {
        self.archive_command = Some(command.into());
        self
    }

    /// Sets the archive timeout.
    #[must_use]
    pub fn with_archive_timeout(mut self, timeout: Duration) -> Self {
        self.archive_timeout = timeout;
        self
    }

    /// Sets the capacity retry policy.
    #[must_use]
    pub fn with_capacity_retry(mut self, policy: RetryPolicy) -> Self {
        self.capacity_retry = policy;
        self
    }

    /// Sets whether this process runs the archiver thread.
    #[must_use]
    pub fn with_background_archiver(mut self, enabled: bool) -> Self {
        self.background_archiver = enabled;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.segment_size < MIN_SEGMENT_SIZE {
            return Err(format!(
                "Segment size must be at least {} bytes",
                MIN_SEGMENT_SIZE
            ));
        }

        if self.segment_count == 0 {
            return Err("Segment count must be positive".to_string());
        }

        if self.file_prefix.is_empty() || self.file_prefix.contains(std::path::MAIN_SEPARATOR) {
            return Err("File prefix must be a non-empty file name".to_string());
        }

        if self.archive_timeout.is_zero() {
            return Err("Archive timeout must be positive".to_string());
        }

        if self.archive_dir.as_deref() == Some(self.dir.as_path()) {
            return Err("Archive directory must differ from the journal directory".to_string());
        }

        if let Some(command) = &self.archive_command {
            if command.contains(ARCHIVE_PATH_NAME) && self.archive_dir.is_none() {
                return Err(format!(
                    "Archive command uses {} but no archive directory is set",
                    ARCHIVE_PATH_NAME
                ));
            }
        }

        Ok(())
    }

    /// Largest block that fits into an empty segment.
    pub fn max_block_size(&self) -> u64 {
        self.segment_size.saturating_sub(SegmentHeader::SIZE as u64)
    }

    /// Returns the file name of the segment with the given sequence.
    pub fn segment_file_name(&self, sequence: u64) -> String {
        format!(
            "{}{}{:0width$}",
            self.file_prefix,
            SEGMENT_INFIX,
            sequence,
            width = SEQUENCE_WIDTH
        )
    }

    /// Returns the path of the segment with the given sequence.
    pub fn segment_path(&self, sequence: u64) -> PathBuf {
        self.dir.join(self.segment_file_name(sequence))
    }

    /// Returns the path of the shared state file.
    pub fn state_path(&self) -> PathBuf {
        self.dir.join(format!("{}{}", self.file_prefix, STATE_SUFFIX))
    }

    /// Parses the sequence number out of a segment path with this prefix.
    pub fn parse_sequence(&self, path: &Path) -> Option<u64> {
        let name = path.file_name()?.to_str()?;
        let digits = name
            .strip_prefix(self.file_prefix.as_str())?
            .strip_prefix(SEGMENT_INFIX)?;
        parse_sequence_digits(digits)
    }
}

/// Parses the sequence out of any segment file name, whatever its prefix.
pub fn parse_segment_file_name(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let (_, digits) = name.rsplit_once(SEGMENT_INFIX)?;
    parse_sequence_digits(digits)
}

fn parse_sequence_digits(digits: &str) -> Option<u64> {
    if digits.len() < SEQUENCE_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
