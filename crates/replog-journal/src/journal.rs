//! The change journal.
//!
//! `ChangeLog` coordinates every process attached to one journal directory:
//! it hands out segments, appends blocks, seals segments when they fill up or
//! age out, and archives sealed segments in the background.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use replog_common::types::now_micros;
use replog_common::{LogSide, OperationalLog, Shutdown, Sleeper, ThreadSleeper, Wakeup};

use crate::archive::archive_segment_file;
use crate::config::JournalConfig;
use crate::error::{JournalError, JournalResult};
use crate::group_flush::GroupFlush;
use crate::segment::{Segment, SegmentState};
use crate::shared::{process_alive, SharedState, StateHeader};

/// Journal statistics.
#[derive(Debug, Default)]
pub struct JournalStats {
    /// Total bytes written.
    pub bytes_written: AtomicU64,
    /// Total blocks written.
    pub blocks_written: AtomicU64,
    /// Segment files created.
    pub segments_created: AtomicU64,
    /// Free segments recycled under a new sequence.
    pub segments_reused: AtomicU64,
    /// Segments sealed.
    pub segments_sealed: AtomicU64,
    /// Segments archived (or recycled without archiving).
    pub segments_archived: AtomicU64,
    /// Failed archive attempts.
    pub archive_failures: AtomicU64,
    /// Flushes to stable storage.
    pub syncs: AtomicU64,
}

/// This process's view of the segment directory.
struct LocalView {
    segments: Vec<Arc<Segment>>,
    /// Directory epoch the view was built at.
    dir_epoch: Option<u64>,
}

/// Segmented change journal shared by all processes of a primary.
pub struct ChangeLog {
    config: Arc<JournalConfig>,
    oplog: Arc<OperationalLog>,
    shared: SharedState,
    local: Mutex<LocalView>,
    group_flush: GroupFlush,
    sleeper: Arc<dyn Sleeper>,
    stats: JournalStats,
    shutdown: Arc<Shutdown>,
    wakeup: Arc<Wakeup>,
    archiver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    pid: u32,
}

impl ChangeLog {
    /// Attaches to the journal in `config.dir`, creating it if needed.
    pub fn open(config: JournalConfig, oplog: Arc<OperationalLog>) -> JournalResult<Arc<Self>> {
        Self::open_with_sleeper(config, oplog, Arc::new(ThreadSleeper))
    }

    /// Attaches with a custom sleeper for capacity waits.
    pub fn open_with_sleeper(
        config: JournalConfig,
        oplog: Arc<OperationalLog>,
        sleeper: Arc<dyn Sleeper>,
    ) -> JournalResult<Arc<Self>> {
        config.validate().map_err(JournalError::config)?;
        std::fs::create_dir_all(&config.dir)?;

        let shared = SharedState::open(config.state_path())?;
        let log = Arc::new(Self {
            group_flush: GroupFlush::new(config.group_flush_delay),
            config: Arc::new(config),
            oplog,
            shared,
            local: Mutex::new(LocalView {
                segments: Vec::new(),
                dir_epoch: None,
            }),
            sleeper,
            stats: JournalStats::default(),
            shutdown: Arc::new(Shutdown::new()),
            wakeup: Arc::new(Wakeup::new()),
            archiver: Mutex::new(None),
            closed: AtomicBool::new(false),
            pid: std::process::id(),
        });

        log.attach()?;

        if log.config.background_archiver {
            let handle = Self::spawn_archiver(&log)?;
            *log.archiver.lock() = Some(handle);
        }

        tracing::info!(
            dir = %log.config.dir.display(),
            guid = %log.guid(),
            "journal attached"
        );
        Ok(log)
    }

    /// Registers this process and recovers segments left behind by a crash.
    fn attach(&self) -> JournalResult<()> {
        self.shared.with_lock(|state| {
            let pruned = state.prune(process_alive);
            if pruned > 0 {
                self.oplog.warning(
                    LogSide::Primary,
                    format!("removed {} dead process(es) from the journal registry", pruned),
                );
            }

            let mut local = self.local.lock();
            self.refresh(state, &mut local)?;

            if state.pids().is_empty() {
                // Nobody can still be archiving these.
                for segment in &local.segments {
                    if segment.state() == SegmentState::Arch {
                        segment.set_state(SegmentState::Full)?;
                        self.oplog.warning(
                            LogSide::Primary,
                            format!(
                                "segment {} was left in archiving state, will archive again",
                                segment.sequence()
                            ),
                        );
                    }
                }
            }

            state.register(self.pid)
        })
    }

    fn spawn_archiver(log: &Arc<Self>) -> JournalResult<JoinHandle<()>> {
        let weak = Arc::downgrade(log);
        let shutdown = Arc::clone(&log.shutdown);
        let wakeup = Arc::clone(&log.wakeup);
        let interval = log.config.archive_timeout;

        let handle = thread::Builder::new()
            .name("replog-archiver".to_string())
            .spawn(move || archiver_loop(weak, shutdown, wakeup, interval))?;
        Ok(handle)
    }

    /// Returns the journal instance identity.
    pub fn guid(&self) -> Uuid {
        self.shared.guid()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    /// Returns the statistics of this process.
    pub fn stats(&self) -> &JournalStats {
        &self.stats
    }

    /// Returns true once the journal was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Appends one block.
    ///
    /// Waits for the archiver while no segment is available. With `sync`,
    /// returns only once the block is on stable storage.
    ///
    /// Returns the sequence of the segment the block went to.
    pub fn write(&self, data: &[u8], sync: bool) -> JournalResult<u64> {
        if self.is_closed() {
            return Err(JournalError::Closed);
        }

        let required = data.len() as u64;
        let max = self.config.max_block_size();
        if required > max {
            return Err(JournalError::BlockTooLarge {
                size: required,
                max,
            });
        }

        let policy = self.config.capacity_retry;
        let appended = policy.run(
            self.sleeper.as_ref(),
            |_| match self.try_append(data) {
                Ok(Some(done)) => Some(Ok(done)),
                Ok(None) => {
                    self.wakeup.notify();
                    None
                }
                Err(e) => Some(Err(e)),
            },
            || {
                self.oplog.warning(
                    LogSide::Primary,
                    format!(
                        "no free journal segment, waiting up to {:?} for archiving",
                        policy.max_wait()
                    ),
                )
            },
        );

        let (segment, sequence, length) = match appended {
            Some(result) => result?,
            None => {
                let err = JournalError::NoCapacity {
                    attempts: policy.attempts + 1,
                };
                self.oplog.error(LogSide::Primary, err.to_string());
                return Err(err);
            }
        };

        self.stats.bytes_written.fetch_add(required, Ordering::Relaxed);
        self.stats.blocks_written.fetch_add(1, Ordering::Relaxed);

        if sync && self.group_flush.flush(&segment, sequence, length)? {
            self.stats.syncs.fetch_add(1, Ordering::Relaxed);
        }

        Ok(sequence)
    }

    fn try_append(&self, data: &[u8]) -> JournalResult<Option<(Arc<Segment>, u64, u64)>> {
        self.shared.with_lock(|state| {
            let mut local = self.local.lock();
            self.refresh(state, &mut local)?;

            let Some(segment) = self.get_segment(state, &mut local, data.len() as u64)? else {
                return Ok(None);
            };

            let length = segment.append(data)?;
            let sequence = segment.sequence();
            Ok(Some((segment, sequence, length)))
        })
    }

    /// Brings the local view up to date with the directory and the headers.
    fn refresh(&self, state: &mut StateHeader, local: &mut LocalView) -> JournalResult<()> {
        if local.dir_epoch == Some(state.dir_epoch) {
            for segment in &local.segments {
                segment.reload()?;
            }
            return Ok(());
        }

        let mut segments = Vec::new();
        for entry in std::fs::read_dir(&self.config.dir)? {
            let path = entry?.path();
            let Some(sequence) = self.config.parse_sequence(&path) else {
                continue;
            };

            match Segment::open(&path) {
                Ok(segment) if segment.header().guid == self.guid() => {
                    state.sequence = state.sequence.max(sequence);
                    segments.push(Arc::new(segment));
                }
                Ok(_) => {
                    tracing::warn!("ignoring segment {} of another journal", path.display());
                }
                Err(e) => {
                    self.oplog
                        .error(LogSide::Primary, format!("cannot open segment: {}", e));
                }
            }
        }
        segments.sort_by_key(|s| s.sequence());

        tracing::debug!(
            epoch = state.dir_epoch,
            count = segments.len(),
            "journal directory rescanned"
        );

        state.segment_count = segments.len() as u64;
        local.segments = segments;
        local.dir_epoch = Some(state.dir_epoch);
        Ok(())
    }

    fn bump_epoch(state: &mut StateHeader, local: &mut LocalView) {
        state.dir_epoch += 1;
        local.dir_epoch = Some(state.dir_epoch);
    }

    fn is_aged(&self, state: &StateHeader) -> bool {
        let age = now_micros().saturating_sub(state.timestamp);
        u128::from(age) > self.config.archive_timeout.as_micros()
    }

    /// Returns the segment to append `required` bytes to, if any.
    fn get_segment(
        &self,
        state: &mut StateHeader,
        local: &mut LocalView,
        required: u64,
    ) -> JournalResult<Option<Arc<Segment>>> {
        let mut active = local
            .segments
            .iter()
            .find(|s| s.state() == SegmentState::Used)
            .cloned();

        let exhausted = active.as_ref().is_some_and(|segment| {
            let header = segment.header();
            let overflow = header.length + required > self.config.segment_size;
            header.has_data() && (overflow || self.is_aged(state))
        });
        if exhausted {
            if let Some(segment) = active.take() {
                self.seal(state, &segment)?;
            }
        }

        if active.is_some() {
            return Ok(active);
        }

        let free = local
            .segments
            .iter()
            .filter(|s| s.state() == SegmentState::Free)
            .min_by_key(|s| s.sequence())
            .cloned();

        let sequence = state.sequence + 1;
        let segment = if let Some(segment) = free {
            let old = segment.sequence();
            segment.reuse(&self.config.segment_path(sequence), sequence)?;
            self.stats.segments_reused.fetch_add(1, Ordering::Relaxed);
            self.oplog.verbose(
                LogSide::Primary,
                format!("segment {} reused as segment {}", old, sequence),
            );
            segment
        } else if local.segments.len() < self.config.segment_count {
            let segment = Arc::new(Segment::create(
                self.config.segment_path(sequence),
                self.guid(),
                sequence,
            )?);
            local.segments.push(Arc::clone(&segment));
            state.segment_count = local.segments.len() as u64;
            self.stats.segments_created.fetch_add(1, Ordering::Relaxed);
            self.oplog
                .verbose(LogSide::Primary, format!("segment {} created", sequence));
            segment
        } else {
            return Ok(None);
        };

        state.sequence = sequence;
        state.timestamp = now_micros();
        Self::bump_epoch(state, local);
        local.segments.sort_by_key(|s| s.sequence());

        Ok(Some(segment))
    }

    /// Marks the active segment full and wakes the archiver.
    fn seal(&self, state: &mut StateHeader, segment: &Segment) -> JournalResult<()> {
        segment.set_state(SegmentState::Full)?;
        segment.sync()?;
        state.flush_generation += 1;
        self.stats.segments_sealed.fetch_add(1, Ordering::Relaxed);
        self.oplog.verbose(
            LogSide::Primary,
            format!(
                "segment {} is full ({} bytes)",
                segment.sequence(),
                segment.length()
            ),
        );
        self.wakeup.notify();
        Ok(())
    }

    /// Seals the active segment if it aged out, then archives every sealed
    /// segment in sequence order.
    ///
    /// Returns the number of segments archived.
    pub fn archive_pending(&self) -> JournalResult<usize> {
        let sealed = self.shared.with_lock(|state| {
            let mut local = self.local.lock();
            self.refresh(state, &mut local)?;

            let active = local
                .segments
                .iter()
                .find(|s| s.state() == SegmentState::Used)
                .cloned();
            if let Some(segment) = active {
                if segment.header().has_data() && self.is_aged(state) {
                    self.seal(state, &segment)?;
                }
            }

            Ok(local
                .segments
                .iter()
                .filter(|s| s.state() == SegmentState::Full)
                .map(|s| s.sequence())
                .collect::<Vec<_>>())
        })?;

        let mut archived = 0;
        for sequence in sealed {
            if self.archive_segment(sequence)? {
                archived += 1;
            }
        }
        Ok(archived)
    }

    /// Archives one sealed segment. Returns false if it stays sealed.
    fn archive_segment(&self, sequence: u64) -> JournalResult<bool> {
        let claimed = self.shared.with_lock(|state| {
            let mut local = self.local.lock();
            self.refresh(state, &mut local)?;

            match Self::find(&local, sequence) {
                Some(segment) if segment.state() == SegmentState::Full => {
                    segment.set_state(SegmentState::Arch)?;
                    Ok(Some(segment.path()))
                }
                _ => Ok(None),
            }
        })?;

        let Some(path) = claimed else {
            return Ok(false);
        };

        let result = archive_segment_file(&self.config, &path);

        self.shared.with_lock(|state| {
            let mut local = self.local.lock();
            self.refresh(state, &mut local)?;

            let Some(segment) = Self::find(&local, sequence) else {
                return Err(JournalError::segment_corrupted(
                    path.clone(),
                    "segment disappeared while being archived",
                ));
            };

            match &result {
                Ok(target) => {
                    segment.set_state(SegmentState::Free)?;
                    self.stats.segments_archived.fetch_add(1, Ordering::Relaxed);
                    let message = match target {
                        Some(target) => {
                            format!("segment {} archived to {}", sequence, target.display())
                        }
                        None => format!("segment {} recycled", sequence),
                    };
                    self.oplog.verbose(LogSide::Primary, message);
                    Ok(true)
                }
                Err(e) => {
                    segment.set_state(SegmentState::Full)?;
                    self.stats.archive_failures.fetch_add(1, Ordering::Relaxed);
                    self.oplog.error(LogSide::Primary, e.to_string());
                    Ok(false)
                }
            }
        })
    }

    fn find(local: &LocalView, sequence: u64) -> Option<Arc<Segment>> {
        local
            .segments
            .iter()
            .find(|s| s.sequence() == sequence)
            .cloned()
    }

    /// Returns the sequence and state of every segment, in sequence order.
    pub fn segment_states(&self) -> JournalResult<Vec<(u64, SegmentState)>> {
        self.shared.with_lock(|state| {
            let mut local = self.local.lock();
            self.refresh(state, &mut local)?;
            Ok(local
                .segments
                .iter()
                .map(|s| (s.sequence(), s.state()))
                .collect())
        })
    }

    /// Returns the paths of every segment, in sequence order.
    pub fn segment_paths(&self) -> JournalResult<Vec<PathBuf>> {
        self.shared.with_lock(|state| {
            let mut local = self.local.lock();
            self.refresh(state, &mut local)?;
            Ok(local.segments.iter().map(|s| s.path()).collect())
        })
    }

    /// Detaches from the journal.
    ///
    /// Stops the archiver. The last process to detach seals the active
    /// segment and archives everything sealed before leaving.
    pub fn close(&self) -> JournalResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown.cancel();
        self.wakeup.notify();
        if let Some(handle) = self.archiver.lock().take() {
            // The archiver may hold the last reference and end up here.
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!("journal archiver thread panicked");
            }
        }

        let last = self.shared.with_lock(|state| {
            let last = state.pids().len() == 1;
            if last {
                let mut local = self.local.lock();
                self.refresh(state, &mut local)?;
                let active = local
                    .segments
                    .iter()
                    .find(|s| s.state() == SegmentState::Used)
                    .cloned();
                if let Some(segment) = active {
                    if segment.header().has_data() {
                        self.seal(state, &segment)?;
                    }
                }
            }
            Ok(last)
        });

        let archived = match last {
            Ok(true) => self.archive_pending().map(|_| ()),
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };

        self.shared.with_lock(|state| {
            state.unregister(self.pid);
            Ok(())
        })?;

        tracing::info!(dir = %self.config.dir.display(), "journal detached");
        archived
    }
}

impl Drop for ChangeLog {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("error while closing journal: {}", e);
        }
    }
}

impl std::fmt::Debug for ChangeLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeLog")
            .field("dir", &self.config.dir)
            .field("guid", &self.guid())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn archiver_loop(
    log: Weak<ChangeLog>,
    shutdown: Arc<Shutdown>,
    wakeup: Arc<Wakeup>,
    interval: Duration,
) {
    tracing::debug!("journal archiver started");
    while !shutdown.is_cancelled() {
        {
            let Some(log) = log.upgrade() else {
                break;
            };
            if let Err(e) = log.archive_pending() {
                log.oplog
                    .error(LogSide::Primary, format!("journal archiving failed: {}", e));
            }
        }

        if shutdown.is_cancelled() {
            break;
        }
        wakeup.wait_timeout(interval);
    }
    tracing::debug!("journal archiver stopped");
}
