//! Dispatch of encoded blocks to the journal and live replicas.
//!
//! Producers hand finished blocks to the [`Manager`], which queues them and
//! delivers them in FIFO order: each block is written to the journal, then
//! forwarded to every healthy replica connection. Synchronous flushes drain
//! the whole queue on the calling thread; asynchronous ones leave the work to
//! the writer thread.
//!
//! ```text
//!  Transaction ──flush──▶ queue ──drain──▶ journal ──▶ replica 1 … replica N
//!                           ▲                 (writer thread or caller)
//!                     BufferPool
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use replog_common::constants::{DEFAULT_BUFFER_SIZE, LAG_FACTOR};
use replog_common::{LogSide, OperationalLog, ReplicaTarget, ReplicationConfig, Shutdown, Wakeup};
use replog_journal::{ChangeLog, JournalConfig};

use crate::error::{ReplicatorError, ReplicatorResult};

/// Longest time the writer thread sleeps without being woken.
const WRITER_IDLE_INTERVAL: Duration = Duration::from_secs(1);

/// Buffers kept for reuse.
const MAX_POOLED_BUFFERS: usize = 64;

/// How a flushed block is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Queue the block and return.
    Async,
    /// Deliver everything queued before returning.
    Sync,
    /// Like `Sync`, and the journal write reaches stable storage.
    Prepare,
}

impl FlushMode {
    /// Returns true if the caller waits for delivery.
    pub fn is_sync(self) -> bool {
        !matches!(self, Self::Async)
    }
}

/// A directly attached replica database.
pub trait ReplicaConnection: Send {
    /// Name used in log messages.
    fn name(&self) -> &str;

    /// Delivers one encoded block.
    fn replicate(&mut self, block: &[u8]) -> ReplicatorResult<()>;
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Size at which a transaction's block is flushed early.
    pub buffer_size: usize,
    /// Queued bytes above which every flush is synchronous.
    pub lag_threshold: usize,
    /// Run the writer thread that drains asynchronous flushes.
    pub background_writer: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl DispatchConfig {
    /// Creates settings for the given buffer size.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            lag_threshold: buffer_size.saturating_mul(LAG_FACTOR),
            background_writer: true,
        }
    }

    /// Derives the settings of a primary.
    pub fn from_replication(config: &ReplicationConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            lag_threshold: config.lag_threshold(),
            background_writer: true,
        }
    }

    /// Sets the lag threshold.
    #[must_use]
    pub fn with_lag_threshold(mut self, threshold: usize) -> Self {
        self.lag_threshold = threshold;
        self
    }

    /// Enables or disables the writer thread.
    #[must_use]
    pub fn with_background_writer(mut self, enabled: bool) -> Self {
        self.background_writer = enabled;
        self
    }
}

/// Pool of reusable block buffers.
///
/// Has its own lock so taking a buffer never waits for a drain.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
}

impl BufferPool {
    /// Creates a pool handing out buffers of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Takes an empty buffer.
    pub fn get_buffer(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.capacity))
    }

    /// Returns a buffer for reuse.
    pub fn release_buffer(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < MAX_POOLED_BUFFERS {
            buffers.push(buffer);
        }
    }

    /// Number of idle buffers.
    pub fn pooled(&self) -> usize {
        self.buffers.lock().len()
    }
}

/// Dispatcher statistics.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Blocks accepted.
    pub blocks_queued: AtomicU64,
    /// Bytes accepted.
    pub bytes_queued: AtomicU64,
    /// Blocks delivered.
    pub blocks_delivered: AtomicU64,
    /// Asynchronous flushes turned synchronous by the lag threshold.
    pub forced_syncs: AtomicU64,
    /// Failed replica deliveries.
    pub replica_failures: AtomicU64,
}

struct QueuedBlock {
    buffer: Vec<u8>,
    /// Journal write must reach stable storage.
    durable: bool,
}

#[derive(Default)]
struct Queue {
    blocks: VecDeque<QueuedBlock>,
    bytes: usize,
}

struct Replica {
    connection: Box<dyn ReplicaConnection>,
    healthy: bool,
}

/// Queues encoded blocks and delivers them to the journal and live replicas.
pub struct Manager {
    config: DispatchConfig,
    journal: Option<Arc<ChangeLog>>,
    replicas: Mutex<Vec<Replica>>,
    queue: Mutex<Queue>,
    pool: BufferPool,
    oplog: Arc<OperationalLog>,
    stats: DispatchStats,
    shutdown: Arc<Shutdown>,
    wakeup: Arc<Wakeup>,
    writer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Manager {
    /// Creates a dispatcher over an optional journal and replica connections.
    pub fn new(
        config: DispatchConfig,
        journal: Option<Arc<ChangeLog>>,
        replicas: Vec<Box<dyn ReplicaConnection>>,
        oplog: Arc<OperationalLog>,
    ) -> ReplicatorResult<Arc<Self>> {
        let manager = Arc::new(Self {
            pool: BufferPool::new(config.buffer_size),
            config,
            journal,
            replicas: Mutex::new(
                replicas
                    .into_iter()
                    .map(|connection| Replica {
                        connection,
                        healthy: true,
                    })
                    .collect(),
            ),
            queue: Mutex::new(Queue::default()),
            oplog,
            stats: DispatchStats::default(),
            shutdown: Arc::new(Shutdown::new()),
            wakeup: Arc::new(Wakeup::new()),
            writer: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        if manager.config.background_writer {
            let weak = Arc::downgrade(&manager);
            let shutdown = Arc::clone(&manager.shutdown);
            let wakeup = Arc::clone(&manager.wakeup);
            let handle = thread::Builder::new()
                .name("replog-writer".to_string())
                .spawn(move || writer_loop(weak, shutdown, wakeup))?;
            *manager.writer.lock() = Some(handle);
        }

        Ok(manager)
    }

    /// Sets up replication for a primary.
    ///
    /// Opens the journal if one is configured and connects every synchronous
    /// replica through `connect`. A replica that cannot be reached is logged
    /// and left out.
    pub fn open<C>(
        config: &ReplicationConfig,
        oplog: Arc<OperationalLog>,
        connect: C,
    ) -> ReplicatorResult<Arc<Self>>
    where
        C: Fn(&ReplicaTarget) -> ReplicatorResult<Box<dyn ReplicaConnection>>,
    {
        config.validate()?;

        let journal = match JournalConfig::from_replication(config) {
            Some(journal_config) => Some(ChangeLog::open(journal_config, Arc::clone(&oplog))?),
            None => None,
        };

        let mut replicas = Vec::new();
        for target in config.replica_targets()? {
            match connect(&target) {
                Ok(connection) => replicas.push(connection),
                Err(e) => {
                    oplog.error(
                        LogSide::Primary,
                        format!("cannot connect to replica {}: {}", target.database, e),
                    );
                }
            }
        }

        tracing::info!(
            journal = journal.is_some(),
            replicas = replicas.len(),
            "replication dispatcher started"
        );

        Self::new(DispatchConfig::from_replication(config), journal, replicas, oplog)
    }

    /// Returns the settings.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Returns the journal, if any.
    pub fn journal(&self) -> Option<&Arc<ChangeLog>> {
        self.journal.as_ref()
    }

    /// Returns the operational log.
    pub fn oplog(&self) -> &Arc<OperationalLog> {
        &self.oplog
    }

    /// Returns the statistics.
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Takes an empty buffer from the pool.
    pub fn get_buffer(&self) -> Vec<u8> {
        self.pool.get_buffer()
    }

    /// Returns a buffer to the pool.
    pub fn release_buffer(&self, buffer: Vec<u8>) {
        self.pool.release_buffer(buffer)
    }

    /// Returns the buffer pool.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Number of blocks waiting for delivery.
    pub fn queued_blocks(&self) -> usize {
        self.queue.lock().blocks.len()
    }

    /// Bytes waiting for delivery.
    pub fn queued_bytes(&self) -> usize {
        self.queue.lock().bytes
    }

    /// Names and health of the replica connections.
    pub fn replica_health(&self) -> Vec<(String, bool)> {
        self.replicas
            .lock()
            .iter()
            .map(|r| (r.connection.name().to_string(), r.healthy))
            .collect()
    }

    /// Marks every replica healthy again.
    pub fn reset_replicas(&self) {
        let mut replicas = self.replicas.lock();
        for replica in replicas.iter_mut().filter(|r| !r.healthy) {
            replica.healthy = true;
            self.oplog.warning(
                LogSide::Primary,
                format!("replica {} re-enabled", replica.connection.name()),
            );
        }
        self.oplog.reset_reported();
    }

    /// Queues one encoded block.
    ///
    /// Synchronous modes return once everything queued so far was delivered.
    /// Once the queue holds more than the lag threshold, every flush is
    /// synchronous.
    pub fn flush(&self, buffer: Vec<u8>, mode: FlushMode) -> ReplicatorResult<()> {
        if self.closed.load(Ordering::Acquire) {
            self.pool.release_buffer(buffer);
            return Err(ReplicatorError::ShuttingDown);
        }

        let mut queue = self.queue.lock();
        let len = buffer.len();
        queue.bytes += len;
        queue.blocks.push_back(QueuedBlock {
            buffer,
            durable: mode == FlushMode::Prepare,
        });
        self.stats.blocks_queued.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_queued.fetch_add(len as u64, Ordering::Relaxed);

        let lagging = queue.bytes > self.config.lag_threshold;
        if !mode.is_sync() && lagging {
            self.stats.forced_syncs.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                queued = queue.bytes,
                threshold = self.config.lag_threshold,
                "replication lag threshold reached, draining synchronously"
            );
        }

        if mode.is_sync() || lagging {
            return self.drain(&mut queue);
        }

        drop(queue);
        self.wakeup.notify();
        Ok(())
    }

    /// Delivers every queued block in order.
    ///
    /// Stops at the first journal failure and leaves the rest queued. Replica
    /// failures disable the replica; the first one is reported after the
    /// queue is empty.
    fn drain(&self, queue: &mut Queue) -> ReplicatorResult<()> {
        let mut replica_error = None;

        while let Some(block) = queue.blocks.front() {
            if let Some(journal) = &self.journal {
                journal.write(&block.buffer, block.durable)?;
            }

            if let Err(e) = self.forward(&block.buffer) {
                replica_error.get_or_insert(e);
            }

            if let Some(block) = queue.blocks.pop_front() {
                queue.bytes -= block.buffer.len();
                self.stats.blocks_delivered.fetch_add(1, Ordering::Relaxed);
                self.pool.release_buffer(block.buffer);
            }
        }

        match replica_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn forward(&self, block: &[u8]) -> ReplicatorResult<()> {
        let mut first_error = None;
        let mut replicas = self.replicas.lock();

        for replica in replicas.iter_mut().filter(|r| r.healthy) {
            if let Err(e) = replica.connection.replicate(block) {
                replica.healthy = false;
                self.stats.replica_failures.fetch_add(1, Ordering::Relaxed);
                self.oplog.error(
                    LogSide::Primary,
                    format!(
                        "replica {} disabled after delivery failure: {}",
                        replica.connection.name(),
                        e
                    ),
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drains the queue from the writer thread.
    fn drain_background(&self) {
        let mut queue = self.queue.lock();
        if queue.blocks.is_empty() {
            return;
        }
        if let Err(e) = self.drain(&mut queue) {
            // Replica failures were already reported by `forward`.
            if !e.is_delivery() {
                self.oplog
                    .error(LogSide::Primary, format!("asynchronous replication failed: {}", e));
            }
        }
    }

    /// Stops accepting blocks, delivers what is queued and closes the journal.
    pub fn shutdown(&self) -> ReplicatorResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown.cancel();
        self.wakeup.notify();
        if let Some(handle) = self.writer.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!("replication writer thread panicked");
            }
        }

        let drained = {
            let mut queue = self.queue.lock();
            self.drain(&mut queue)
        };

        if let Some(journal) = &self.journal {
            journal.close()?;
        }

        tracing::info!("replication dispatcher stopped");
        drained
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("error while shutting down replication: {}", e);
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .field("journal", &self.journal.is_some())
            .field("replicas", &self.replicas.lock().len())
            .finish()
    }
}

fn writer_loop(manager: Weak<Manager>, shutdown: Arc<Shutdown>, wakeup: Arc<Wakeup>) {
    tracing::debug!("replication writer started");
    while !shutdown.is_cancelled() {
        wakeup.wait_timeout(WRITER_IDLE_INTERVAL);
        if shutdown.is_cancelled() {
            break;
        }

        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.drain_background();
    }
    tracing::debug!("replication writer stopped");
}
