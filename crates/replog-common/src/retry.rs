//! Bounded retry with a fixed interval.
//!
//! Used where the system waits for another party to free a resource, such as
//! the journal waiting for the archiver to release a segment.

use std::time::Duration;

use crate::constants::{CAPACITY_RETRY_ATTEMPTS, CAPACITY_RETRY_INTERVAL_MS};

/// Something that can pause the current thread.
///
/// Tests substitute a recording sleeper so retry loops run instantly.
pub trait Sleeper: Send + Sync {
    /// Pauses for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Sleeps the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// How often and how long to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub attempts: u32,
    /// Pause before each retry.
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: CAPACITY_RETRY_ATTEMPTS,
            interval: Duration::from_millis(CAPACITY_RETRY_INTERVAL_MS),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// A policy that never retries.
    pub const fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Total time spent sleeping when every attempt fails.
    pub fn max_wait(&self) -> Duration {
        self.interval * self.attempts
    }

    /// Runs `op` until it yields a value or the attempts are exhausted.
    ///
    /// `op` receives the attempt number, starting at zero. `on_retry` runs
    /// once before the first retry, so callers can log a single warning.
    pub fn run<T, S, F, W>(&self, sleeper: &S, mut op: F, on_retry: W) -> Option<T>
    where
        S: Sleeper + ?Sized,
        F: FnMut(u32) -> Option<T>,
        W: FnOnce(),
    {
        if let Some(value) = op(0) {
            return Some(value);
        }

        let mut on_retry = Some(on_retry);
        for attempt in 1..=self.attempts {
            if let Some(warn) = on_retry.take() {
                warn();
            }
            sleeper.sleep(self.interval);
            if let Some(value) = op(attempt) {
                return Some(value);
            }
        }
        None
    }
}
