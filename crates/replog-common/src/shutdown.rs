//! Signalling primitives for background threads.
//!
//! Writer, archiver and apply loops sleep between rounds. [`Shutdown`] lets
//! them stop promptly instead of finishing a full sleep; [`Wakeup`] lets a
//! producer cut a sleep short when new work arrives.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// One-way cancellation flag that sleeping threads can wait on.
#[derive(Debug, Default)]
pub struct Shutdown {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl Shutdown {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the token and wakes every waiter.
    pub fn cancel(&self) {
        let mut cancelled = self.cancelled.lock();
        *cancelled = true;
        self.cond.notify_all();
    }

    /// Returns true once [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    /// Sleeps for up to `timeout`.
    ///
    /// Returns true if the token was cancelled before or during the wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.cancelled.lock();
        while !*cancelled {
            if self.cond.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

/// Edge-triggered wakeup for a single consumer.
///
/// A notification delivered while nobody waits is remembered until the next
/// wait consumes it.
#[derive(Debug, Default)]
pub struct Wakeup {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Wakeup {
    /// Creates a wakeup with no pending notification.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes the waiter, or the next one to wait.
    pub fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_all();
    }

    /// Waits for a notification for up to `timeout`.
    ///
    /// Returns true if a notification was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock();
        while !*pending {
            if self.cond.wait_until(&mut pending, deadline).timed_out() {
                break;
            }
        }
        std::mem::replace(&mut *pending, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_shutdown_times_out() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.wait_timeout(Duration::from_millis(10)));
        assert!(!shutdown.is_cancelled());
    }

    #[test]
    fn test_shutdown_wakes_waiter() {
        let shutdown = Arc::new(Shutdown::new());
        let waiter = {
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || shutdown.wait_timeout(Duration::from_secs(30)))
        };

        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        shutdown.cancel();

        assert!(waiter.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(shutdown.wait_timeout(Duration::from_secs(30)));
    }

    #[test]
    fn test_wakeup_is_remembered() {
        let wakeup = Wakeup::new();
        wakeup.notify();
        assert!(wakeup.wait_timeout(Duration::from_millis(1)));
        assert!(!wakeup.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_wakeup_across_threads() {
        let wakeup = Arc::new(Wakeup::new());
        let waiter = {
            let wakeup = Arc::clone(&wakeup);
            thread::spawn(move || wakeup.wait_timeout(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        wakeup.notify();
        assert!(waiter.join().unwrap());
    }
}
