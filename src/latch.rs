use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use crate::{
    cond::{deadline_after, remaining},
    error::Result,
    monitor::Monitor,
};

/// A synchronization aid letting threads wait until a set of operations
/// performed elsewhere has completed.
///
/// The latch starts at a count; [`count_down`](CountdownLatch::count_down)
/// decrements it, and every waiter is released once it reaches zero. Unlike a
/// one-shot latch it can be re-armed with [`reset`](CountdownLatch::reset).
///
/// # Examples
///
/// ```
/// use std::{sync::Arc, thread};
/// use threadloom::CountdownLatch;
///
/// let latch = Arc::new(CountdownLatch::new(3));
///
/// for _ in 0..3 {
///     let latch = latch.clone();
///     thread::spawn(move || latch.count_down());
/// }
///
/// latch.wait().unwrap();
/// assert_eq!(latch.count(), 0);
/// ```
pub struct CountdownLatch {
    monitor: Monitor,

    /// Guarded by `monitor`.
    count: AtomicUsize,
}

impl CountdownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            monitor: Monitor::new(),
            count: AtomicUsize::new(count),
        }
    }

    /// Decrement the count, releasing all waiters if it reaches zero.
    /// Does nothing if the count is already zero.
    pub fn count_down(&self) {
        let guard = self.monitor.guard();

        match self.count.load(Ordering::Relaxed) {
            0 => {}
            1 => {
                self.count.store(0, Ordering::Relaxed);
                guard.notify_all();
            }
            n => self.count.store(n - 1, Ordering::Relaxed),
        }
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) -> Result<()> {
        let mut guard = self.monitor.guard();

        guard.wait_while(|| self.count.load(Ordering::Relaxed) > 0)
    }

    /// Block until the count reaches zero or `timeout` elapses. Returns
    /// `false` on timeout.
    pub fn timed_wait(&self, timeout: Duration) -> Result<bool> {
        let deadline = deadline_after(timeout)?;
        let mut guard = self.monitor.guard();

        while self.count.load(Ordering::Relaxed) > 0 {
            match remaining(deadline) {
                Some(left) => {
                    guard.timed_wait(left)?;
                }
                None => return Ok(false),
            }
        }

        Ok(true)
    }

    pub fn count(&self) -> usize {
        let _guard = self.monitor.guard();

        self.count.load(Ordering::Relaxed)
    }

    /// Re-arm the latch with a new count.
    ///
    /// Refused, returning `false`, while the previous count has not reached
    /// zero yet.
    pub fn reset(&self, count: usize) -> bool {
        let _guard = self.monitor.guard();

        if self.count.load(Ordering::Relaxed) != 0 {
            return false;
        }

        self.count.store(count, Ordering::Relaxed);
        true
    }
}

impl fmt::Debug for CountdownLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountdownLatch")
            .field("count", &self.count())
            .finish()
    }
}
