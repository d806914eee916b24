//! Mesa-style monitors with deferred notification.

use std::{
    fmt,
    marker::PhantomData,
    sync::atomic::{AtomicIsize, Ordering},
    time::Duration,
};

use crate::{
    cond::Cond,
    error::{Error, Result},
    lockable::{Lockable, Mutex},
};

/// Marker stored in the pending counter when a broadcast is pending.
const BROADCAST: isize = -1;

/// A lock bundled with a condition variable.
///
/// Only one thread is active inside the monitor at a time, but a thread may
/// suspend itself inside the monitor with [`wait`](Monitor::wait) to let
/// another one in.
///
/// Notifications follow Mesa semantics: [`notify`](Monitor::notify) and
/// [`notify_all`](Monitor::notify_all) only record the request. It is
/// delivered when the notifying thread releases the monitor completely, or
/// suspends itself in a wait. Delivery happens while the lock is still held,
/// so a woken thread re-acquires a monitor that already reflects every write
/// of the notifier. Repeated notifications between two unlocks coalesce into
/// the fewest possible wakeups.
///
/// The monitor is generic over its lock type so that a recursive lock can be
/// used; pending notifications are then reset on the outermost acquisition
/// and flushed on the outermost release only.
pub struct Monitor<M: Lockable = Mutex> {
    mutex: M,
    cond: Cond,

    /// `0` for none, [`BROADCAST`], or the number of pending signals. Only
    /// touched while `mutex` is held.
    pending: AtomicIsize,
}

impl<M: Lockable + Default> Default for Monitor<M> {
    fn default() -> Self {
        Self::with_lock(M::default())
    }
}

impl Monitor<Mutex> {
    /// Create a monitor over a non-recursive [`Mutex`].
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M: Lockable> Monitor<M> {
    /// Create a monitor over the given lock.
    pub fn with_lock(mutex: M) -> Self {
        Self {
            mutex,
            cond: Cond::new(),
            pending: AtomicIsize::new(0),
        }
    }

    /// Enter the monitor, blocking until it is available.
    pub fn lock(&self) {
        self.mutex.lock();

        if self.mutex.will_unlock() {
            self.pending.store(0, Ordering::Relaxed);
        }
    }

    /// Enter the monitor only if it is immediately available.
    pub fn try_lock(&self) -> bool {
        let locked = self.mutex.try_lock();

        if locked && self.mutex.will_unlock() {
            self.pending.store(0, Ordering::Relaxed);
        }

        locked
    }

    /// Leave the monitor. If this releases the lock completely, pending
    /// notifications are delivered first.
    pub fn unlock(&self) -> Result<()> {
        if !self.mutex.is_held_by_current_thread() {
            return Err(Error::ThreadLocked);
        }

        if self.mutex.will_unlock() {
            self.flush();
        }

        self.mutex.unlock()
    }

    /// Suspend the calling thread until notified.
    ///
    /// Notifications this thread made so far are delivered before it
    /// suspends, so they are not lost to other waiters.
    pub fn wait(&self) -> Result<()> {
        self.ensure_held()?;
        self.flush();
        self.cond.wait(&self.mutex)
    }

    /// Suspend the calling thread until notified or until `timeout` elapses.
    ///
    /// Returns `false` on timeout. The monitor is held again in both cases.
    pub fn timed_wait(&self, timeout: Duration) -> Result<bool> {
        self.ensure_held()?;
        self.flush();
        self.cond.timed_wait(&self.mutex, timeout)
    }

    /// Request that one waiting thread be woken once the monitor is released.
    pub fn notify(&self) {
        let pending = self.pending.load(Ordering::Relaxed);

        if pending != BROADCAST {
            self.pending.store(pending + 1, Ordering::Relaxed);
        }
    }

    /// Request that every waiting thread be woken once the monitor is
    /// released.
    pub fn notify_all(&self) {
        self.pending.store(BROADCAST, Ordering::Relaxed);
    }

    /// Enter the monitor and return a guard that leaves it on drop.
    pub fn guard(&self) -> MonitorGuard<'_, M> {
        self.lock();

        MonitorGuard {
            monitor: self,
            _not_send: PhantomData,
        }
    }

    /// Enter the monitor if it is immediately available.
    pub fn try_guard(&self) -> Option<MonitorGuard<'_, M>> {
        if self.try_lock() {
            Some(MonitorGuard {
                monitor: self,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    /// The underlying lock.
    pub fn lockable(&self) -> &M {
        &self.mutex
    }

    fn ensure_held(&self) -> Result<()> {
        if self.mutex.is_held_by_current_thread() {
            Ok(())
        } else {
            Err(Error::ThreadLocked)
        }
    }

    fn flush(&self) {
        match self.pending.swap(0, Ordering::Relaxed) {
            0 => {}
            BROADCAST => self.cond.broadcast(),
            n => {
                for _ in 0..n {
                    self.cond.signal();
                }
            }
        }
    }

    #[cfg(test)]
    fn pending(&self) -> isize {
        self.pending.load(Ordering::Relaxed)
    }
}

impl<M: Lockable> fmt::Debug for Monitor<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish()
    }
}

/// An RAII guard for a [`Monitor`]. Leaving the scope unlocks the monitor and
/// delivers pending notifications.
#[must_use = "if unused the monitor is released immediately"]
pub struct MonitorGuard<'a, M: Lockable = Mutex> {
    monitor: &'a Monitor<M>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, M: Lockable> MonitorGuard<'a, M> {
    /// See [`Monitor::wait`].
    pub fn wait(&mut self) -> Result<()> {
        self.monitor.wait()
    }

    /// See [`Monitor::timed_wait`].
    pub fn timed_wait(&mut self, timeout: Duration) -> Result<bool> {
        self.monitor.timed_wait(timeout)
    }

    /// Wait while `condition` returns `true`.
    pub fn wait_while<F: FnMut() -> bool>(&mut self, mut condition: F) -> Result<()> {
        while condition() {
            self.monitor.wait()?;
        }

        Ok(())
    }

    /// See [`Monitor::notify`].
    pub fn notify(&self) {
        self.monitor.notify();
    }

    /// See [`Monitor::notify_all`].
    pub fn notify_all(&self) {
        self.monitor.notify_all();
    }

    /// The monitor this guard holds.
    pub fn monitor(&self) -> &'a Monitor<M> {
        self.monitor
    }
}

impl<M: Lockable> Drop for MonitorGuard<'_, M> {
    fn drop(&mut self) {
        let _ = self.monitor.unlock();
    }
}

impl<M: Lockable> fmt::Debug for MonitorGuard<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MonitorGuard(..)")
    }
}
