use std::{
    fmt,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex as RawMutex};

use crate::{
    error::{Error, Result},
    lockable::Lockable,
};

/// A condition variable that works with any [`Lockable`].
///
/// Waiting releases the lock completely (every recursion level) and restores
/// it before returning, on every exit path. A signal sent after the waiter has
/// released its lock is never lost: the waiter holds an internal gate from
/// before it releases the lock until it is parked, and signalling takes the
/// same gate.
///
/// Wakeups may be spurious. Callers re-check their predicate in a loop, or use
/// [`Cond::wait_while`].
#[derive(Default)]
pub struct Cond {
    gate: RawMutex<()>,
    cond: Condvar,
}

impl Cond {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake one thread blocked on this condition.
    pub fn signal(&self) {
        let _gate = self.gate.lock();
        self.cond.notify_one();
    }

    /// Wake every thread blocked on this condition.
    pub fn broadcast(&self) {
        let _gate = self.gate.lock();
        self.cond.notify_all();
    }

    /// Release `lock`, block until signalled, then re-acquire `lock`.
    ///
    /// Fails with [`Error::ThreadLocked`] if the calling thread does not hold
    /// `lock`.
    pub fn wait<L: Lockable>(&self, lock: &L) -> Result<()> {
        let mut gate = self.gate.lock();
        let state = lock.release_for_wait()?;

        self.cond.wait(&mut gate);

        // The gate must be dropped first; a signalling thread may be holding
        // `lock` while it waits for the gate.
        drop(gate);
        lock.reacquire_after_wait(state);

        Ok(())
    }

    /// Block while `condition` returns `true`.
    pub fn wait_while<L, F>(&self, lock: &L, mut condition: F) -> Result<()>
    where
        L: Lockable,
        F: FnMut() -> bool,
    {
        while condition() {
            self.wait(lock)?;
        }

        Ok(())
    }

    /// Like [`Cond::wait`], but gives up after `timeout`.
    ///
    /// Returns `false` if the timeout elapsed before a signal arrived. The
    /// lock is re-acquired in both cases.
    pub fn timed_wait<L: Lockable>(&self, lock: &L, timeout: Duration) -> Result<bool> {
        let deadline = deadline_after(timeout)?;

        self.wait_until(lock, deadline)
    }

    /// Like [`Cond::wait`], but gives up once `deadline` passes.
    pub fn wait_until<L: Lockable>(&self, lock: &L, deadline: Instant) -> Result<bool> {
        let mut gate = self.gate.lock();
        let state = lock.release_for_wait()?;

        let result = self.cond.wait_until(&mut gate, deadline);

        drop(gate);
        lock.reacquire_after_wait(state);

        Ok(!result.timed_out())
    }
}

impl fmt::Debug for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cond(..)")
    }
}

/// Turn a timeout into a deadline, rejecting timeouts too large to represent.
pub(crate) fn deadline_after(timeout: Duration) -> Result<Instant> {
    Instant::now()
        .checked_add(timeout)
        .ok_or(Error::InvalidTimeout)
}

/// Time left until `deadline`, or `None` once it has passed.
pub(crate) fn remaining(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|left| *left > Duration::ZERO)
}
