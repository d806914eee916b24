//! An upgradeable, write-recursive read-write lock.

use std::{
    fmt,
    marker::PhantomData,
    mem,
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    cond::deadline_after,
    error::{Error, Result},
};

struct State {
    /// `> 0`: number of readers, `< 0`: write recursion depth, `0`: free.
    count: isize,

    /// Owner of the write lock, valid while `count < 0`.
    writer: Option<ThreadId>,

    /// Threads blocked wanting write access, upgraders included.
    waiting_writers: usize,

    /// An upgrade is in flight.
    upgrading: bool,
}

impl State {
    fn readers_blocked(&self) -> bool {
        self.count < 0 || self.waiting_writers != 0 || self.upgrading
    }

    fn writer_blocked(&self) -> bool {
        self.count != 0 || self.upgrading
    }

    fn owns_write(&self, me: ThreadId) -> bool {
        self.count < 0 && self.writer == Some(me)
    }

    /// Which waiters may now make progress. At most one of the three
    /// conditions is chosen.
    fn next_wakeup(&self) -> Wakeup {
        if self.count == 0 && self.waiting_writers > 0 {
            if self.upgrading {
                Wakeup::Upgrader
            } else {
                Wakeup::Writer
            }
        } else if self.count >= 0 && self.waiting_writers == 0 && !self.upgrading {
            Wakeup::Readers
        } else {
            Wakeup::Nobody
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Wakeup {
    Nobody,
    Readers,
    Writer,
    Upgrader,
}

/// A reader-writer lock with recursive write locking and reader upgrades.
///
/// - Any number of readers may hold the lock together.
/// - A single writer may hold it, and may lock it again recursively; it must
///   call [`unlock`](RWRecMutex::unlock) once per acquisition.
/// - Waiting writers take priority over new readers.
/// - A reader may [`upgrade`](RWRecMutex::upgrade) to a writer. The upgrade
///   is granted as soon as every other reader is gone, ahead of any writer
///   that was already waiting, and no new reader or writer is admitted while
///   it is pending. [`downgrade`](RWRecMutex::downgrade) turns a single-level
///   write lock back into a read lock without releasing it in between.
///
/// Read locks are not tracked per thread. Re-acquiring a read lock while a
/// writer is waiting blocks behind that writer.
pub struct RWRecMutex {
    state: Mutex<State>,
    readers: Condvar,
    writers: Condvar,
    upgrader: Condvar,
}

impl Default for RWRecMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl RWRecMutex {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                count: 0,
                writer: None,
                waiting_writers: 0,
                upgrading: false,
            }),
            readers: Condvar::new(),
            writers: Condvar::new(),
            upgrader: Condvar::new(),
        }
    }

    /// Block until a read lock is acquired.
    pub fn read_lock(&self) {
        let mut state = self.state.lock();

        while state.readers_blocked() {
            self.readers.wait(&mut state);
        }

        state.count += 1;
    }

    /// Acquire a read lock if no writer holds or wants the lock.
    pub fn try_read_lock(&self) -> bool {
        let mut state = self.state.lock();

        if state.readers_blocked() {
            return false;
        }

        state.count += 1;
        true
    }

    /// Like [`read_lock`](RWRecMutex::read_lock), but gives up after
    /// `timeout`. Returns `false` on timeout.
    pub fn timed_read_lock(&self, timeout: Duration) -> Result<bool> {
        let deadline = deadline_after(timeout)?;
        let mut state = self.state.lock();

        if !wait_until(&self.readers, &mut state, deadline, State::readers_blocked) {
            return Ok(false);
        }

        state.count += 1;
        Ok(true)
    }

    /// Block until the write lock is acquired. Recursive if the calling
    /// thread already holds it.
    pub fn write_lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.owns_write(me) {
            state.count -= 1;
            return;
        }

        if state.writer_blocked() {
            state.waiting_writers += 1;
            while state.writer_blocked() {
                self.writers.wait(&mut state);
            }
            state.waiting_writers -= 1;
        }

        state.count = -1;
        state.writer = Some(me);
    }

    /// Acquire the write lock if it is free, or if the calling thread already
    /// holds it.
    pub fn try_write_lock(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.owns_write(me) {
            state.count -= 1;
            return true;
        }

        if state.writer_blocked() {
            return false;
        }

        state.count = -1;
        state.writer = Some(me);
        true
    }

    /// Like [`write_lock`](RWRecMutex::write_lock), but gives up after
    /// `timeout`. Returns `false` on timeout.
    pub fn timed_write_lock(&self, timeout: Duration) -> Result<bool> {
        let me = thread::current().id();
        let deadline = deadline_after(timeout)?;
        let mut state = self.state.lock();

        if state.owns_write(me) {
            state.count -= 1;
            return Ok(true);
        }

        if state.writer_blocked() {
            state.waiting_writers += 1;
            let acquired = wait_until(&self.writers, &mut state, deadline, State::writer_blocked);
            state.waiting_writers -= 1;

            if !acquired {
                // We may have swallowed a wakeup meant for the next waiter, and
                // readers gated on us may now proceed.
                let wakeup = state.next_wakeup();
                drop(state);
                self.wake(wakeup);
                return Ok(false);
            }
        }

        state.count = -1;
        state.writer = Some(me);
        Ok(true)
    }

    /// Release one read lock or one level of the write lock.
    ///
    /// Fails with [`Error::ThreadLocked`] if the lock is free, or if it is
    /// write-locked by another thread.
    pub fn unlock(&self) -> Result<()> {
        let wakeup = {
            let mut state = self.state.lock();

            if state.count == 0 {
                return Err(Error::ThreadLocked);
            }

            if state.count < 0 {
                if state.writer != Some(thread::current().id()) {
                    return Err(Error::ThreadLocked);
                }

                state.count += 1;
                if state.count < 0 {
                    return Ok(());
                }
                state.writer = None;
            } else {
                state.count -= 1;
            }

            state.next_wakeup()
        };

        self.wake(wakeup);
        Ok(())
    }

    /// Convert the calling thread's read lock into the write lock.
    ///
    /// Blocks until every other reader has released the lock. The upgrade is
    /// granted before any writer that is already waiting.
    ///
    /// Fails with [`Error::Deadlock`] if another thread is already upgrading;
    /// the caller keeps its read lock and should release it so the other
    /// upgrade can finish. Fails with [`Error::ThreadLocked`] if the lock is
    /// not read-locked.
    pub fn upgrade(&self) -> Result<()> {
        let mut state = self.state.lock();

        if state.upgrading {
            return Err(Error::Deadlock);
        }

        if state.count <= 0 {
            return Err(Error::ThreadLocked);
        }

        state.count -= 1;
        state.upgrading = true;

        if state.count != 0 {
            state.waiting_writers += 1;
            while state.count != 0 {
                self.upgrader.wait(&mut state);
            }
            state.waiting_writers -= 1;
        }

        state.count = -1;
        state.writer = Some(thread::current().id());
        state.upgrading = false;
        Ok(())
    }

    /// Like [`upgrade`](RWRecMutex::upgrade), but gives up after `timeout`.
    ///
    /// Returns `false` if the timeout elapsed or another upgrade is in
    /// progress; the caller then still holds its read lock.
    pub fn timed_upgrade(&self, timeout: Duration) -> Result<bool> {
        let deadline = deadline_after(timeout)?;
        let mut state = self.state.lock();

        if state.upgrading {
            return Ok(false);
        }

        if state.count <= 0 {
            return Err(Error::ThreadLocked);
        }

        state.count -= 1;
        state.upgrading = true;

        if state.count != 0 {
            state.waiting_writers += 1;
            let acquired = wait_until(&self.upgrader, &mut state, deadline, |s| s.count != 0);
            state.waiting_writers -= 1;

            if !acquired {
                state.count += 1;
                state.upgrading = false;

                let wakeup = state.next_wakeup();
                drop(state);
                self.wake(wakeup);
                return Ok(false);
            }
        }

        state.count = -1;
        state.writer = Some(thread::current().id());
        state.upgrading = false;
        Ok(true)
    }

    /// Turn the calling thread's single-level write lock into a read lock
    /// without releasing it.
    ///
    /// Writers already waiting stay queued and keep new readers out, so they
    /// get the lock once the downgraded reader unlocks.
    pub fn downgrade(&self) -> Result<()> {
        let wakeup = {
            let mut state = self.state.lock();

            if state.count != -1 || state.writer != Some(thread::current().id()) {
                return Err(Error::ThreadLocked);
            }

            state.count = 1;
            state.writer = None;
            state.next_wakeup()
        };

        self.wake(wakeup);
        Ok(())
    }

    /// Acquire a read lock and return a guard that releases it on drop.
    pub fn read(&self) -> ReadGuard<'_> {
        self.read_lock();
        ReadGuard::new(self)
    }

    /// Acquire a read lock without blocking.
    pub fn try_read(&self) -> Option<ReadGuard<'_>> {
        if self.try_read_lock() {
            Some(ReadGuard::new(self))
        } else {
            None
        }
    }

    /// Acquire the write lock and return a guard that releases one level of
    /// it on drop.
    pub fn write(&self) -> WriteGuard<'_> {
        self.write_lock();
        WriteGuard::new(self)
    }

    /// Acquire the write lock without blocking.
    pub fn try_write(&self) -> Option<WriteGuard<'_>> {
        if self.try_write_lock() {
            Some(WriteGuard::new(self))
        } else {
            None
        }
    }

    /// Number of readers currently holding the lock.
    pub fn readers(&self) -> usize {
        let state = self.state.lock();

        if state.count > 0 {
            state.count as usize
        } else {
            0
        }
    }

    /// Returns `true` if some thread holds the write lock.
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().count < 0
    }

    fn wake(&self, wakeup: Wakeup) {
        match wakeup {
            Wakeup::Nobody => {}
            Wakeup::Readers => {
                self.readers.notify_all();
            }
            Wakeup::Writer => {
                self.writers.notify_one();
            }
            Wakeup::Upgrader => {
                self.upgrader.notify_one();
            }
        }
    }
}

impl fmt::Debug for RWRecMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();

        f.debug_struct("RWRecMutex")
            .field("count", &state.count)
            .field("waiting_writers", &state.waiting_writers)
            .field("upgrading", &state.upgrading)
            .finish()
    }
}

/// Wait on `cond` while `blocked` holds, until `deadline`. Returns `true` if
/// the condition cleared in time.
fn wait_until(
    cond: &Condvar,
    state: &mut MutexGuard<'_, State>,
    deadline: Instant,
    blocked: impl Fn(&State) -> bool,
) -> bool {
    while blocked(&**state) {
        if cond.wait_until(state, deadline).timed_out() {
            return !blocked(&**state);
        }
    }

    true
}

/// A read lock on a [`RWRecMutex`], released on drop.
#[must_use = "if unused the lock is released immediately"]
pub struct ReadGuard<'a> {
    lock: &'a RWRecMutex,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ReadGuard<'a> {
    fn new(lock: &'a RWRecMutex) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }

    /// Upgrade this read lock to the write lock.
    ///
    /// If the upgrade fails the read lock is released.
    pub fn upgrade(self) -> Result<WriteGuard<'a>> {
        let lock = self.lock;
        lock.upgrade()?;
        mem::forget(self);

        Ok(WriteGuard::new(lock))
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let _ = self.lock.unlock();
    }
}

impl fmt::Debug for ReadGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReadGuard(..)")
    }
}

/// One level of the write lock on a [`RWRecMutex`], released on drop.
#[must_use = "if unused the lock is released immediately"]
pub struct WriteGuard<'a> {
    lock: &'a RWRecMutex,
    _not_send: PhantomData<*const ()>,
}

impl<'a> WriteGuard<'a> {
    fn new(lock: &'a RWRecMutex) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }

    /// Downgrade to a read lock without releasing the lock in between.
    ///
    /// Only possible if this is the only level of the write lock held; the
    /// guard is handed back otherwise.
    pub fn downgrade(self) -> Result<ReadGuard<'a>, Self> {
        match self.lock.downgrade() {
            Ok(()) => {
                let lock = self.lock;
                mem::forget(self);
                Ok(ReadGuard::new(lock))
            }
            Err(_) => Err(self),
        }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let _ = self.lock.unlock();
    }
}

impl fmt::Debug for WriteGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WriteGuard(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_wakeup_prefers_upgrader() {
        let state = State {
            count: 0,
            writer: None,
            waiting_writers: 2,
            upgrading: true,
        };
        assert_eq!(state.next_wakeup(), Wakeup::Upgrader);

        let state = State {
            upgrading: false,
            ..state
        };
        assert_eq!(state.next_wakeup(), Wakeup::Writer);

        let state = State {
            waiting_writers: 0,
            ..state
        };
        assert_eq!(state.next_wakeup(), Wakeup::Readers);
    }

    #[test]
    fn readers_wait_behind_pending_writer() {
        let state = State {
            count: 3,
            writer: None,
            waiting_writers: 1,
            upgrading: false,
        };

        assert!(state.readers_blocked());
        assert!(state.writer_blocked());
        assert_eq!(state.next_wakeup(), Wakeup::Nobody);
    }
}
