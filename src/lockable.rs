//! Exclusive locks with explicit ownership tracking.
//!
//! Unlike the guard-only locks in the standard library, the locks in this
//! module can be locked and unlocked by separate calls, know which thread owns
//! them, and can be fully released and restored around a condition wait. That
//! is what [`Monitor`](crate::Monitor) and [`Cond`](crate::Cond) are built on.

use std::{
    fmt,
    marker::PhantomData,
    thread::{self, ThreadId},
};

use parking_lot::{Condvar, Mutex as RawMutex};

use crate::error::{Error, Result};

/// A uniform lock/unlock capability over the exclusive lock types of this
/// crate.
pub trait Lockable {
    /// Whatever the lock needs to remember to restore itself after a wait.
    /// For a recursive lock this is the recursion depth.
    type WaitState;

    /// Block until the lock is acquired by the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if a non-recursive lock is already held by the calling thread.
    fn lock(&self);

    /// Acquire the lock if it is available without blocking.
    fn try_lock(&self) -> bool;

    /// Release one level of the lock held by the calling thread.
    fn unlock(&self) -> Result<()>;

    /// Returns `true` if the next [`unlock`](Lockable::unlock) by the calling
    /// thread releases the lock completely.
    fn will_unlock(&self) -> bool;

    /// Returns `true` if the calling thread currently owns the lock.
    fn is_held_by_current_thread(&self) -> bool;

    /// Release every level held by the calling thread so that another thread
    /// may acquire the lock while this one waits.
    fn release_for_wait(&self) -> Result<Self::WaitState>;

    /// Block until the lock can be re-acquired, restoring the state captured
    /// by [`release_for_wait`](Lockable::release_for_wait).
    fn reacquire_after_wait(&self, state: Self::WaitState);

    /// Acquire the lock and return a guard that releases it on drop.
    fn guard(&self) -> LockGuard<'_, Self>
    where
        Self: Sized,
    {
        LockGuard::new(self)
    }
}

/// An RAII guard holding a [`Lockable`] for its lifetime.
///
/// Guards are tied to the thread that created them and cannot be sent to
/// another thread.
#[must_use = "if unused the lock is released immediately"]
pub struct LockGuard<'a, L: Lockable> {
    lock: &'a L,
    _not_send: PhantomData<*const ()>,
}

impl<'a, L: Lockable> LockGuard<'a, L> {
    /// Block until `lock` is acquired.
    pub fn new(lock: &'a L) -> Self {
        lock.lock();

        Self {
            lock,
            _not_send: PhantomData,
        }
    }

    /// Acquire `lock` only if it is immediately available.
    pub fn try_new(lock: &'a L) -> Option<Self> {
        if lock.try_lock() {
            Some(Self {
                lock,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    /// The lock this guard holds.
    pub fn lockable(&self) -> &'a L {
        self.lock
    }
}

impl<L: Lockable> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        let _ = self.lock.unlock();
    }
}

impl<L: Lockable> fmt::Debug for LockGuard<'_, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LockGuard(..)")
    }
}

#[derive(Default)]
struct Owner {
    thread: Option<ThreadId>,
    depth: usize,
}

/// Ownership-tracking lock shared by [`Mutex`] and [`RecMutex`].
#[derive(Default)]
struct RawLock {
    owner: RawMutex<Owner>,
    released: Condvar,
}

impl RawLock {
    fn lock(&self, recursive: bool) {
        let me = thread::current().id();
        let mut owner = self.owner.lock();

        if owner.thread == Some(me) {
            if !recursive {
                drop(owner);
                panic!("mutex is already locked by the current thread");
            }
            owner.depth += 1;
            return;
        }

        while owner.thread.is_some() {
            self.released.wait(&mut owner);
        }

        owner.thread = Some(me);
        owner.depth = 1;
    }

    fn try_lock(&self, recursive: bool) -> bool {
        let me = thread::current().id();
        let mut owner = self.owner.lock();

        match owner.thread {
            None => {
                owner.thread = Some(me);
                owner.depth = 1;
                true
            }
            Some(thread) if recursive && thread == me => {
                owner.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    fn unlock(&self) -> Result<()> {
        let mut owner = self.owner.lock();

        if owner.thread != Some(thread::current().id()) {
            return Err(Error::ThreadLocked);
        }

        owner.depth -= 1;
        if owner.depth == 0 {
            owner.thread = None;
            drop(owner);
            self.released.notify_one();
        }

        Ok(())
    }

    fn depth(&self) -> usize {
        let owner = self.owner.lock();

        if owner.thread == Some(thread::current().id()) {
            owner.depth
        } else {
            0
        }
    }

    fn release_all(&self) -> Result<usize> {
        let mut owner = self.owner.lock();

        if owner.thread != Some(thread::current().id()) {
            return Err(Error::ThreadLocked);
        }

        let depth = owner.depth;
        owner.thread = None;
        owner.depth = 0;
        drop(owner);
        self.released.notify_one();

        Ok(depth)
    }

    fn restore(&self, depth: usize) {
        let mut owner = self.owner.lock();

        while owner.thread.is_some() {
            self.released.wait(&mut owner);
        }

        owner.thread = Some(thread::current().id());
        owner.depth = depth;
    }

    fn is_locked(&self) -> bool {
        self.owner.lock().thread.is_some()
    }
}

/// A non-recursive exclusive lock.
///
/// Locking it a second time from the owning thread panics instead of hanging
/// forever.
#[derive(Default)]
pub struct Mutex {
    raw: RawLock,
}

impl Mutex {
    /// Create a new unlocked mutex.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if any thread holds the mutex.
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

impl Lockable for Mutex {
    type WaitState = ();

    fn lock(&self) {
        self.raw.lock(false);
    }

    fn try_lock(&self) -> bool {
        self.raw.try_lock(false)
    }

    fn unlock(&self) -> Result<()> {
        self.raw.unlock()
    }

    fn will_unlock(&self) -> bool {
        // A non-recursive lock is always released by a single unlock.
        true
    }

    fn is_held_by_current_thread(&self) -> bool {
        self.raw.depth() > 0
    }

    fn release_for_wait(&self) -> Result<()> {
        self.raw.release_all().map(drop)
    }

    fn reacquire_after_wait(&self, _: ()) {
        self.raw.restore(1);
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// A recursive exclusive lock.
///
/// The owning thread may lock it any number of times and must unlock it the
/// same number of times before another thread can acquire it.
#[derive(Default)]
pub struct RecMutex {
    raw: RawLock,
}

impl RecMutex {
    /// Create a new unlocked recursive mutex.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nested acquisitions held by the calling thread.
    pub fn depth(&self) -> usize {
        self.raw.depth()
    }

    /// Returns `true` if any thread holds the mutex.
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

impl Lockable for RecMutex {
    type WaitState = usize;

    fn lock(&self) {
        self.raw.lock(true);
    }

    fn try_lock(&self) -> bool {
        self.raw.try_lock(true)
    }

    fn unlock(&self) -> Result<()> {
        self.raw.unlock()
    }

    fn will_unlock(&self) -> bool {
        self.raw.depth() == 1
    }

    fn is_held_by_current_thread(&self) -> bool {
        self.raw.depth() > 0
    }

    fn release_for_wait(&self) -> Result<usize> {
        self.raw.release_all()
    }

    fn reacquire_after_wait(&self, depth: usize) {
        self.raw.restore(depth);
    }
}

impl fmt::Debug for RecMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecMutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}
