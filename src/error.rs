use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The kinds of failure reported by the synchronization primitives and the
/// thread pool.
///
/// Timeouts are never reported as errors; timed operations return `false` or
/// `None` instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The calling thread does not hold the lock in the way the operation
    /// requires, e.g. waiting on a condition without owning its lock, or
    /// unlocking a lock owned by another thread.
    #[error("lock is not held by the calling thread")]
    ThreadLocked,

    /// The operation would never complete, such as requesting a second
    /// concurrent upgrade of a read-write lock.
    #[error("operation would deadlock")]
    Deadlock,

    /// A timeout that cannot be turned into a deadline, or a zero period for
    /// a repeated timer task.
    #[error("invalid timeout")]
    InvalidTimeout,

    /// An operating system call failed, most commonly thread creation.
    #[error("thread system call failed: {0}")]
    ThreadSyscall(#[from] io::Error),

    /// A task was submitted to a pool that has already been joined.
    #[error("cannot submit task to destroyed thread pool `{pool}`; reset the pool or create a new one")]
    PoolDestroyed {
        /// Name of the pool.
        pool: String,
    },

    /// A task was scheduled on a timer that has been destroyed.
    #[error("timer has been destroyed")]
    TimerDestroyed,

    /// The task is already scheduled on this timer.
    #[error("task is already scheduled")]
    AlreadyScheduled,

    /// A configuration property could not be parsed.
    #[error("invalid value `{value}` for property `{key}`")]
    InvalidConfig {
        /// Full property key, including the pool prefix.
        key: String,
        /// Raw value found in the property source.
        value: String,
    },
}

impl Error {
    /// Returns the OS error code carried by a [`Error::ThreadSyscall`], if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::ThreadSyscall(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
