#![doc = include_str!("../README.md")]

mod cond;
mod config;
mod error;
mod latch;
mod lockable;
mod monitor;
mod pool;
mod queue;
mod rwlock;
mod task;
mod timer;
mod worker;

pub use crate::{
    cond::Cond,
    config::{PoolConfig, PropertySource},
    error::{Error, Result},
    latch::CountdownLatch,
    lockable::{LockGuard, Lockable, Mutex, RecMutex},
    monitor::{Monitor, MonitorGuard},
    pool::{Builder, PerCore, SizeConstraint, ThreadPool},
    queue::ThreadSafeQueue,
    rwlock::{RWRecMutex, ReadGuard, WriteGuard},
    task::{Task, TaskRef},
    timer::{Timer, TimerTask, TimerTaskRef},
};

/// Get a builder for creating a customized thread pool.
///
/// A shorthand for [`ThreadPool::builder`].
#[inline]
pub fn builder() -> Builder {
    ThreadPool::builder()
}
