use std::{
    any, fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex as RawMutex;

use crate::{
    cond::{deadline_after, remaining},
    error::Result,
    monitor::Monitor,
};

/// Shared handle to a [`Task`].
pub type TaskRef = Arc<Task>;

/// A unit of work for a [`ThreadPool`](crate::ThreadPool), doubling as a
/// future for its own completion.
///
/// A task is executed by exactly one worker per submission. Once it has run,
/// every caller blocked in [`wait_done`](Task::wait_done) is woken. A task
/// that panics is still marked done; the panic is logged by the pool and not
/// reported through the task.
///
/// Tasks can be [`reset`](Task::reset) and submitted again.
///
/// # Examples
///
/// ```
/// use std::sync::{atomic::{AtomicUsize, Ordering}, Arc};
/// use threadloom::{Task, ThreadPool};
///
/// let counter = Arc::new(AtomicUsize::new(0));
/// let task = {
///     let counter = counter.clone();
///     Task::new("count", move || {
///         counter.fetch_add(1, Ordering::SeqCst);
///     })
/// };
///
/// let pool = ThreadPool::builder().size(1).build().unwrap();
/// pool.submit(task.clone()).unwrap();
/// task.wait_done().unwrap();
///
/// assert_eq!(counter.load(Ordering::SeqCst), 1);
/// ```
pub struct Task {
    name: String,
    type_name: &'static str,
    job: RawMutex<Box<dyn FnMut() + Send>>,

    monitor: Monitor,

    /// Guarded by `monitor`.
    done: AtomicBool,

    /// Guarded by `monitor`.
    waiters: AtomicUsize,
}

impl Task {
    /// Create a task running `job` every time it is executed.
    pub fn new<N, F>(name: N, job: F) -> TaskRef
    where
        N: Into<String>,
        F: FnMut() + Send + 'static,
    {
        Arc::new(Self {
            name: name.into(),
            type_name: any::type_name::<F>(),
            job: RawMutex::new(Box::new(job)),
            monitor: Monitor::new(),
            done: AtomicBool::new(false),
            waiters: AtomicUsize::new(0),
        })
    }

    /// The name given to the task, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The type of the closure the task runs, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns `true` if the task has run since it was created or last reset.
    pub fn is_done(&self) -> bool {
        let _guard = self.monitor.guard();

        self.done.load(Ordering::Relaxed)
    }

    /// Mark the task as not done so it can be submitted again.
    pub fn reset(&self) {
        let _guard = self.monitor.guard();

        self.done.store(false, Ordering::Relaxed);
    }

    /// Block until the task has run.
    pub fn wait_done(&self) -> Result<()> {
        let mut guard = self.monitor.guard();

        while !self.done.load(Ordering::Relaxed) {
            self.waiters.fetch_add(1, Ordering::Relaxed);
            let result = guard.wait();
            self.waiters.fetch_sub(1, Ordering::Relaxed);

            result?;
        }

        Ok(())
    }

    /// Block until the task has run or `timeout` elapses.
    ///
    /// Returns `false` if the task was still not done when the timeout
    /// elapsed.
    pub fn timed_wait_done(&self, timeout: Duration) -> Result<bool> {
        let deadline = deadline_after(timeout)?;
        let mut guard = self.monitor.guard();

        while !self.done.load(Ordering::Relaxed) {
            let left = match remaining(deadline) {
                Some(left) => left,
                None => return Ok(false),
            };

            self.waiters.fetch_add(1, Ordering::Relaxed);
            let result = guard.timed_wait(left);
            self.waiters.fetch_sub(1, Ordering::Relaxed);

            result?;
        }

        Ok(true)
    }

    /// Mark the task as done and wake everyone waiting for it.
    pub fn notify_done(&self) {
        let guard = self.monitor.guard();

        self.done.store(true, Ordering::Relaxed);

        if self.waiters.load(Ordering::Relaxed) != 0 {
            guard.notify_all();
        }
    }

    /// Run the task body on the calling thread.
    pub(crate) fn run(&self) {
        let mut job = self.job.lock();

        (*job)();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("done", &self.done.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn notify_wakes_waiter() {
        let task = Task::new("noop", || {});

        let waiter = {
            let task = task.clone();
            thread::spawn(move || task.wait_done())
        };

        thread::sleep(Duration::from_millis(20));
        task.notify_done();

        waiter.join().unwrap().unwrap();
        assert!(task.is_done());
    }

    #[test]
    fn reset_clears_done() {
        let task = Task::new("noop", || {});
        task.run();
        task.notify_done();
        assert!(task.timed_wait_done(Duration::ZERO).unwrap());

        task.reset();
        assert!(!task.is_done());
        assert!(!task.timed_wait_done(Duration::from_millis(5)).unwrap());
    }

    #[test]
    fn type_name_names_the_closure() {
        fn job() {}

        let task = Task::new("fn", job);

        assert!(task.type_name().ends_with("job"));
    }
}
