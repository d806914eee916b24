use std::{
    any::Any,
    convert::TryFrom,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crate::{
    queue::ThreadSafeQueue,
    task::{Task, TaskRef},
};

/// A type which receives notifications from a worker.
pub(crate) trait Listener {
    fn on_task_started(&mut self, _task: &Task) {}

    fn on_task_completed(&mut self, _task: &Task, _panic: Option<&(dyn Any + Send)>) {}

    /// Polled once per loop iteration; the worker exits when it returns true.
    fn should_stop(&mut self) -> bool;
}

/// How idle workers look for work. Shared by all workers of a pool and
/// adjustable at runtime.
#[derive(Debug)]
pub(crate) struct IdlePolicy {
    wait_if_no_task: AtomicBool,
    idle_time_nanos: AtomicU64,
}

/// Idle times beyond `u64::MAX` nanoseconds, about 584 years, are clamped.
fn clamped_nanos(idle_time: Duration) -> u64 {
    u64::try_from(idle_time.as_nanos()).unwrap_or(u64::MAX)
}

impl IdlePolicy {
    pub(crate) fn new(wait_if_no_task: bool, idle_time: Duration) -> Self {
        Self {
            wait_if_no_task: AtomicBool::new(wait_if_no_task),
            idle_time_nanos: AtomicU64::new(clamped_nanos(idle_time)),
        }
    }

    pub(crate) fn set_idle_time(&self, idle_time: Duration) {
        self.idle_time_nanos
            .store(clamped_nanos(idle_time), Ordering::Relaxed);
        self.wait_if_no_task.store(true, Ordering::Relaxed);
    }

    pub(crate) fn wait_if_no_task(&self) -> bool {
        self.wait_if_no_task.load(Ordering::Relaxed)
    }

    pub(crate) fn idle_time(&self) -> Duration {
        Duration::from_nanos(self.idle_time_nanos.load(Ordering::Relaxed))
    }
}

/// Per-worker flags shared between a worker thread and its pool.
#[derive(Debug, Default)]
pub(crate) struct WorkerControl {
    idle: AtomicBool,
    retired: AtomicBool,
}

impl WorkerControl {
    pub(crate) fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    /// Ask the worker to exit after its current task.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

/// A worker thread which belongs to a thread pool and executes tasks.
pub(crate) struct Worker<L: Listener> {
    control: Arc<WorkerControl>,

    /// Queue of tasks to run, shared with the pool.
    queue: Arc<ThreadSafeQueue<TaskRef>>,

    policy: Arc<IdlePolicy>,

    /// Receiver of various worker events.
    listener: L,
}

impl<L: Listener> Worker<L> {
    pub(crate) fn new(
        control: Arc<WorkerControl>,
        queue: Arc<ThreadSafeQueue<TaskRef>>,
        policy: Arc<IdlePolicy>,
        listener: L,
    ) -> Self {
        Self {
            control,
            queue,
            policy,
            listener,
        }
    }

    pub(crate) fn run(mut self) {
        loop {
            // Read before checking for shutdown; a shutdown requested after
            // this point interrupts the pop below.
            let epoch = self.queue.interrupt_epoch();

            if self.control.is_retired() || self.listener.should_stop() {
                break;
            }

            self.control.idle.store(true, Ordering::SeqCst);

            match self.next_task(epoch) {
                Some(task) => {
                    self.control.idle.store(false, Ordering::SeqCst);
                    self.run_task(task);
                }
                None => thread::yield_now(),
            }
        }
    }

    fn next_task(&self, epoch: usize) -> Option<TaskRef> {
        if !self.policy.wait_if_no_task() {
            return self.queue.try_pop();
        }

        match self.queue.timed_pop_since(self.policy.idle_time(), epoch) {
            Ok(task) => task,
            Err(e) => {
                tracing::error!("worker failed to wait for tasks: {}", e);
                None
            }
        }
    }

    fn run_task(&mut self, task: TaskRef) {
        self.listener.on_task_started(&task);

        let result = catch_unwind(AssertUnwindSafe(|| task.run()));

        // Waiters are released even if the task panicked.
        task.notify_done();

        self.listener
            .on_task_completed(&task, result.as_ref().err().map(|e| &**e));
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "Box<dyn Any>"
    }
}
