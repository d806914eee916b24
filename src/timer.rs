//! A background thread running tasks after a delay.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::Mutex as RawMutex;

use crate::{
    cond::deadline_after,
    error::{Error, Result},
    monitor::{Monitor, MonitorGuard},
    pool::apply_priority,
    worker::panic_message,
};

const THREAD_NAME: &str = "threadloom-timer";

/// Work run by a [`Timer`].
///
/// Implemented for every `Fn() + Send + Sync` closure.
pub trait TimerTask: Send + Sync + 'static {
    fn run_timer_task(&self);
}

impl<F> TimerTask for F
where
    F: Fn() + Send + Sync + 'static,
{
    fn run_timer_task(&self) {
        self()
    }
}

/// Shared handle to a [`TimerTask`]. A task is identified by its allocation,
/// so the same handle is needed to cancel it.
pub type TimerTaskRef = Arc<dyn TimerTask>;

fn task_key(task: &TimerTaskRef) -> usize {
    Arc::as_ptr(task) as *const () as usize
}

/// Runs tasks on a dedicated thread once their delay has passed.
///
/// Tasks run one at a time, earliest deadline first. A repeated task is
/// scheduled again one period after each run finishes, until it is
/// cancelled or the timer is destroyed. Panics in a task are logged and do not
/// stop the timer.
///
/// Dropping the timer destroys it.
///
/// # Examples
///
/// ```
/// use std::{sync::Arc, time::Duration};
/// use threadloom::{Timer, TimerTaskRef};
///
/// let timer = Timer::new().unwrap();
/// let (tx, rx) = crossbeam_channel::bounded(1);
///
/// let task: TimerTaskRef = Arc::new(move || {
///     let _ = tx.try_send(());
/// });
/// timer.schedule(task, Duration::from_millis(10)).unwrap();
///
/// rx.recv().unwrap();
/// ```
pub struct Timer {
    shared: Arc<Shared>,
    thread: RawMutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Start a timer thread.
    pub fn new() -> Result<Self> {
        Self::start(None)
    }

    /// Start a timer thread running at the given priority. See
    /// [`Builder::thread_priority`](crate::Builder::thread_priority).
    pub fn with_priority(priority: i32) -> Result<Self> {
        Self::start(Some(priority))
    }

    fn start(priority: Option<i32>) -> Result<Self> {
        let shared = Arc::new(Shared {
            monitor: Monitor::new(),
            schedule: RawMutex::new(Schedule::default()),
        });

        let thread = {
            let shared = shared.clone();

            thread::Builder::new()
                .name(THREAD_NAME.into())
                .spawn(move || {
                    if let Some(priority) = priority {
                        apply_priority(THREAD_NAME, priority);
                    }

                    shared.run();
                })?
        };

        Ok(Self {
            shared,
            thread: RawMutex::new(Some(thread)),
        })
    }

    /// Run `task` once, `delay` from now.
    ///
    /// Fails with [`Error::AlreadyScheduled`] if the task is still pending on
    /// this timer, and with [`Error::TimerDestroyed`] after
    /// [`destroy`](Timer::destroy).
    pub fn schedule(&self, task: TimerTaskRef, delay: Duration) -> Result<()> {
        let at = deadline_after(delay)?;

        self.shared.insert(task, at, None)
    }

    /// Run `task` every `period`, starting one period from now.
    pub fn schedule_repeated(&self, task: TimerTaskRef, period: Duration) -> Result<()> {
        self.schedule_repeated_from(task, period, Instant::now())
    }

    /// Run `task` every `period`, starting one period after `base`.
    ///
    /// A zero period is rejected with [`Error::InvalidTimeout`].
    pub fn schedule_repeated_from(
        &self,
        task: TimerTaskRef,
        period: Duration,
        base: Instant,
    ) -> Result<()> {
        if period == Duration::ZERO {
            return Err(Error::InvalidTimeout);
        }

        let at = base.checked_add(period).ok_or(Error::InvalidTimeout)?;

        self.shared.insert(task, at, Some(period))
    }

    /// Cancel a scheduled task.
    ///
    /// Returns `true` if the task was pending, or is a repeated task. Returns
    /// `false` if it already ran once, was never scheduled, or was cancelled
    /// before. A run in progress is not interrupted.
    pub fn cancel(&self, task: &TimerTaskRef) -> bool {
        let _guard = self.shared.monitor.guard();
        let mut schedule = self.shared.schedule.lock();

        if schedule.destroyed {
            return false;
        }

        let key = task_key(task);

        match schedule.tasks.remove(&key) {
            Some(at) => {
                schedule.queue.remove(&(at, key));
                true
            }
            None => false,
        }
    }

    /// Drop every scheduled task and stop the timer thread, waiting for a
    /// task in progress to finish. Called from a task of this timer, the
    /// thread is left to exit on its own instead.
    ///
    /// Calling this again is a no-op.
    pub fn destroy(&self) {
        {
            let guard = self.shared.monitor.guard();
            let mut schedule = self.shared.schedule.lock();

            if schedule.destroyed {
                return;
            }

            schedule.destroyed = true;
            schedule.queue.clear();
            schedule.tasks.clear();
            guard.notify();
        }

        let thread = self.thread.lock().take();

        if let Some(thread) = thread {
            if thread.thread().id() == thread::current().id() {
                tracing::trace!("timer destroyed from its own thread, detaching");
            } else if thread.join().is_err() {
                tracing::error!("timer thread panicked");
            }
        }
    }

    pub fn is_destroyed(&self) -> bool {
        let _guard = self.shared.monitor.guard();

        self.shared.schedule.lock().destroyed
    }

    /// Number of tasks waiting for their next run.
    pub fn scheduled_tasks(&self) -> usize {
        let _guard = self.shared.monitor.guard();

        self.shared.schedule.lock().queue.len()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("scheduled_tasks", &self.scheduled_tasks())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

struct Shared {
    monitor: Monitor,

    /// Only locked while `monitor` is held.
    schedule: RawMutex<Schedule>,
}

#[derive(Default)]
struct Schedule {
    destroyed: bool,

    /// Deadline the timer thread is sleeping towards, if any.
    wake_up: Option<Instant>,

    /// Pending runs ordered by deadline, ties broken by task key.
    queue: BTreeMap<(Instant, usize), Entry>,

    /// Deadline of every task not yet run or cancelled. Repeated tasks stay
    /// here while they run.
    tasks: HashMap<usize, Instant>,
}

struct Entry {
    task: TimerTaskRef,
    period: Option<Duration>,
}

struct Due {
    at: Instant,
    key: usize,
    entry: Entry,
}

impl Shared {
    fn insert(&self, task: TimerTaskRef, at: Instant, period: Option<Duration>) -> Result<()> {
        let guard = self.monitor.guard();
        let mut schedule = self.schedule.lock();

        if schedule.destroyed {
            return Err(Error::TimerDestroyed);
        }

        let key = task_key(&task);

        if schedule.tasks.contains_key(&key) {
            return Err(Error::AlreadyScheduled);
        }

        schedule.tasks.insert(key, at);
        schedule.queue.insert((at, key), Entry { task, period });

        if schedule.wake_up.map_or(true, |wake_up| at < wake_up) {
            guard.notify();
        }

        Ok(())
    }

    fn run(&self) {
        let mut finished: Option<Due> = None;

        loop {
            let due = {
                let mut guard = self.monitor.guard();

                if let Some(due) = finished.take() {
                    self.reschedule(due);
                }

                match self.next_due(&mut guard) {
                    Ok(Some(due)) => due,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("timer thread failed to wait for tasks: {}", e);
                        break;
                    }
                }
            };

            let task = &due.entry.task;

            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task.run_timer_task())) {
                tracing::error!("timer task panicked: {}", panic_message(&*payload));
            }

            if due.entry.period.is_some() {
                finished = Some(due);
            }
        }
    }

    /// Put a repeated task back, one period after its run ended. Must be
    /// called with the monitor held.
    fn reschedule(&self, due: Due) {
        let mut schedule = self.schedule.lock();

        // Cancelled, and possibly scheduled anew, while it ran.
        if schedule.destroyed || schedule.tasks.get(&due.key) != Some(&due.at) {
            return;
        }

        let next = due
            .entry
            .period
            .and_then(|period| Instant::now().checked_add(period));

        match next {
            Some(at) => {
                schedule.tasks.insert(due.key, at);
                schedule.queue.insert((at, due.key), due.entry);
            }
            None => {
                schedule.tasks.remove(&due.key);
            }
        }
    }

    /// Wait until the earliest task is due and take it out of the queue.
    /// Returns `None` once the timer is destroyed.
    fn next_due(&self, guard: &mut MonitorGuard<'_>) -> Result<Option<Due>> {
        loop {
            let timeout = {
                let mut schedule = self.schedule.lock();

                if schedule.destroyed {
                    return Ok(None);
                }

                let now = Instant::now();
                let first = schedule.queue.keys().next().copied();

                match first {
                    Some((at, key)) if at <= now => {
                        schedule.wake_up = None;

                        if let Some(entry) = schedule.queue.remove(&(at, key)) {
                            if entry.period.is_none() {
                                schedule.tasks.remove(&key);
                            }

                            return Ok(Some(Due { at, key, entry }));
                        }

                        continue;
                    }
                    Some((at, _)) => {
                        schedule.wake_up = Some(at);
                        Some(at - now)
                    }
                    None => {
                        schedule.wake_up = None;
                        None
                    }
                }
            };

            match timeout {
                Some(timeout) => {
                    guard.timed_wait(timeout)?;
                }
                None => guard.wait()?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crossbeam_channel::{unbounded, Sender};

    use super::*;

    fn send_on_run<T: Clone + Send + Sync + 'static>(tx: &Sender<T>, value: T) -> TimerTaskRef {
        let tx = tx.clone();

        Arc::new(move || {
            let _ = tx.send(value.clone());
        })
    }

    #[test]
    fn runs_once_after_delay() {
        let timer = Timer::new().unwrap();
        let (tx, rx) = unbounded();
        let started = Instant::now();

        timer
            .schedule(send_on_run(&tx, ()), Duration::from_millis(30))
            .unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(timer.scheduled_tasks(), 0);
    }

    #[test]
    fn earliest_deadline_runs_first() {
        let timer = Timer::new().unwrap();
        let (tx, rx) = unbounded();

        timer
            .schedule(send_on_run(&tx, "late"), Duration::from_millis(80))
            .unwrap();
        timer
            .schedule(send_on_run(&tx, "early"), Duration::from_millis(20))
            .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
    }

    #[test]
    fn repeated_task_runs_until_cancelled() {
        let timer = Timer::new().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = unbounded();

        let task: TimerTaskRef = {
            let runs = runs.clone();

            Arc::new(move || {
                runs.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            })
        };

        timer
            .schedule_repeated(task.clone(), Duration::from_millis(5))
            .unwrap();

        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }

        assert!(timer.cancel(&task));
        assert!(!timer.cancel(&task));

        // A run in progress at cancellation may still finish.
        thread::sleep(Duration::from_millis(50));
        let settled = runs.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn cancelled_task_never_runs() {
        let timer = Timer::new().unwrap();
        let (tx, rx) = unbounded();
        let task = send_on_run(&tx, ());

        timer.schedule(task.clone(), Duration::from_millis(50)).unwrap();
        assert!(timer.cancel(&task));

        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    }

    #[test]
    fn scheduling_errors() {
        let timer = Timer::new().unwrap();
        let (tx, _rx) = unbounded();
        let task = send_on_run(&tx, ());

        timer.schedule(task.clone(), Duration::from_secs(60)).unwrap();
        assert!(matches!(
            timer.schedule(task.clone(), Duration::from_secs(1)),
            Err(Error::AlreadyScheduled)
        ));
        assert!(matches!(
            timer.schedule_repeated(send_on_run(&tx, ()), Duration::ZERO),
            Err(Error::InvalidTimeout)
        ));

        timer.destroy();
        assert!(timer.is_destroyed());
        assert!(!timer.cancel(&task));
        assert!(matches!(
            timer.schedule(task, Duration::from_millis(1)),
            Err(Error::TimerDestroyed)
        ));
    }

    #[test]
    fn panicking_task_does_not_stop_timer() {
        let timer = Timer::new().unwrap();
        let (tx, rx) = unbounded();

        timer
            .schedule(Arc::new(|| panic!("timer task")), Duration::ZERO)
            .unwrap();
        timer
            .schedule(send_on_run(&tx, ()), Duration::from_millis(10))
            .unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn destroy_from_own_task() {
        let timer = Arc::new(Timer::new().unwrap());
        let (tx, rx) = unbounded();

        let task: TimerTaskRef = {
            let timer = timer.clone();

            Arc::new(move || {
                timer.destroy();
                let _ = tx.send(());
            })
        };

        timer.schedule(task, Duration::ZERO).unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(timer.is_destroyed());
    }
}
