//! Implementation of the thread pool itself.

use std::{
    any::Any,
    fmt,
    io,
    mem,
    ops::{Range, RangeInclusive, RangeTo, RangeToInclusive},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex as RawMutex;

use crate::{
    config::{PoolConfig, PropertySource, DEFAULT_IDLE_TIME, DEFAULT_SHRINK_CYCLE},
    error::{Error, Result},
    monitor::Monitor,
    queue::ThreadSafeQueue,
    task::{Task, TaskRef},
    worker::{panic_message, IdlePolicy, Listener, Worker, WorkerControl},
};

#[cfg(target_has_atomic = "64")]
type AtomicCounter = std::sync::atomic::AtomicU64;

#[cfg(not(target_has_atomic = "64"))]
type AtomicCounter = std::sync::atomic::AtomicU32;

/// A value describing a size constraint for a thread pool.
///
/// Any size constraint can be wrapped in [`PerCore`] to be made relative to the
/// number of available CPU cores on the current system.
///
/// See [`Builder::size`] for details.
pub trait SizeConstraint {
    /// Get the number of threads started with the thread pool.
    fn min(&self) -> usize;

    /// Get the maximum number of threads to be in the thread pool.
    fn max(&self) -> usize;
}

impl SizeConstraint for usize {
    fn min(&self) -> usize {
        *self
    }

    fn max(&self) -> usize {
        *self
    }
}

impl SizeConstraint for Range<usize> {
    fn min(&self) -> usize {
        self.start
    }

    fn max(&self) -> usize {
        self.end
    }
}

impl SizeConstraint for RangeInclusive<usize> {
    fn min(&self) -> usize {
        *self.start()
    }

    fn max(&self) -> usize {
        *self.end()
    }
}

impl SizeConstraint for RangeTo<usize> {
    fn min(&self) -> usize {
        0
    }

    fn max(&self) -> usize {
        self.end
    }
}

impl SizeConstraint for RangeToInclusive<usize> {
    fn min(&self) -> usize {
        0
    }

    fn max(&self) -> usize {
        self.end
    }
}

/// Modifies a size constraint to be per available CPU core.
///
/// # Examples
///
/// ```
/// # use threadloom::PerCore;
/// // one thread per core
/// let size = PerCore(1);
///
/// // four threads per core
/// let size = PerCore(4);
///
/// // one thread per core up front, growing to at most 2 threads per core
/// let size = PerCore(1..2);
/// ```
pub struct PerCore<T>(pub T);

static CORE_COUNT: Lazy<usize> = Lazy::new(|| num_cpus::get().max(1));

/// Number of CPU cores on the current system, at least 1.
pub(crate) fn core_count() -> usize {
    *CORE_COUNT
}

impl<T> From<T> for PerCore<T> {
    fn from(size: T) -> Self {
        Self(size)
    }
}

impl<T: SizeConstraint> SizeConstraint for PerCore<T> {
    fn min(&self) -> usize {
        *CORE_COUNT * self.0.min()
    }

    fn max(&self) -> usize {
        *CORE_COUNT * self.0.max()
    }
}

/// A builder for constructing a customized [`ThreadPool`].
///
/// # Examples
///
/// ```
/// let custom_pool = threadloom::builder()
///     .name("my-pool")
///     .size(2)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug)]
pub struct Builder {
    name: Option<String>,
    size: Option<(usize, usize)>,
    size_warn: Option<usize>,
    stack_size: Option<usize>,
    wait_if_no_task: bool,
    thread_idle_time: Duration,
    shrink_if_no_task: bool,
    shrink_cycle_time: Duration,
    thread_priority: Option<i32>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            name: None,
            size: None,
            size_warn: None,
            stack_size: None,
            wait_if_no_task: true,
            thread_idle_time: DEFAULT_IDLE_TIME,
            shrink_if_no_task: false,
            shrink_cycle_time: DEFAULT_SHRINK_CYCLE,
            thread_priority: None,
        }
    }
}

impl Builder {
    /// Create a builder from an already validated [`PoolConfig`].
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`Builder::name`] and
    /// [`Builder::size`].
    pub fn from_config(config: PoolConfig) -> Self {
        let mut builder = Self::default()
            .name(config.name)
            .size(config.size..=config.size_max)
            .shrink_if_no_task(config.shrink_if_no_task)
            .shrink_cycle_time(config.shrink_cycle_time);

        builder.size_warn = config.size_warn;
        builder.stack_size = config.stack_size;
        builder.thread_priority = config.thread_priority;

        if config.wait_if_no_task {
            builder.thread_idle_time(config.thread_idle_time)
        } else {
            builder.wait_if_no_task(false)
        }
    }

    /// Set the name of the thread pool. Worker threads are given this name,
    /// and it appears in log messages about the pool.
    ///
    /// # Panics
    ///
    /// Panics if the name contains null bytes (`\0`).
    ///
    /// # Examples
    ///
    /// ```
    /// let pool = threadloom::builder().name("my-pool").build().unwrap();
    /// ```
    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        let name = name.into();

        if name.as_bytes().contains(&0) {
            panic!("thread pool name must not contain null bytes");
        }

        self.name = Some(name);
        self
    }

    /// Set the number of threads to be managed by this thread pool.
    ///
    /// If a `usize` is supplied, the pool will have a fixed number of threads.
    /// If a range is supplied, the lower bound is the number of threads
    /// started with the pool, while the upper bound is the maximum the pool
    /// grows to when every thread is busy.
    ///
    /// Any size constraint can be wrapped in [`PerCore`] to be made relative to
    /// the number of available CPU cores on the current system.
    ///
    /// If not set, a reasonable size will be selected based on the number of
    /// CPU cores on the current system.
    ///
    /// # Examples
    ///
    /// ```
    /// // Create a thread pool with exactly 2 threads.
    /// let pool = threadloom::builder().size(2).build().unwrap();
    /// ```
    ///
    /// ```
    /// // Create a thread pool with no threads, which spawns up to 4 threads
    /// // lazily when there's work to be done.
    /// let pool = threadloom::builder().size(..4).build().unwrap();
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if an invalid range is supplied with a lower bound larger than
    /// the upper bound, or if the upper bound is 0.
    pub fn size<S: SizeConstraint>(mut self, size: S) -> Self {
        let (min, max) = (size.min(), size.max());

        if min > max {
            panic!("thread pool minimum size cannot be larger than maximum size");
        }

        if max == 0 {
            panic!("thread pool maximum size must be non-zero");
        }

        self.size = Some((min, max));
        self
    }

    /// Log a warning whenever the number of outstanding tasks reaches this
    /// value.
    pub fn size_warn(mut self, size_warn: usize) -> Self {
        self.size_warn = Some(size_warn);
        self
    }

    /// Set the size of the stack (in bytes) for threads in this thread pool.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// enforces a larger minimum stack size.
    ///
    /// The stack size if not specified will be the default size for new Rust
    /// threads, currently 2 MiB. This can also be overridden by setting the
    /// `RUST_MIN_STACK` environment variable if not specified in code.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Choose whether idle workers block on the task queue (the default) or
    /// poll it and yield the processor between attempts.
    pub fn wait_if_no_task(mut self, wait: bool) -> Self {
        self.wait_if_no_task = wait;
        self
    }

    /// Set how long an idle worker blocks on the task queue before checking
    /// whether it should exit. Implies [`wait_if_no_task`](Builder::wait_if_no_task).
    pub fn thread_idle_time(mut self, idle_time: Duration) -> Self {
        self.wait_if_no_task = true;
        self.thread_idle_time = idle_time;
        self
    }

    /// Run a background thread which periodically retires idle workers,
    /// shrinking the pool back towards its initial size.
    pub fn shrink_if_no_task(mut self, shrink: bool) -> Self {
        self.shrink_if_no_task = shrink;
        self
    }

    /// Set the interval between two shrink passes.
    pub fn shrink_cycle_time(mut self, cycle: Duration) -> Self {
        self.shrink_cycle_time = cycle;
        self
    }

    /// Set the scheduling priority of worker threads. On Unix this is the
    /// nice value of each worker; elsewhere it is ignored with a warning.
    pub fn thread_priority(mut self, priority: i32) -> Self {
        self.thread_priority = Some(priority);
        self
    }

    /// Create a thread pool according to the configuration set with this
    /// builder.
    pub fn build(self) -> Result<ThreadPool> {
        let size = self.size.unwrap_or_else(|| {
            let size = PerCore(1..2);

            (size.min(), size.max())
        });

        let shared = Shared {
            name: self.name.clone().unwrap_or_else(|| "threadloom".into()),
            thread_name: self.name,
            size: size.0,
            size_max: size.1,
            size_warn: self.size_warn,
            stack_size: self.stack_size,
            thread_priority: self.thread_priority,
            shrink_if_no_task: self.shrink_if_no_task,
            shrink_cycle_time: self.shrink_cycle_time,
            queue: Arc::new(ThreadSafeQueue::new()),
            policy: Arc::new(IdlePolicy::new(
                self.wait_if_no_task,
                self.thread_idle_time,
            )),
            destroyed: AtomicBool::new(false),
            in_use: AtomicUsize::new(0),
            completed_tasks_count: Default::default(),
            panicked_tasks_count: Default::default(),
            live_threads: AtomicUsize::new(0),
            monitor: Monitor::new(),
            workers: RawMutex::new(Workers::default()),
        };

        let pool = ThreadPool {
            shared: Arc::new(shared),
        };

        // On failure the pool is dropped here, which joins whatever was
        // already started.
        pool.start()?;

        Ok(pool)
    }
}

/// A pool of worker threads executing submitted [`Task`]s in FIFO order.
///
/// A pool starts with its configured initial number of threads and grows by
/// one thread whenever a task is submitted while every thread already has
/// work, up to its maximum size. Optionally, a background shrinker retires
/// idle threads again.
///
/// Dropping the pool calls [`join_all`](ThreadPool::join_all), so every task
/// submitted before the drop still runs.
///
/// # Monitoring
///
/// Each pool instance provides methods for gathering various statistics on the
/// pool's usage, such as the current number of threads, tasks completed over
/// time, and queued tasks. While these methods provide the most up-to-date
/// numbers upon invocation, they should not be used for controlling program
/// behavior since they can become immediately outdated due to the live nature
/// of the pool.
pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    /// Create a thread pool with a fixed number of threads.
    pub fn new(size: usize) -> Result<Self> {
        Self::builder().size(size).build()
    }

    /// Create the thread pool called `name` from `<name>.<Key>` properties.
    ///
    /// See [`PoolConfig::from_properties`] for the recognized keys.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::collections::HashMap;
    ///
    /// let mut properties = HashMap::new();
    /// properties.insert("io.Size".to_string(), "2".to_string());
    /// properties.insert("io.SizeMax".to_string(), "4".to_string());
    ///
    /// let pool = threadloom::ThreadPool::from_properties("io", &properties).unwrap();
    /// assert_eq!(pool.name(), "io");
    /// assert_eq!(pool.threads(), 2);
    /// ```
    pub fn from_properties<P>(name: &str, properties: &P) -> Result<Self>
    where
        P: PropertySource + ?Sized,
    {
        Builder::from_config(PoolConfig::from_properties(name, properties)?).build()
    }

    /// Get a builder for creating a customized thread pool.
    #[inline]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Get the name of the thread pool.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Get the number of threads currently running in the thread pool,
    /// including idle threads being retired by the shrinker.
    pub fn threads(&self) -> usize {
        let _guard = self.shared.monitor.guard();
        let workers = self.shared.workers.lock();

        workers.threads.len() + workers.retiring
    }

    /// Get the number of tasks submitted but not yet completed, whether they
    /// are queued or running.
    #[inline]
    pub fn in_use(&self) -> usize {
        self.shared.in_use.load(Ordering::SeqCst)
    }

    /// Get the number of tasks queued for execution, but not yet started.
    ///
    /// Note that the number returned may become immediately outdated after
    /// invocation.
    #[inline]
    pub fn queued_tasks(&self) -> usize {
        self.shared.queue.len()
    }

    /// Get the number of tasks completed (successfully or otherwise) by this
    /// pool since it was created.
    ///
    /// # Examples
    ///
    /// ```
    /// let pool = threadloom::ThreadPool::new(1).unwrap();
    /// assert_eq!(pool.completed_tasks(), 0);
    ///
    /// pool.submit_fn(|| {}).unwrap().wait_done().unwrap();
    /// pool.join_all();
    /// assert_eq!(pool.completed_tasks(), 1);
    /// ```
    #[inline]
    #[allow(clippy::useless_conversion)]
    pub fn completed_tasks(&self) -> u64 {
        self.shared.completed_tasks_count.load(Ordering::Relaxed).into()
    }

    /// Get the number of tasks that have panicked since the pool was created.
    #[inline]
    #[allow(clippy::useless_conversion)]
    pub fn panicked_tasks(&self) -> u64 {
        self.shared.panicked_tasks_count.load(Ordering::Relaxed).into()
    }

    /// Returns `true` once [`join_all`](ThreadPool::join_all) has run and
    /// until the next [`reset`](ThreadPool::reset).
    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    /// Submit a task to be executed by the thread pool.
    ///
    /// If every thread already has work and the pool is below its maximum
    /// size, an additional thread is started.
    ///
    /// Fails with [`Error::PoolDestroyed`] after
    /// [`join_all`](ThreadPool::join_all); the task is not run. Also fails if
    /// the pool has no thread and starting one fails, in which case the task
    /// is not queued and the pool stays usable.
    pub fn submit(&self, task: TaskRef) -> Result<()> {
        let shared = &self.shared;
        let _guard = shared.monitor.guard();

        if shared.destroyed.load(Ordering::SeqCst) {
            tracing::error!(
                "task `{}` ({}) submitted to thread pool `{}` after it was destroyed",
                task.name(),
                task.type_name(),
                shared.name
            );

            return Err(Error::PoolDestroyed {
                pool: shared.name.clone(),
            });
        }

        // Counted before the push so a worker can never finish the task
        // before it is accounted for.
        let in_use = shared.in_use.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(size_warn) = shared.size_warn.filter(|&warn| warn == in_use) {
            tracing::warn!(
                "thread pool `{}` is running low on threads: InUse={} Size={} SizeMax={} SizeWarn={}",
                shared.name,
                in_use,
                shared.size,
                shared.size_max,
                size_warn
            );
        }

        let mut workers = shared.workers.lock();
        let threads = workers.threads.len();

        // Retiring threads are still alive, so they count against the limit.
        if in_use >= threads && threads + workers.retiring < shared.size_max {
            tracing::trace!(
                "growing thread pool `{}`: Size={} InUse={}",
                shared.name,
                threads + 1,
                in_use
            );

            if let Err(e) = spawn_worker(shared, &mut workers) {
                // Without a thread the task would never run.
                if threads == 0 {
                    shared.in_use.fetch_sub(1, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        shared.queue.push(task);

        Ok(())
    }

    /// Submit a closure to be executed by the thread pool, returning the task
    /// created for it.
    ///
    /// # Examples
    ///
    /// ```
    /// let pool = threadloom::ThreadPool::new(2).unwrap();
    /// let task = pool.submit_fn(|| {
    ///     // some expensive computation
    /// }).unwrap();
    ///
    /// task.wait_done().unwrap();
    /// ```
    pub fn submit_fn<F>(&self, job: F) -> Result<TaskRef>
    where
        F: FnMut() + Send + 'static,
    {
        let task = Task::new("", job);

        self.submit(task.clone())?;

        Ok(task)
    }

    /// Wait for every submitted task to complete, then stop and join all
    /// threads of the pool.
    ///
    /// Submitting to the pool fails from then on, until
    /// [`reset`](ThreadPool::reset) is called. Calling this again is a no-op.
    pub fn join_all(&self) {
        let shared = &self.shared;

        let (threads, shrinker) = loop {
            while !shared.queue.is_empty() {
                thread::yield_now();
            }

            let _guard = shared.monitor.guard();

            // Submitters check the flag under the monitor, so nothing can be
            // queued after this point.
            if shared.queue.is_empty() {
                shared.destroyed.store(true, Ordering::SeqCst);

                let mut workers = shared.workers.lock();
                break (mem::take(&mut workers.threads), workers.shrinker.take());
            }
        };

        if let Some(shrinker) = shrinker {
            shrinker.stop();
        }

        shared.queue.interrupt_waiters();

        let joined = threads.len();
        for worker in threads {
            join_worker(&shared.name, worker);
        }

        tracing::trace!(
            "all the threads of `{}` have joined: Size={}",
            shared.name,
            joined
        );

        debug_assert_eq!(shared.in_use.load(Ordering::SeqCst), 0);
        debug_assert_eq!(shared.live_threads.load(Ordering::SeqCst), 0);
    }

    /// Make a pool destroyed by [`join_all`](ThreadPool::join_all) usable
    /// again, starting its initial threads anew.
    pub fn reset(&self) -> Result<()> {
        self.shared.destroyed.store(false, Ordering::SeqCst);

        self.start()
    }

    /// Set how long idle threads block on the task queue before checking for
    /// shutdown, switching them to blocking waits if they were polling.
    pub fn set_thread_idle_time(&self, idle_time: Duration) {
        self.shared.policy.set_idle_time(idle_time);
    }

    /// Top up the pool to its initial size and start the shrinker if enabled.
    fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let _guard = shared.monitor.guard();
        let mut workers = shared.workers.lock();

        while workers.threads.len() < shared.size {
            spawn_worker(shared, &mut workers)?;
        }

        if shared.shrink_if_no_task && workers.shrinker.is_none() {
            workers.shrinker = Some(Shrinker::start(shared)?);
        }

        Ok(())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.join_all();
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name())
            .field("threads", &self.threads())
            .field("in_use", &self.in_use())
            .field("queued_tasks", &self.queued_tasks())
            .field("completed_tasks", &self.completed_tasks())
            .finish()
    }
}

/// Thread pool state shared by the owner and the worker threads.
struct Shared {
    name: String,
    thread_name: Option<String>,
    size: usize,
    size_max: usize,
    size_warn: Option<usize>,
    stack_size: Option<usize>,
    thread_priority: Option<i32>,
    shrink_if_no_task: bool,
    shrink_cycle_time: Duration,
    queue: Arc<ThreadSafeQueue<TaskRef>>,
    policy: Arc<IdlePolicy>,
    destroyed: AtomicBool,

    /// Tasks submitted and not yet completed.
    in_use: AtomicUsize,

    completed_tasks_count: AtomicCounter,
    panicked_tasks_count: AtomicCounter,

    /// Worker threads that have started and not yet exited.
    live_threads: AtomicUsize,

    monitor: Monitor,

    /// Only locked while `monitor` is held.
    workers: RawMutex<Workers>,
}

#[derive(Default)]
struct Workers {
    threads: Vec<WorkerHandle>,

    /// Threads removed by the shrinker that have not been joined yet.
    retiring: usize,

    shrinker: Option<Shrinker>,
}

struct WorkerHandle {
    control: Arc<WorkerControl>,
    thread: JoinHandle<()>,
}

struct WorkerListener {
    shared: Arc<Shared>,
}

impl Listener for WorkerListener {
    fn on_task_completed(&mut self, task: &Task, panic: Option<&(dyn Any + Send)>) {
        let shared = &self.shared;

        if let Some(payload) = panic {
            shared.panicked_tasks_count.fetch_add(1, Ordering::Relaxed);

            tracing::error!(
                "task `{}` ({}) in thread pool `{}` panicked: {}",
                task.name(),
                task.type_name(),
                shared.name,
                panic_message(payload)
            );
        }

        shared.completed_tasks_count.fetch_add(1, Ordering::Relaxed);
        shared.in_use.fetch_sub(1, Ordering::SeqCst);
    }

    fn should_stop(&mut self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }
}

/// Spawn an additional worker thread into the pool.
fn spawn_worker(shared: &Arc<Shared>, workers: &mut Workers) -> Result<()> {
    // Configure the thread based on the thread pool configuration.
    let mut builder = thread::Builder::new();

    if let Some(name) = shared.thread_name.as_ref() {
        builder = builder.name(name.clone());
    }

    if let Some(size) = shared.stack_size {
        builder = builder.stack_size(size);
    }

    let control = Arc::new(WorkerControl::default());
    let worker = Worker::new(
        control.clone(),
        shared.queue.clone(),
        shared.policy.clone(),
        WorkerListener {
            shared: shared.clone(),
        },
    );
    let priority = shared.thread_priority;
    let live = shared.clone();

    let thread = builder
        .spawn(move || {
            let live = LiveThread::enter(live);

            if let Some(priority) = priority {
                apply_priority(&live.0.name, priority);
            }

            worker.run();
        })
        .map_err(|e| {
            tracing::error!("failed to start a thread in pool `{}`: {}", shared.name, e);
            e
        })?;

    workers.threads.push(WorkerHandle { control, thread });

    Ok(())
}

/// Counts a worker thread in `Shared::live_threads` until it exits.
struct LiveThread(Arc<Shared>);

impl LiveThread {
    fn enter(shared: Arc<Shared>) -> Self {
        shared.live_threads.fetch_add(1, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for LiveThread {
    fn drop(&mut self) {
        self.0.live_threads.fetch_sub(1, Ordering::SeqCst);
    }
}

fn join_worker(pool_name: &str, worker: WorkerHandle) {
    if worker.thread.join().is_err() {
        tracing::error!("a worker thread of pool `{}` panicked", pool_name);
    }
}

pub(crate) fn apply_priority(owner: &str, priority: i32) {
    if let Err(e) = set_current_thread_priority(priority) {
        tracing::warn!(
            "failed to set priority {} on a thread of `{}`: {}",
            priority,
            owner,
            e
        );
    }
}

#[cfg(unix)]
fn set_current_thread_priority(priority: i32) -> io::Result<()> {
    // On Linux, PRIO_PROCESS with a zero id targets the calling thread.
    let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, priority) };

    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(unix))]
fn set_current_thread_priority(_priority: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "thread priorities are not supported on this platform",
    ))
}

/// Background thread retiring idle workers once per cycle.
struct Shrinker {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

impl Shrinker {
    fn start(shared: &Arc<Shared>) -> Result<Self> {
        let (stop, stopped) = bounded::<()>(0);
        let cycle = shared.shrink_cycle_time;
        let shared = shared.clone();

        let thread = thread::Builder::new()
            .name(format!("{}-shrinker", shared.name))
            .spawn(move || loop {
                match stopped.recv_timeout(cycle) {
                    Err(RecvTimeoutError::Timeout) => shrink(&shared),
                    _ => break,
                }
            })?;

        Ok(Self { stop, thread })
    }

    fn stop(self) {
        // Disconnecting the channel wakes the shrinker.
        drop(self.stop);

        if self.thread.join().is_err() {
            tracing::error!("thread pool shrinker panicked");
        }
    }
}

/// Retire idle workers until at most half of them, but no fewer than the
/// initial size, remain.
fn shrink(shared: &Shared) {
    let retired = {
        let _guard = shared.monitor.guard();

        if shared.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let mut workers = shared.workers.lock();
        let reserve = shared.size.max((workers.threads.len() + 1) / 2);
        let mut retired = Vec::new();
        let mut i = 0;

        while i < workers.threads.len() && workers.threads.len() > reserve {
            if workers.threads[i].control.is_idle() {
                let worker = workers.threads.swap_remove(i);
                worker.control.retire();
                retired.push(worker);
            } else {
                i += 1;
            }
        }

        workers.retiring += retired.len();

        if !retired.is_empty() {
            tracing::trace!(
                "shrinking thread pool `{}`: Size={} Retired={}",
                shared.name,
                workers.threads.len(),
                retired.len()
            );
        }

        retired
    };

    if retired.is_empty() {
        return;
    }

    shared.queue.interrupt_waiters();

    let count = retired.len();
    for worker in retired {
        join_worker(&shared.name, worker);
    }

    let _guard = shared.monitor.guard();
    shared.workers.lock().retiring -= count;
}
