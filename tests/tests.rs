use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use threadloom::{CountdownLatch, Error, Task, ThreadPool};

fn single_thread() -> ThreadPool {
    ThreadPool::builder().size(0..1).build().unwrap()
}

#[test]
#[should_panic(expected = "thread pool name must not contain null bytes")]
fn name_with_null_bytes_panics() {
    let _ = ThreadPool::builder().name("uh\0oh").build();
}

#[test]
#[should_panic(expected = "thread pool minimum size cannot be larger than maximum size")]
fn invalid_size_panics() {
    ThreadPool::builder().size(2..1);
}

#[test]
#[should_panic(expected = "thread pool maximum size must be non-zero")]
fn invalid_size_zero_panics() {
    ThreadPool::builder().size(0);
}

#[test]
fn submit_runs_task() {
    let pool = single_thread();
    let counter = Arc::new(AtomicUsize::new(0));

    let task = {
        let counter = counter.clone();
        Task::new("increment", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    };

    pool.submit(task.clone()).unwrap();
    task.wait_done().unwrap();

    assert!(task.is_done());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn every_task_runs_exactly_once() {
    let pool = ThreadPool::builder().size(2..8).build().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..10_000 {
        let counter = counter.clone();
        pool.submit_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    pool.join_all();

    assert_eq!(counter.load(Ordering::SeqCst), 10_000);
    assert_eq!(pool.completed_tasks(), 10_000);
    assert_eq!(pool.in_use(), 0);
}

#[test]
fn threads_never_exceed_size_max() {
    let pool = ThreadPool::builder().size(1..4).build().unwrap();
    let latch = Arc::new(CountdownLatch::new(1));

    let tasks = (0..20)
        .map(|_| {
            let latch = latch.clone();
            let task = pool
                .submit_fn(move || {
                    latch.wait().unwrap();
                })
                .unwrap();

            assert!(pool.threads() <= 4);
            task
        })
        .collect::<Vec<_>>();

    assert_eq!(pool.threads(), 4);
    assert_eq!(pool.in_use(), 20);

    latch.count_down();
    for task in tasks {
        task.wait_done().unwrap();
    }

    assert!(pool.threads() <= 4);
}

#[test]
fn timed_wait_done_on_slow_task() {
    let pool = single_thread();

    let task = pool
        .submit_fn(|| thread::sleep(Duration::from_millis(500)))
        .unwrap();

    assert!(!task.timed_wait_done(Duration::from_millis(100)).unwrap());
    assert!(task.timed_wait_done(Duration::from_secs(5)).unwrap());
}

#[test]
fn single_thread_runs_in_submission_order() {
    let pool = ThreadPool::new(1).unwrap();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    for i in 0..100 {
        let order = order.clone();
        pool.submit_fn(move || order.lock().push(i)).unwrap();
    }

    pool.join_all();

    assert_eq!(*order.lock(), (0..100).collect::<Vec<_>>());
}

#[test]
fn join_all_twice() {
    let pool = ThreadPool::new(2).unwrap();

    pool.submit_fn(|| thread::sleep(Duration::from_millis(10)))
        .unwrap();

    pool.join_all();
    assert_eq!(pool.threads(), 0);

    pool.join_all();
    assert_eq!(pool.threads(), 0);
    assert!(pool.is_destroyed());
}

#[test]
fn submit_after_join_fails_until_reset() {
    let pool = ThreadPool::builder().name("joined").size(1).build().unwrap();
    pool.join_all();

    let task = Task::new("late", || {});
    match pool.submit(task.clone()) {
        Err(Error::PoolDestroyed { pool }) => assert_eq!(pool, "joined"),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(!task.is_done());

    pool.reset().unwrap();
    pool.submit(task.clone()).unwrap();
    task.wait_done().unwrap();
}

#[test]
fn panicking_task_is_marked_done() {
    let pool = single_thread();

    let task = pool.submit_fn(|| panic!("oh no!")).unwrap();
    task.wait_done().unwrap();

    // The same worker keeps going.
    let task = pool.submit_fn(|| {}).unwrap();
    task.wait_done().unwrap();

    pool.join_all();
    assert_eq!(pool.panicked_tasks(), 1);
    assert_eq!(pool.completed_tasks(), 2);
}

#[test]
fn reset_task_runs_again() {
    let pool = single_thread();
    let counter = Arc::new(AtomicUsize::new(0));

    let task = {
        let counter = counter.clone();
        Task::new("again", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    };

    for _ in 0..3 {
        task.reset();
        pool.submit(task.clone()).unwrap();
        task.wait_done().unwrap();
    }

    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[test]
fn polling_workers_still_run_tasks() {
    let pool = ThreadPool::builder()
        .size(2)
        .wait_if_no_task(false)
        .build()
        .unwrap();

    let task = pool.submit_fn(|| {}).unwrap();
    task.wait_done().unwrap();

    pool.set_thread_idle_time(Duration::from_millis(5));
    let task = pool.submit_fn(|| {}).unwrap();
    task.wait_done().unwrap();
}

#[test]
fn join_all_returns_quickly_with_long_idle_time() {
    let pool = ThreadPool::builder()
        .size(4)
        .thread_idle_time(Duration::from_secs(60))
        .build()
        .unwrap();

    let started = std::time::Instant::now();
    pool.join_all();

    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn pool_from_properties() {
    let mut properties = HashMap::new();
    properties.insert("db.Size".to_string(), "2".to_string());
    properties.insert("db.SizeMax".to_string(), "1".to_string());
    properties.insert("db.WaitIfNoTask".to_string(), "true".to_string());
    properties.insert("db.ThreadIdleTime".to_string(), "20".to_string());

    let pool = ThreadPool::from_properties("db", &properties).unwrap();

    assert_eq!(pool.name(), "db");
    assert_eq!(pool.threads(), 2);

    properties.insert("db.Size".to_string(), "two".to_string());
    assert!(matches!(
        ThreadPool::from_properties("db", &properties),
        Err(Error::InvalidConfig { .. })
    ));
}

#[test]
fn name() {
    let pool = ThreadPool::builder().name("foo").size(1).build().unwrap();
    let (tx, rx) = crossbeam_channel::bounded(1);

    pool.submit_fn(move || {
        let _ = tx.send(thread::current().name().map(str::to_owned));
    })
    .unwrap();

    assert_eq!(rx.recv().unwrap().as_deref(), Some("foo"));
}

#[test]
fn reaching_size_warn_keeps_running_tasks() {
    let pool = ThreadPool::builder()
        .size(1..2)
        .size_warn(2)
        .build()
        .unwrap();
    let latch = Arc::new(CountdownLatch::new(1));

    let tasks = (0..4)
        .map(|_| {
            let latch = latch.clone();
            pool.submit_fn(move || latch.wait().unwrap()).unwrap()
        })
        .collect::<Vec<_>>();

    assert!(pool.in_use() >= 2);
    assert_eq!(pool.threads(), 2);

    latch.count_down();
    for task in tasks {
        task.wait_done().unwrap();
    }
    assert_eq!(pool.completed_tasks(), 4);
}
