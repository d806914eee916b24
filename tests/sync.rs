use std::{
    sync::{
        atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use threadloom::{Error, Lockable, Monitor, Mutex, RWRecMutex, RecMutex, ThreadSafeQueue};

#[test]
fn notify_before_unlock_wakes_waiter() {
    let monitor = Arc::new(Monitor::new());
    let ready = Arc::new(AtomicBool::new(false));

    let waiter = {
        let monitor = monitor.clone();
        let ready = ready.clone();

        thread::spawn(move || {
            let mut guard = monitor.guard();
            while !ready.load(Ordering::SeqCst) {
                guard.wait().unwrap();
            }
        })
    };

    thread::sleep(Duration::from_millis(20));
    {
        let guard = monitor.guard();
        ready.store(true, Ordering::SeqCst);
        guard.notify();
    }

    waiter.join().unwrap();
}

#[test]
fn notify_all_wakes_every_waiter() {
    let monitor = Arc::new(Monitor::new());
    let generation = Arc::new(AtomicUsize::new(0));

    let waiters = (0..4)
        .map(|_| {
            let monitor = monitor.clone();
            let generation = generation.clone();

            thread::spawn(move || {
                let mut guard = monitor.guard();
                guard
                    .wait_while(|| generation.load(Ordering::SeqCst) == 0)
                    .unwrap();
            })
        })
        .collect::<Vec<_>>();

    thread::sleep(Duration::from_millis(20));
    {
        let guard = monitor.guard();
        generation.store(1, Ordering::SeqCst);
        guard.notify_all();
    }

    for waiter in waiters {
        waiter.join().unwrap();
    }
}

#[test]
fn recursive_monitor_wait_restores_depth() {
    let monitor = Arc::new(Monitor::with_lock(RecMutex::new()));
    let flag = Arc::new(AtomicBool::new(false));

    let notifier = {
        let monitor = monitor.clone();
        let flag = flag.clone();

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let guard = monitor.guard();
            flag.store(true, Ordering::SeqCst);
            guard.notify();
        })
    };

    let outer = monitor.guard();
    let mut inner = monitor.guard();
    while !flag.load(Ordering::SeqCst) {
        inner.wait().unwrap();
    }
    assert_eq!(monitor.lockable().depth(), 2);

    drop(inner);
    drop(outer);
    assert!(!monitor.lockable().is_locked());

    notifier.join().unwrap();
}

#[test]
fn mutex_unlock_by_non_owner_fails() {
    let mutex = Mutex::new();

    assert!(matches!(mutex.unlock(), Err(Error::ThreadLocked)));
}

#[test]
fn writers_are_exclusive() {
    let lock = Arc::new(RWRecMutex::new());
    let state = Arc::new(AtomicIsize::new(0));

    let threads = (0..8)
        .map(|i| {
            let lock = lock.clone();
            let state = state.clone();

            thread::spawn(move || {
                for _ in 0..200 {
                    if i % 2 == 0 {
                        let _guard = lock.write();
                        assert_eq!(state.swap(-1, Ordering::SeqCst), 0);
                        thread::yield_now();
                        assert_eq!(state.swap(0, Ordering::SeqCst), -1);
                    } else {
                        let _guard = lock.read();
                        assert!(state.fetch_add(1, Ordering::SeqCst) >= 0);
                        thread::yield_now();
                        state.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(lock.readers(), 0);
    assert!(!lock.is_write_locked());
}

#[test]
fn write_lock_is_recursive() {
    let lock = Arc::new(RWRecMutex::new());

    lock.write_lock();
    lock.write_lock();
    assert!(!lock.try_read_lock());
    assert!(lock.downgrade().is_err());

    lock.unlock().unwrap();
    assert!(lock.is_write_locked());

    // Still held once, so other threads are kept out.
    {
        let lock = lock.clone();
        thread::spawn(move || {
            assert!(!lock.try_write_lock());
            assert!(!lock.try_read_lock());
        })
        .join()
        .unwrap();
    }

    lock.unlock().unwrap();
    assert!(!lock.is_write_locked());
    assert!(matches!(lock.unlock(), Err(Error::ThreadLocked)));

    {
        let lock = lock.clone();
        thread::spawn(move || {
            assert!(lock.try_write_lock());
            lock.unlock().unwrap();
            assert!(lock.try_read_lock());
            lock.unlock().unwrap();
        })
        .join()
        .unwrap();
    }
}

#[test]
fn upgrade_beats_waiting_writers() {
    let lock = Arc::new(RWRecMutex::new());
    let (order_tx, order_rx) = crossbeam_channel::unbounded();

    lock.read_lock();

    // Second reader which upgrades.
    let upgrader = {
        let lock = lock.clone();
        let order_tx = order_tx.clone();

        thread::spawn(move || {
            lock.read_lock();
            thread::sleep(Duration::from_millis(50));
            lock.upgrade().unwrap();
            order_tx.send("upgrader").unwrap();
            lock.unlock().unwrap();
        })
    };

    thread::sleep(Duration::from_millis(10));

    // Writers which start waiting before the upgrade is requested.
    let writers = (0..5)
        .map(|_| {
            let lock = lock.clone();
            let order_tx = order_tx.clone();

            thread::spawn(move || {
                lock.write_lock();
                order_tx.send("writer").unwrap();
                lock.unlock().unwrap();
            })
        })
        .collect::<Vec<_>>();

    thread::sleep(Duration::from_millis(100));
    lock.unlock().unwrap();

    upgrader.join().unwrap();
    for writer in writers {
        writer.join().unwrap();
    }

    let order = order_rx.try_iter().collect::<Vec<_>>();
    assert_eq!(order.len(), 6);
    assert_eq!(order[0], "upgrader");
}

#[test]
fn second_upgrade_is_refused() {
    let lock = Arc::new(RWRecMutex::new());
    lock.read_lock();

    let (locked_tx, locked_rx) = crossbeam_channel::bounded(1);

    let upgrader = {
        let lock = lock.clone();

        thread::spawn(move || {
            lock.read_lock();
            locked_tx.send(()).unwrap();
            lock.upgrade().unwrap();
            lock.unlock().unwrap();
        })
    };

    // Wait until the other thread is blocked upgrading.
    locked_rx.recv().unwrap();
    while lock.readers() != 1 {
        thread::yield_now();
    }

    assert!(matches!(lock.upgrade(), Err(Error::Deadlock)));
    assert!(!lock.timed_upgrade(Duration::from_millis(5)).unwrap());

    lock.unlock().unwrap();
    upgrader.join().unwrap();
}

#[test]
fn timed_write_lock_expires_under_readers() {
    let lock = RWRecMutex::new();
    let _reader = lock.read();

    assert!(!lock.timed_write_lock(Duration::from_millis(10)).unwrap());

    // The expired writer must not keep readers out.
    assert!(lock.try_read_lock());
    lock.unlock().unwrap();
}

#[test]
fn read_guard_upgrade_and_downgrade() {
    let lock = RWRecMutex::new();

    let write = lock.read().upgrade().unwrap();
    assert!(lock.is_write_locked());

    let read = write.downgrade().unwrap();
    assert_eq!(lock.readers(), 1);

    drop(read);
    assert_eq!(lock.readers(), 0);
}

#[test]
fn queue_is_fifo_per_producer() {
    let queue = Arc::new(ThreadSafeQueue::new());

    let producers = (0..4)
        .map(|p| {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..1000 {
                    queue.push((p, i));
                }
            })
        })
        .collect::<Vec<_>>();

    let mut last = [None; 4];
    let mut received = 0;

    while received < 4000 {
        if let Some((p, i)) = queue.timed_pop(Duration::from_secs(5)).unwrap() {
            if let Some(prev) = last[p] {
                assert!(i > prev);
            }
            last[p] = Some(i);
            received += 1;
        }
    }

    for producer in producers {
        producer.join().unwrap();
    }

    assert!(queue.is_empty());
}

#[test]
fn blocked_pop_is_woken_by_push() {
    let queue = Arc::new(ThreadSafeQueue::new());

    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || queue.pop().unwrap())
    };

    thread::sleep(Duration::from_millis(20));
    queue.push(7);

    assert_eq!(consumer.join().unwrap(), 7);
}

#[test]
fn interrupt_releases_timed_pop() {
    let queue = Arc::new(ThreadSafeQueue::<u32>::new());

    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || queue.timed_pop(Duration::from_secs(60)).unwrap())
    };

    thread::sleep(Duration::from_millis(20));
    queue.interrupt_waiters();

    assert_eq!(consumer.join().unwrap(), None);
}
