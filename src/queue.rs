//! An unbounded FIFO queue with separate head and tail locks.

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex as RawMutex;

use crate::{
    cond::{deadline_after, remaining},
    error::Result,
    monitor::{Monitor, MonitorGuard},
};

type Link<T> = Arc<RawMutex<Node<T>>>;

struct Node<T> {
    value: Option<T>,

    /// `None` only for the dummy node at the tail.
    next: Option<Link<T>>,
}

impl<T> Node<T> {
    fn dummy() -> Link<T> {
        Arc::new(RawMutex::new(Self {
            value: None,
            next: None,
        }))
    }
}

/// A thread-safe FIFO queue built as a singly linked list.
///
/// The list always ends in an empty dummy node, so a head without a successor
/// means the queue is empty. Each node has its own lock: producers take the
/// tail lock and then the tail node, consumers take the head monitor and then
/// the head node, so the two sides only contend when they meet at a single
/// node. Consumers can block until data arrives, and producers only signal
/// when a consumer is recorded as waiting.
pub struct ThreadSafeQueue<T> {
    /// Front of the list. Only locked while `head_monitor` is held.
    head: RawMutex<Link<T>>,
    head_monitor: Monitor,

    tail: RawMutex<Link<T>>,

    waiting_readers: AtomicUsize,
    len: AtomicUsize,

    /// Bumped to kick waiters out of `timed_pop`.
    interrupts: AtomicUsize,
}

impl<T> Default for ThreadSafeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ThreadSafeQueue<T> {
    pub fn new() -> Self {
        let dummy = Node::dummy();

        Self {
            head: RawMutex::new(dummy.clone()),
            head_monitor: Monitor::new(),
            tail: RawMutex::new(dummy),
            waiting_readers: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
            interrupts: AtomicUsize::new(0),
        }
    }

    /// Append a value to the back of the queue.
    pub fn push(&self, value: T) {
        let new_tail = Node::dummy();

        {
            let mut tail = self.tail.lock();

            // Counted before a consumer can see the value.
            self.len.fetch_add(1, Ordering::SeqCst);

            {
                let mut node = tail.lock();
                node.value = Some(value);
                node.next = Some(new_tail.clone());
            }
            *tail = new_tail;
        }

        if self.waiting_readers.load(Ordering::SeqCst) > 0 {
            self.head_monitor.guard().notify();
        }
    }

    /// Remove the value at the front of the queue without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let head = self.head_monitor.guard();

        self.pop_head(&head)
    }

    /// Remove the value at the front of the queue, blocking until one is
    /// available.
    pub fn pop(&self) -> Result<T> {
        let mut head = self.head_monitor.guard();

        loop {
            if let Some(value) = self.pop_head(&head) {
                return Ok(value);
            }

            self.waiting_readers.fetch_add(1, Ordering::SeqCst);
            let result = if self.head_is_tail(&head) {
                head.wait()
            } else {
                Ok(())
            };
            self.waiting_readers.fetch_sub(1, Ordering::SeqCst);

            result?;
        }
    }

    /// Remove the value at the front of the queue, waiting at most `timeout`
    /// for one to arrive.
    ///
    /// Returns `None` if the timeout elapsed, or if
    /// [`interrupt_waiters`](ThreadSafeQueue::interrupt_waiters) was called
    /// while waiting.
    pub fn timed_pop(&self, timeout: Duration) -> Result<Option<T>> {
        let mut head = self.head_monitor.guard();
        let epoch = self.interrupt_epoch();

        self.timed_pop_locked(&mut head, timeout, epoch)
    }

    /// Number of [`interrupt_waiters`](ThreadSafeQueue::interrupt_waiters)
    /// calls so far.
    pub(crate) fn interrupt_epoch(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    /// Like [`timed_pop`](ThreadSafeQueue::timed_pop), but also returns `None`
    /// right away if an interrupt happened since `epoch` was read.
    pub(crate) fn timed_pop_since(&self, timeout: Duration, epoch: usize) -> Result<Option<T>> {
        let mut head = self.head_monitor.guard();

        self.timed_pop_locked(&mut head, timeout, epoch)
    }

    fn timed_pop_locked(
        &self,
        head: &mut MonitorGuard<'_>,
        timeout: Duration,
        epoch: usize,
    ) -> Result<Option<T>> {
        let deadline = deadline_after(timeout)?;

        loop {
            if let Some(value) = self.pop_head(head) {
                return Ok(Some(value));
            }

            if self.interrupt_epoch() != epoch {
                return Ok(None);
            }

            let left = match remaining(deadline) {
                Some(left) => left,
                None => return Ok(None),
            };

            self.waiting_readers.fetch_add(1, Ordering::SeqCst);
            let result = if self.head_is_tail(head) {
                head.timed_wait(left)
            } else {
                Ok(true)
            };
            self.waiting_readers.fetch_sub(1, Ordering::SeqCst);

            result?;
        }
    }

    /// Wake every thread blocked in [`timed_pop`](ThreadSafeQueue::timed_pop)
    /// and make it return `None` if nothing is queued.
    pub fn interrupt_waiters(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        self.head_monitor.guard().notify_all();
    }

    pub fn is_empty(&self) -> bool {
        let head = self.head_monitor.guard();

        self.head_is_tail(&head)
    }

    /// Number of queued values. May be outdated as soon as it returns.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    fn head_is_tail(&self, _held: &MonitorGuard<'_>) -> bool {
        self.head.lock().lock().next.is_none()
    }

    fn pop_head(&self, _held: &MonitorGuard<'_>) -> Option<T> {
        let mut head = self.head.lock();

        let (value, next) = {
            let mut node = head.lock();
            let next = node.next.clone()?;

            (node.value.take(), next)
        };
        *head = next;

        self.len.fetch_sub(1, Ordering::SeqCst);
        value
    }
}

impl<T> Drop for ThreadSafeQueue<T> {
    fn drop(&mut self) {
        // Unlink iteratively; dropping a long chain recursively could
        // overflow the stack.
        let mut next = self.head.get_mut().lock().next.take();

        while let Some(node) = next {
            next = node.lock().next.take();
        }
    }
}

impl<T> fmt::Debug for ThreadSafeQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSafeQueue")
            .field("len", &self.len())
            .field("waiting_readers", &self.waiting_readers.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn empty_queue() {
        let queue = ThreadSafeQueue::<u32>::new();

        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn push_then_pop_in_order() {
        let queue = ThreadSafeQueue::new();
        queue.push("a");
        queue.push("b");

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop(), Some("a"));
        assert_eq!(queue.pop().unwrap(), "b");
        assert!(queue.is_empty());
    }

    #[test]
    fn timed_pop_expires() {
        let queue = ThreadSafeQueue::<u32>::new();

        assert_eq!(queue.timed_pop(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn interrupt_before_wait_is_not_lost() {
        let queue = ThreadSafeQueue::<u32>::new();
        let epoch = queue.interrupt_epoch();

        queue.interrupt_waiters();

        let started = std::time::Instant::now();
        assert_eq!(queue.timed_pop_since(Duration::from_secs(5), epoch).unwrap(), None);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn drop_releases_queued_values() {
        let value = Arc::new(());
        let queue = ThreadSafeQueue::new();

        for _ in 0..3 {
            queue.push(value.clone());
        }
        drop(queue.try_pop());
        assert_eq!(Arc::strong_count(&value), 3);

        drop(queue);
        assert_eq!(Arc::strong_count(&value), 1);
    }

    #[test]
    fn dropping_long_queue() {
        let queue = ThreadSafeQueue::new();

        for i in 0..200_000 {
            queue.push(i);
        }
    }
}
