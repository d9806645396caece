//! A bounded, blocking, joinable MPMC queue.
//!
//! The original C++ engine (`BMQueue<T>`) used a two-lock sentinel linked
//! list so concurrent push/pop never contended on the same mutex. That trick
//! buys nothing in Rust once we want a `capacity` and a `join` flag layered
//! on top, so this is a single `Mutex<VecDeque<T>>` with two condvars —
//! the same "one synchronization primitive behind a small enum of channel
//! flavors" shape as the teacher's `core::channel::Channel`, specialized to
//! the one flavor this engine actually needs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize, // 0 = unbounded
    joined: bool,
}

/// Outcome of a bounded wait on an otherwise-blocking pop. Lets a caller
/// (namely `Stage`'s worker loop) re-check a cancellation flag without
/// blocking forever on an empty, unjoined queue.
pub enum WaitOutcome<T> {
    Item(T),
    Drained,
    TimedOut,
}

/// Thread-safe FIFO of owned values with blocking waits, bounded push, and a
/// producer-side "join" signal (spec §4.1).
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    count: AtomicUsize,
}

impl<T> BoundedQueue<T> {
    /// Creates an unbounded queue (`capacity = 0`).
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates a queue bounded to `capacity` in-flight items. `capacity = 0`
    /// means unbounded.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                capacity,
                joined: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            count: AtomicUsize::new(0),
        }
    }

    /// True iff `capacity = 0 ∨ count < capacity`. Lock-free hint; the
    /// authoritative gate is still enforced inside `push`.
    pub fn can_push(&self) -> bool {
        let cap = {
            let guard = self.inner.lock().unwrap();
            guard.capacity
        };
        cap == 0 || self.count.load(Ordering::Acquire) < cap
    }

    /// Changes the push limit. Already-enqueued items are unaffected; a
    /// larger capacity wakes blocked pushers.
    pub fn set_capacity(&self, capacity: usize) {
        let mut guard = self.inner.lock().unwrap();
        guard.capacity = capacity;
        self.not_full.notify_all();
    }

    /// Blocks while `capacity > 0 ∧ count >= capacity`; then enqueues and
    /// wakes one waiter. Never fails; `v` is moved in. Still accepted after
    /// `join()` (producers are expected to have stopped by then, but a push
    /// that races with `join` is not an error).
    pub fn push(&self, v: T) {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if guard.capacity == 0 || guard.items.len() < guard.capacity {
                break;
            }
            guard = self.not_full.wait(guard).unwrap();
        }
        guard.items.push_back(v);
        self.count.store(guard.items.len(), Ordering::Release);
        self.not_empty.notify_one();
    }

    /// Returns immediately; `None` if empty.
    pub fn try_pop(&self) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        let v = guard.items.pop_front();
        if v.is_some() {
            self.count.store(guard.items.len(), Ordering::Release);
            self.not_full.notify_one();
        }
        v
    }

    /// Blocks until an element is available or the queue is `joined` and
    /// empty; returns `None` only in the latter case ("drained" signal).
    pub fn wait_and_pop(&self) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(v) = guard.items.pop_front() {
                self.count.store(guard.items.len(), Ordering::Release);
                self.not_full.notify_one();
                return Some(v);
            }
            if guard.joined {
                return None;
            }
            guard = self.not_empty.wait(guard).unwrap();
        }
    }

    /// Like `wait_and_pop`, but returns `TimedOut` instead of blocking
    /// indefinitely when neither an item nor a join arrives within
    /// `timeout`. This is the "bounded-wait condition-variable wait" of
    /// spec §5: a stage's suspension points use this so a `done` flag set
    /// while nothing is happening on the queue is still observed promptly.
    pub fn wait_and_pop_timeout(&self, timeout: Duration) -> WaitOutcome<T> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(v) = guard.items.pop_front() {
                self.count.store(guard.items.len(), Ordering::Release);
                self.not_full.notify_one();
                return WaitOutcome::Item(v);
            }
            if guard.joined {
                return WaitOutcome::Drained;
            }
            let (next_guard, timeout_result) =
                self.not_empty.wait_timeout(guard, timeout).unwrap();
            guard = next_guard;
            if timeout_result.timed_out() && guard.items.is_empty() && !guard.joined {
                return WaitOutcome::TimedOut;
            }
        }
    }

    /// Sets `joined`; wakes all waiters on both condvars. Further pushes are
    /// still accepted; further pops drain until empty, then return `None`.
    pub fn join(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.joined = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_empty(&self) -> bool {
        let guard = self.inner.lock().unwrap();
        guard.items.is_empty()
    }

    /// Current occupancy. Exposed for tests verifying the bounded-push
    /// invariant (spec §8, property 3); not part of the external contract.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_single_producer_single_consumer() {
        let q = BoundedQueue::new();
        for i in 0..10 {
            q.push(i);
        }
        for i in 0..10 {
            assert_eq!(q.try_pop(), Some(i));
        }
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn join_then_drain_returns_none_after() {
        let q = BoundedQueue::new();
        q.push(10);
        q.push(20);
        q.push(30);
        q.join();
        assert_eq!(q.wait_and_pop(), Some(10));
        assert_eq!(q.wait_and_pop(), Some(20));
        assert_eq!(q.wait_and_pop(), Some(30));
        assert_eq!(q.wait_and_pop(), None);
        assert_eq!(q.wait_and_pop(), None);
    }

    #[test]
    fn join_releases_blocked_waiters() {
        let q = Arc::new(BoundedQueue::<i32>::new());
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.wait_and_pop());
        thread::sleep(Duration::from_millis(50));
        q.join();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn bounded_push_never_exceeds_capacity() {
        let q = Arc::new(BoundedQueue::with_capacity(2));
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                for i in 0..5 {
                    q.push(i);
                }
            })
        };
        let mut samples = Vec::new();
        for _ in 0..5 {
            thread::sleep(Duration::from_millis(10));
            samples.push(q.len());
            q.try_pop();
        }
        producer.join().unwrap();
        while q.try_pop().is_some() {}
        assert!(samples.iter().all(|&n| n <= 2));
    }

    #[test]
    fn blocked_push_wakes_within_one_pop() {
        let q = Arc::new(BoundedQueue::with_capacity(1));
        q.push(1);
        assert!(!q.can_push());
        let q2 = q.clone();
        let handle = thread::spawn(move || {
            q2.push(2);
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.try_pop(), Some(1));
        handle.join().unwrap();
        assert_eq!(q.try_pop(), Some(2));
    }
}
