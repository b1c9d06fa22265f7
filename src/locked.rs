//! Coarse single-mutex queue and stack baselines.
//!
//! These hold one lock around an ordinary collection. They are the simplest
//! possible correct implementations of the containers in this crate, useful
//! as references when debugging the lock-free variants and as perfectly
//! reasonable defaults when contention is low.
use crate::loom::sync::{Condvar, Mutex};
use core::fmt;
use std::collections::VecDeque;

/// An unbounded MPMC FIFO queue guarded by a single mutex.
///
/// [`push`](Self::push) notifies a condition variable, so consumers may
/// either poll with [`try_pop`](Self::try_pop) or block in
/// [`wait_and_pop`](Self::wait_and_pop).
pub struct Queue<T> {
    data: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

/// An unbounded LIFO stack guarded by a single mutex.
pub struct Stack<T> {
    data: Mutex<Vec<T>>,
}

// === impl Queue ===

impl<T> Queue<T> {
    /// Returns a new, empty `Queue`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    /// Pushes `value` onto the end of the queue, waking one blocked
    /// consumer.
    pub fn push(&self, value: T) {
        let mut data = self.data.lock().expect("queue mutex poisoned");
        data.push_back(value);
        drop(data);
        self.not_empty.notify_one();
    }

    /// Pops the oldest value in the queue, or returns `None` if the queue
    /// was observed empty.
    pub fn try_pop(&self) -> Option<T> {
        self.data.lock().expect("queue mutex poisoned").pop_front()
    }

    /// Pops the oldest value in the queue, blocking until one is available.
    ///
    /// No timeout, no cancellation; stop a blocked consumer by sending it a
    /// sentinel value it recognizes.
    pub fn wait_and_pop(&self) -> T {
        let mut data = self.data.lock().expect("queue mutex poisoned");
        loop {
            match data.pop_front() {
                Some(value) => return value,
                None => {
                    data = self
                        .not_empty
                        .wait(data)
                        .expect("queue mutex poisoned while waiting");
                }
            }
        }
    }

    /// Returns `true` if the queue was observed empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.lock().expect("queue mutex poisoned").is_empty()
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("locked::Queue")
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// === impl Stack ===

impl<T> Stack<T> {
    /// Returns a new, empty `Stack`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Mutex::new(Vec::new()),
        }
    }

    /// Pushes `value` onto the top of the stack.
    pub fn push(&self, value: T) {
        self.data.lock().expect("stack mutex poisoned").push(value);
    }

    /// Pops the most recently pushed value, or returns `None` if the stack
    /// was observed empty.
    pub fn try_pop(&self) -> Option<T> {
        self.data.lock().expect("stack mutex poisoned").pop()
    }

    /// Returns `true` if the stack was observed empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.lock().expect("stack mutex poisoned").is_empty()
    }
}

impl<T> fmt::Debug for Stack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("locked::Stack")
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, vec::Vec};

    #[test]
    fn queue_basics() {
        let q = Queue::new();
        assert!(q.is_empty());
        assert_eq!(q.try_pop(), None);
        for i in 1..=3 {
            q.push(i);
        }
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.wait_and_pop(), 2);
        assert_eq!(q.try_pop(), Some(3));
        assert!(q.is_empty());
    }

    #[test]
    fn stack_basics() {
        let stack = Stack::new();
        assert!(stack.is_empty());
        stack.push(1);
        stack.push(2);
        stack.push(3);
        assert_eq!(stack.try_pop(), Some(3));
        assert_eq!(stack.try_pop(), Some(2));
        assert_eq!(stack.try_pop(), Some(1));
        assert_eq!(stack.try_pop(), None);
    }

    #[test]
    fn queue_wakes_waiters() {
        let q = Arc::new(Queue::new());
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let q = q.clone();
                thread::spawn(move || q.wait_and_pop())
            })
            .collect();

        q.push(1);
        q.push(2);

        let mut seen: Vec<_> = waiters.into_iter().map(|w| w.join().unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
    }
}
