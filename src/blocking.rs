//! An unbounded MPMC queue with fine-grained locking and blocking pops.
//!
//! See the documentation for the [`Queue`] type for details.
use crate::loom::sync::{Condvar, Mutex, MutexGuard};
use core::{fmt, ptr::NonNull};

/// An unbounded multi-producer, multi-consumer FIFO queue with *two* locks,
/// one per end, and a condition variable for blocking pops.
///
/// The queue is a singly-linked chain of nodes ending in a dummy: `tail`
/// always points at the dummy, and `head` at the oldest node (they are equal
/// exactly when the queue is empty). Keeping a dummy at the tail is what
/// makes the two-lock split sound: a push only ever touches the tail node
/// and a pop only the head node, and the two are distinct whenever there is
/// anything to pop, so a producer and a consumer can run fully in parallel
/// under different locks.
///
/// A pop does need one brief glance at the other end (comparing `head`
/// against `tail` to detect emptiness), which nests the tail lock inside the
/// head lock. That nesting is always in the same order (head, then tail), so
/// the two locks cannot deadlock.
///
/// Unlike this crate's lock-free queues, consumers may *block*:
/// [`wait_and_pop`](Self::wait_and_pop) parks the calling thread on a
/// condition variable until an element arrives. There are no timeouts and no
/// cancellation; a consumer that must be stopped is typically told so by
/// enqueueing a sentinel value it recognizes.
pub struct Queue<T> {
    /// The oldest node in the chain; equal to `tail` when empty.
    ///
    /// The head lock also guards the `value` and `next` fields of every
    /// non-dummy node: only the holder of the head lock ever touches them
    /// after the push that committed them.
    head: Mutex<NonNull<Node<T>>>,

    /// The dummy node awaiting the next push.
    tail: Mutex<NonNull<Node<T>>>,

    /// Signalled once per push; consumers in `wait_and_pop` sleep here.
    not_empty: Condvar,
}

struct Node<T> {
    value: Option<T>,
    next: *mut Node<T>,
}

impl<T> Node<T> {
    fn dummy() -> NonNull<Self> {
        let node = Box::new(Self {
            value: None,
            next: core::ptr::null_mut(),
        });
        // Safety: `Box::into_raw` never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(node)) }
    }
}

// === impl Queue ===

impl<T> Queue<T> {
    /// Returns a new, empty `Queue`.
    #[must_use]
    pub fn new() -> Self {
        let dummy = Node::dummy();
        Self {
            head: Mutex::new(dummy),
            tail: Mutex::new(dummy),
            not_empty: Condvar::new(),
        }
    }

    /// Pushes `value` onto the end of the queue, waking one blocked
    /// consumer.
    ///
    /// The node allocation happens before the lock is taken, so the tail
    /// lock is held only for two pointer stores and a payload move.
    pub fn push(&self, value: T) {
        let dummy = Node::dummy();
        {
            let mut tail = self.tail.lock().expect("tail mutex poisoned");
            // Safety: the tail lock grants exclusive access to the dummy
            // node; consumers stop at `head == tail` and never touch it.
            unsafe {
                let tail_node = tail.as_mut();
                tail_node.value = Some(value);
                tail_node.next = dummy.as_ptr();
            }
            *tail = dummy;
        }
        self.not_empty.notify_one();
    }

    /// Pops the oldest value in the queue, or returns `None` if the queue
    /// was observed empty.
    pub fn try_pop(&self) -> Option<T> {
        let mut head = self.head.lock().expect("head mutex poisoned");
        if *head == self.peek_tail() {
            return None;
        }
        Some(self.pop_front(&mut head))
    }

    /// Pops the oldest value in the queue, blocking until one is available.
    ///
    /// Consumers are woken by [`push`](Self::push), one per element. There
    /// is no timeout; see the type-level docs for how to stop a blocked
    /// consumer.
    pub fn wait_and_pop(&self) -> T {
        let mut head = self.head.lock().expect("head mutex poisoned");
        while *head == self.peek_tail() {
            head = self
                .not_empty
                .wait(head)
                .expect("head mutex poisoned while waiting");
        }
        self.pop_front(&mut head)
    }

    /// Returns `true` if the queue was observed empty.
    ///
    /// Under concurrency this is only a hint: another thread may push or pop
    /// before the caller acts on the answer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let head = self.head.lock().expect("head mutex poisoned");
        *head == self.peek_tail()
    }

    /// Briefly takes the tail lock to copy the current dummy's address.
    ///
    /// Callers already holding the head lock rely on the fixed head→tail
    /// lock order; nothing ever takes them in reverse.
    fn peek_tail(&self) -> NonNull<Node<T>> {
        *self.tail.lock().expect("tail mutex poisoned")
    }

    /// Detaches and returns the front value.
    ///
    /// The caller must hold the head lock and have verified that the queue
    /// is non-empty (`*head != tail`).
    fn pop_front(&self, head: &mut MutexGuard<'_, NonNull<Node<T>>>) -> T {
        // Safety: the head lock grants exclusive access to the front node,
        // and the emptiness check proves it is not the dummy, so the
        // producer is done with it.
        let mut node = unsafe { Box::from_raw(head.as_ptr()) };
        // Safety: a non-dummy node's `next` was set by the push that
        // committed it.
        **head = unsafe { NonNull::new_unchecked(node.next) };
        match node.value.take() {
            Some(value) => value,
            None => unreachable!("a node in front of the dummy always has a payload"),
        }
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // Walk the chain from head through the dummy, dropping nodes and any
        // undelivered payloads.
        let mut node = self
            .head
            .lock()
            .map(|head| head.as_ptr())
            .unwrap_or_else(|poison| poison.into_inner().as_ptr());
        while !node.is_null() {
            // Safety: `&mut self` means no other thread holds a lock or a
            // reference into the chain.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("blocking::Queue")
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// # Safety
///
/// The queue owns its values, and the raw node pointers are only ever
/// dereferenced under the appropriate lock.
unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}
