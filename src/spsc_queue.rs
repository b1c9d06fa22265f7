//! A lock-free single-producer, single-consumer (SPSC) FIFO queue.
//!
//! See the documentation for the [`SpscQueue`] type for details.
use crate::{
    loom::{
        cell::UnsafeCell,
        sync::atomic::{AtomicBool, AtomicPtr, Ordering::*},
    },
    util::{lock_flag, try_lock_flag, CachePadded},
};
use alloc::boxed::Box;
use core::fmt;

/// An unbounded, lock-free single-producer, single-consumer (SPSC) FIFO
/// queue.
///
/// With exactly one thread pushing and one thread popping, no
/// compare-and-swap operations are needed at all: the queue is a linked list
/// of nodes where `tail` always points at a *dummy* node owned by the
/// producer. A push stores the payload into the current dummy, links a fresh
/// dummy behind it, and release-stores the new `tail`; a pop detects
/// emptiness by `head == tail`, takes the payload, advances `head`, and frees
/// the old node immediately: with a single consumer, nobody else can still
/// be using it, so no reclamation protocol is required.
///
/// The acquire/release pair on `tail` is what makes a payload written by the
/// producer visible to the consumer; the pair on `head` does the same for
/// node reuse in the other direction.
///
/// # Producer and consumer handles
///
/// The single-producer/single-consumer contract is enforced at runtime:
/// [`producer`](Self::producer) and [`consumer`](Self::consumer) hand out
/// exclusive [`Producer`] and [`Consumer`] handles, and at most one of each
/// exists at a time. Code that can guarantee the cardinality by construction
/// can skip the handles with the unsafe
/// [`push_unchecked`](Self::push_unchecked) and
/// [`try_pop_unchecked`](Self::try_pop_unchecked) escape hatches.
///
/// # Examples
///
/// ```
/// use hypha::SpscQueue;
/// use std::{sync::Arc, thread};
///
/// let q = Arc::new(SpscQueue::new());
///
/// thread::spawn({
///     let q = q.clone();
///     move || {
///         let producer = q.producer();
///         for i in 0..4 {
///             producer.push(i);
///         }
///     }
/// });
///
/// let consumer = q.consumer();
/// let mut seen = Vec::new();
/// while seen.len() < 4 {
///     match consumer.try_pop() {
///         Some(value) => seen.push(value),
///         None => thread::yield_now(),
///     }
/// }
///
/// // A single producer's pushes are popped in order.
/// assert_eq!(seen, vec![0, 1, 2, 3]);
/// ```
pub struct SpscQueue<T> {
    /// The consumer end. Read and written by the consumer; read by the
    /// producer only through [`SpscQueue::is_empty`].
    head: CachePadded<AtomicPtr<Node<T>>>,

    /// The producer end; always points at the current dummy node.
    tail: CachePadded<AtomicPtr<Node<T>>>,

    /// Does a producer handle exist?
    has_producer: AtomicBool,

    /// Does a consumer handle exist?
    has_consumer: AtomicBool,
}

/// The exclusive right to push into an [`SpscQueue`].
///
/// Returned by [`SpscQueue::producer`]; dropping it lets another thread
/// become the producer.
pub struct Producer<'q, T> {
    q: &'q SpscQueue<T>,
}

/// The exclusive right to pop from an [`SpscQueue`].
///
/// Returned by [`SpscQueue::consumer`]; dropping it lets another thread
/// become the consumer.
pub struct Consumer<'q, T> {
    q: &'q SpscQueue<T>,
}

struct Node<T> {
    /// The next node, once this one is no longer the dummy. Written by the
    /// producer before the `tail` release-store that publishes it.
    next: UnsafeCell<*mut Node<T>>,

    value: UnsafeCell<Option<T>>,
}

impl<T> Node<T> {
    fn dummy() -> *mut Self {
        Box::into_raw(Box::new(Self {
            next: UnsafeCell::new(core::ptr::null_mut()),
            value: UnsafeCell::new(None),
        }))
    }
}

// === impl SpscQueue ===

impl<T> SpscQueue<T> {
    /// Returns a new, empty `SpscQueue`.
    #[must_use]
    pub fn new() -> Self {
        let dummy = Node::dummy();
        Self {
            head: CachePadded::new(AtomicPtr::new(dummy)),
            tail: CachePadded::new(AtomicPtr::new(dummy)),
            has_producer: AtomicBool::new(false),
            has_consumer: AtomicBool::new(false),
        }
    }

    /// Returns the exclusive [`Producer`] handle, spinning until any current
    /// producer releases it.
    pub fn producer(&self) -> Producer<'_, T> {
        lock_flag(&self.has_producer);
        Producer { q: self }
    }

    /// Returns the exclusive [`Producer`] handle, or `None` if another
    /// producer currently exists.
    pub fn try_producer(&self) -> Option<Producer<'_, T>> {
        try_lock_flag(&self.has_producer)?;
        Some(Producer { q: self })
    }

    /// Returns the exclusive [`Consumer`] handle, spinning until any current
    /// consumer releases it.
    pub fn consumer(&self) -> Consumer<'_, T> {
        lock_flag(&self.has_consumer);
        Consumer { q: self }
    }

    /// Returns the exclusive [`Consumer`] handle, or `None` if another
    /// consumer currently exists.
    pub fn try_consumer(&self) -> Option<Consumer<'_, T>> {
        try_lock_flag(&self.has_consumer)?;
        Some(Consumer { q: self })
    }

    /// Pushes `value` without checking producer exclusivity.
    ///
    /// # Safety
    ///
    /// This is a *single-producer* queue: no other thread may call
    /// `push_unchecked` (or hold a [`Producer`]) concurrently.
    pub unsafe fn push_unchecked(&self, value: T) {
        let dummy = Node::dummy();
        let tail = self.tail.load(Acquire);
        test_trace!(?tail, ?dummy, "SpscQueue::push");
        // Safety: `tail` is the dummy node, which the consumer never touches
        // (it stops at `head == tail`), and we are the only producer.
        unsafe {
            (*tail).value.with_mut(|value_slot| *value_slot = Some(value));
            (*tail).next.with_mut(|next| *next = dummy);
        }
        // Publish: the consumer's acquire-load of `tail` makes the payload
        // and link writes above visible.
        self.tail.store(dummy, Release);
    }

    /// Pops the oldest value without checking consumer exclusivity.
    ///
    /// # Safety
    ///
    /// This is a *single-consumer* queue: no other thread may call
    /// `try_pop_unchecked` (or hold a [`Consumer`]) concurrently.
    pub unsafe fn try_pop_unchecked(&self) -> Option<T> {
        let head = self.head.load(Acquire);
        if head == self.tail.load(Acquire) {
            return None;
        }
        test_trace!(?head, "SpscQueue::try_pop");
        // Safety: `head != tail` means the head node was committed by a push,
        // and only this consumer detaches nodes.
        let (value, next) = unsafe {
            (
                (*head).value.with_mut(|value| (*value).take()),
                (*head).next.with(|next| *next),
            )
        };
        debug_assert!(value.is_some(), "a committed node must carry a payload");
        self.head.store(next, Release);
        // Safety: the node is detached and this is the only consumer; with no
        // other thread able to reference it, it can be freed immediately.
        drop(unsafe { Box::from_raw(head) });
        value
    }

    /// Returns `true` if the queue was observed empty.
    ///
    /// This is authoritative only on the consumer thread; anywhere else it is
    /// a hint that may be stale by the time the caller acts on it.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Acquire) == self.tail.load(Acquire)
    }
}

impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        // Safety: `&mut self` proves no handles are outstanding.
        unsafe { while self.try_pop_unchecked().is_some() {} }

        // All that remains is the final dummy node.
        let dummy = self.head.load(Relaxed);
        debug_assert_eq!(dummy, self.tail.load(Relaxed));
        // Safety: exclusive ownership; the dummy is the last node.
        drop(unsafe { Box::from_raw(dummy) });
    }
}

impl<T> fmt::Debug for SpscQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            head,
            tail,
            has_producer,
            has_consumer,
        } = self;
        f.debug_struct("SpscQueue")
            .field("head", &head.load(Acquire))
            .field("tail", &tail.load(Acquire))
            .field("has_producer", &has_producer.load(Acquire))
            .field("has_consumer", &has_consumer.load(Acquire))
            .finish()
    }
}

impl<T> Default for SpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// # Safety
///
/// The queue owns its values; sending or sharing it sends the `T`s inside.
unsafe impl<T: Send> Send for SpscQueue<T> {}
unsafe impl<T: Send> Sync for SpscQueue<T> {}

// === impl Producer ===

impl<T> Producer<'_, T> {
    /// Pushes `value` onto the end of the queue.
    ///
    /// This never waits and never fails; the queue is unbounded.
    #[inline]
    pub fn push(&self, value: T) {
        debug_assert!(self.q.has_producer.load(Acquire));
        // Safety: holding the handle is proof of producer exclusivity.
        unsafe { self.q.push_unchecked(value) }
    }

    /// Returns `true` if the queue was observed empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }
}

impl<T> Drop for Producer<'_, T> {
    fn drop(&mut self) {
        self.q.has_producer.store(false, Release);
    }
}

impl<T> fmt::Debug for Producer<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer").field("q", &self.q).finish()
    }
}

// === impl Consumer ===

impl<T> Consumer<'_, T> {
    /// Pops the oldest value in the queue, or returns `None` if the queue was
    /// observed empty.
    #[inline]
    pub fn try_pop(&self) -> Option<T> {
        debug_assert!(self.q.has_consumer.load(Acquire));
        // Safety: holding the handle is proof of consumer exclusivity.
        unsafe { self.q.try_pop_unchecked() }
    }

    /// Returns `true` if the queue was observed empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }
}

impl<T> Drop for Consumer<'_, T> {
    fn drop(&mut self) {
        self.q.has_consumer.store(false, Release);
    }
}

impl<T> fmt::Debug for Consumer<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").field("q", &self.q).finish()
    }
}

impl<T> Iterator for Consumer<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.try_pop()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn empty_at_birth() {
        let q = SpscQueue::<i32>::new();
        assert!(q.is_empty());
        assert_eq!(q.consumer().try_pop(), None);
    }

    #[test]
    fn fifo_order() {
        let q = SpscQueue::new();
        let producer = q.producer();
        let consumer = q.consumer();
        for i in 1..=3 {
            producer.push(i);
        }
        assert_eq!(consumer.try_pop(), Some(1));
        assert_eq!(consumer.try_pop(), Some(2));
        assert_eq!(consumer.try_pop(), Some(3));
        assert_eq!(consumer.try_pop(), None);
    }

    #[test]
    fn handles_are_exclusive() {
        let q = SpscQueue::<i32>::new();
        let producer = q.try_producer().expect("no producer exists yet");
        assert!(q.try_producer().is_none());
        drop(producer);
        assert!(q.try_producer().is_some(), "handle released on drop");

        let consumer = q.try_consumer().expect("no consumer exists yet");
        assert!(q.try_consumer().is_none());
        drop(consumer);
        assert!(q.try_consumer().is_some());
    }

    #[test]
    fn drop_drains_values() {
        use std::sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        };
        struct CountDrop(Arc<AtomicUsize>);
        impl Drop for CountDrop {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let q = SpscQueue::new();
        let producer = q.producer();
        for _ in 0..4 {
            producer.push(CountDrop(drops.clone()));
        }
        drop(producer);
        drop(q);
        assert_eq!(drops.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn queue_is_send_sync() {
        crate::util::assert_send_sync::<SpscQueue<i32>>();
    }
}
