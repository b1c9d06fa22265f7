//! A lock-free multi-producer, single-consumer (MPSC) FIFO queue.
//!
//! See the documentation for the [`MpscQueue`] type for details.
//!
//! ## Counted references
//!
//! Both ends of this queue are *counted references*: `(external_count,
//! node)` pairs read, bumped, and replaced as single atomic units (see
//! [`SpmcQueue`](crate::spmc_queue::SpmcQueue) for the single-ended
//! variant). A thread announces itself by bumping the count in the pair
//! before it dereferences the node, and every bump is eventually paid back
//! against the node's own counter word.
//!
//! Because producers contend on the tail *and* the consumer advances the
//! head, a node here is referenced by up to two counted-reference slots at
//! once (the tail and either the head or a predecessor's `next`), each with
//! its own external count. The node therefore tracks, in one packed atomic
//! word, both the net count of finished observers (30 bits) and the number
//! of slots still referencing it (2 bits); it is destroyed exactly when the
//! whole word reaches zero.
use crate::{
    counted::{AtomicCountedPtr, CountedPtr},
    loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering::*},
    util::{lock_flag, try_lock_flag, Backoff, CachePadded},
};
use alloc::boxed::Box;
use core::{fmt, ptr};

/// An unbounded, lock-free multi-producer, single-consumer (MPSC) FIFO
/// queue.
///
/// The tail always points at a sentinel node with an empty payload slot.
/// Concurrent producers serialize on that slot: each reads the tail through
/// a counted reference and tries to compare-and-swap its own payload into
/// the slot. The winner links a fresh sentinel behind the node, swings the
/// tail to it, and folds the old tail pair's count back into the node;
/// losers pay back their bump and retry against the new tail. The payload
/// CAS is the linearization point of a push.
///
/// The consumer side follows the counted-reference pop protocol (bump,
/// compare against the tail for emptiness, detach the head); see the
/// [module docs](self#counted-references) for how the counts keep a node
/// alive until its last observer is done with it.
///
/// # Consumers
///
/// Only one thread may pop at a time. The safe entry points enforce this at
/// runtime: [`try_pop`](Self::try_pop) claims the consumer role for a single
/// call (and reports [`TryPopError::Busy`] if another thread holds it), and
/// [`consumer`](Self::consumer) reserves it for as long as the returned
/// [`Consumer`] handle lives. Code that guarantees a single consumer by
/// construction can use the unsafe
/// [`try_pop_unchecked`](Self::try_pop_unchecked) escape hatch.
///
/// # Examples
///
/// ```
/// use hypha::MpscQueue;
/// use std::{sync::Arc, thread};
///
/// let q = Arc::new(MpscQueue::new());
///
/// for t in 0..2 {
///     let q = q.clone();
///     thread::spawn(move || {
///         for i in 0..2 {
///             q.push((t, i));
///         }
///     });
/// }
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
/// seen.sort();
/// assert_eq!(seen, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
/// ```
pub struct MpscQueue<T> {
    /// The consumer's end; bumped only by the consumer.
    head: CachePadded<AtomicCountedPtr<Node<T>>>,

    /// The producers' end; bumped by every producer reading the tail.
    tail: CachePadded<AtomicCountedPtr<Node<T>>>,

    /// Does a consumer currently exist? If not, it is safe to pop.
    has_consumer: CachePadded<AtomicBool>,
}

/// A handle that holds the exclusive right to pop from an [`MpscQueue`].
///
/// Returned by [`MpscQueue::consumer`] and [`MpscQueue::try_consumer`];
/// useful when one thread pops many elements and does not want to re-claim
/// the consumer role on every call.
pub struct Consumer<'q, T> {
    q: &'q MpscQueue<T>,
}

/// Errors returned by [`MpscQueue::try_pop`].
#[derive(Debug, Eq, PartialEq)]
pub enum TryPopError {
    /// No element was popped because the queue was observed empty.
    Empty,

    /// Another thread currently holds the consumer role, either inside a
    /// [`try_pop`](MpscQueue::try_pop) call or through a [`Consumer`]
    /// handle.
    ///
    /// This is a multi-producer, *single-consumer* queue; only one thread
    /// may pop at a time.
    Busy,
}

mycelium_bitfield::bitfield! {
    /// A node's reference counts, packed into one atomic word so that both
    /// can be updated together without a wider compare-and-swap.
    #[derive(PartialEq, Eq)]
    struct Refs<u32> {
        /// How many counted-reference slots (the tail, and either the head
        /// or a predecessor's `next`) still reference this node.
        const EXT_HANDLES = 2;

        /// Net count of observers that are finished with the node.
        /// Transiently "negative" (wrapping) while observers are in flight;
        /// multiples of the field's first bit never disturb `EXT_HANDLES`.
        const INTERNAL = 30;
    }
}

/// One observer's worth of `INTERNAL`.
const INT_ONE: u32 = Refs::INTERNAL.first_bit();

/// One slot's worth of `EXT_HANDLES`.
const EXT_ONE: u32 = Refs::EXT_HANDLES.first_bit();

struct Node<T> {
    /// The payload slot. Null while this node is the sentinel; producers'
    /// compare-and-swaps on this slot are what serialize concurrent pushes.
    value: AtomicPtr<T>,

    /// A packed [`Refs`] word.
    counts: AtomicU32,

    /// Counted reference to the successor; installed into `head` when this
    /// node is detached.
    next: AtomicCountedPtr<Node<T>>,
}

impl<T> Node<T> {
    /// Allocates a fresh sentinel.
    ///
    /// Every node starts with two handle references: it is about to be
    /// linked as its predecessor's `next` *and* stored in `tail` (for the
    /// very first node, referenced by `head` and `tail`).
    fn sentinel() -> *mut Self {
        Box::into_raw(Box::new(Self {
            value: AtomicPtr::new(ptr::null_mut()),
            counts: AtomicU32::new(Refs::new().with(Refs::EXT_HANDLES, 2).0),
            next: AtomicCountedPtr::new(CountedPtr::new(0, ptr::null_mut())),
        }))
    }
}

impl<T> Drop for Node<T> {
    fn drop(&mut self) {
        // A node destroyed with a payload still in its slot (tear-down of a
        // non-empty queue) owns that payload.
        let value = self.value.load(Relaxed);
        if !value.is_null() {
            // Safety: the slot's pointer was created by `Box::into_raw` in
            // `push`, and popping nulls the slot, so it is still owned here.
            drop(unsafe { Box::from_raw(value) });
        }
    }
}

// === impl MpscQueue ===

impl<T> MpscQueue<T> {
    /// Returns a new, empty `MpscQueue`.
    #[must_use]
    pub fn new() -> Self {
        let node = Node::sentinel();
        Self {
            head: CachePadded::new(AtomicCountedPtr::new(CountedPtr::new(1, node))),
            tail: CachePadded::new(AtomicCountedPtr::new(CountedPtr::new(1, node))),
            has_consumer: CachePadded::new(AtomicBool::new(false)),
        }
    }

    /// Pushes `value` onto the end of the queue.
    ///
    /// Any number of threads may push concurrently. The operation is
    /// lock-free: a producer can lose the payload race repeatedly, but each
    /// loss means another producer's push completed.
    pub fn push(&self, value: T) {
        let value = Box::into_raw(Box::new(value));
        let sentinel = CountedPtr::new(1, Node::sentinel());
        let mut tail = self.tail.load(Relaxed);
        loop {
            // Announce ourselves in the tail pair before touching the node.
            self.tail.increase_external(&mut tail);
            let node = tail.ptr();

            // Claiming the empty payload slot is the linearization point.
            // Safety: our bump keeps the node alive.
            let claimed = unsafe {
                (*node)
                    .value
                    .compare_exchange(ptr::null_mut(), value, AcqRel, Relaxed)
                    .is_ok()
            };
            if claimed {
                test_trace!(?node, "MpscQueue::push -> claimed");
                // Safety: only the thread that claimed the payload slot
                // writes this node's `next`, exactly once.
                unsafe { (*node).next.store(sentinel, Release) };
                // Swing the tail. A swap (not a store): contending producers
                // may still be bumping the old pair, and the final count must
                // include every bump that landed.
                let old = self.tail.swap(sentinel, AcqRel);
                debug_assert_eq!(old.ptr(), node, "only the winner moves the tail");
                // Safety: the tail slot no longer references the node.
                unsafe { Self::free_external(old) };
                return;
            }

            // Another producer's payload is in the slot; pay back our bump
            // and retry. The loop spins until the winner swings the tail.
            // Safety: `node` is not touched again after the release.
            unsafe { Self::ref_release(node) };
        }
    }

    /// Pops the oldest value, claiming the consumer role for the duration of
    /// the call.
    ///
    /// # Returns
    ///
    /// - `Ok(value)` if an element was popped
    /// - `Err(`[`TryPopError::Empty`]`)` if the queue was observed empty
    /// - `Err(`[`TryPopError::Busy`]`)` if another thread currently holds
    ///   the consumer role
    pub fn try_pop(&self) -> Result<T, TryPopError> {
        if self
            .has_consumer
            .compare_exchange(false, true, AcqRel, Acquire)
            .is_err()
        {
            return Err(TryPopError::Busy);
        }

        // Safety: the `has_consumer` flag ensures consumer exclusivity.
        let res = unsafe { self.try_pop_unchecked() };

        self.has_consumer.store(false, Release);
        res.ok_or(TryPopError::Empty)
    }

    /// Pops the oldest value, spinning (with exponential backoff) while
    /// another thread holds the consumer role.
    ///
    /// Returns `None` if the queue was observed empty.
    pub fn pop(&self) -> Option<T> {
        let mut boff = Backoff::new();
        loop {
            match self.try_pop() {
                Ok(value) => return Some(value),
                Err(TryPopError::Empty) => return None,
                Err(TryPopError::Busy) => boff.spin(),
            }
        }
    }

    /// Reserves the consumer role until the returned [`Consumer`] handle is
    /// dropped, spinning if another thread currently holds it.
    pub fn consumer(&self) -> Consumer<'_, T> {
        lock_flag(&self.has_consumer);
        Consumer { q: self }
    }

    /// Reserves the consumer role, or returns `None` if another thread
    /// currently holds it.
    pub fn try_consumer(&self) -> Option<Consumer<'_, T>> {
        try_lock_flag(&self.has_consumer)?;
        Some(Consumer { q: self })
    }

    /// Pops the oldest value without checking consumer exclusivity.
    ///
    /// # Safety
    ///
    /// This is a multi-producer, *single-consumer* queue: no other thread
    /// may call `try_pop_unchecked` (or hold a [`Consumer`], or be inside
    /// [`try_pop`](Self::try_pop)) concurrently.
    pub unsafe fn try_pop_unchecked(&self) -> Option<T> {
        let mut observed = self.head.load(Relaxed);
        loop {
            // The bump is uncontended (producers never touch the head), but
            // it still must be part of the pair: the node's accounting only
            // balances if every observer is in some pair's count.
            self.head.increase_external(&mut observed);
            let node = observed.ptr();

            if node == self.tail.load(Acquire).ptr() {
                // Safety: paying back the bump taken above.
                unsafe { Self::ref_release(node) };
                return None;
            }

            // Safety: our bump keeps the node alive.
            let next = unsafe { (*node).next.load(Acquire) };
            match self.head.compare_exchange(observed, next, AcqRel, Relaxed) {
                Ok(_) => {
                    test_trace!(?node, "MpscQueue::try_pop -> detached");
                    // Safety: the node is behind the tail, so a producer
                    // completed the payload CAS; detaching made it ours.
                    let value = unsafe { (*node).value.swap(ptr::null_mut(), AcqRel) };
                    debug_assert!(!value.is_null(), "a node behind the tail has a payload");
                    // Safety: the head slot no longer references the node.
                    unsafe { Self::free_external(observed) };
                    // Safety: the payload was boxed by `push` and the slot
                    // was nulled, so we own it exclusively.
                    return Some(*unsafe { Box::from_raw(value) });
                }
                Err(actual) => {
                    // With a single consumer this only happens on a spurious
                    // failure; handle it the same way regardless.
                    unsafe { Self::ref_release(node) };
                    observed = actual;
                }
            }
        }
    }

    /// Returns `true` if the queue was observed empty.
    ///
    /// Under concurrency this is only a hint; it does not join the
    /// counted-reference protocol, so the answer may be stale by the time
    /// the caller acts on it.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Acquire).ptr() == self.tail.load(Acquire).ptr()
    }

    /// Pay back one observer's bump; the last reference destroys the node.
    ///
    /// # Safety
    ///
    /// The caller must have previously bumped a pair referencing `node`, and
    /// must not touch the node again afterwards.
    unsafe fn ref_release(node: *mut Node<T>) {
        let prior = unsafe { (*node).counts.fetch_sub(INT_ONE, AcqRel) };
        if prior == INT_ONE {
            drop(unsafe { Box::from_raw(node) });
        }
    }

    /// Fold a replaced pair's external count into its node's packed word and
    /// release the slot's handle reference.
    ///
    /// Two of the external count need no payback (the pair's bias and the
    /// caller's own bump). The subtraction of one handle borrows only within
    /// the handle field: `EXT_HANDLES` is nonzero whenever a slot reference
    /// is outstanding, and the fold is a whole multiple of `INTERNAL`'s
    /// first bit.
    ///
    /// # Safety
    ///
    /// `pair` must be a pair the caller successfully replaced (in `head` or
    /// `tail`); the caller must not touch the node afterwards.
    unsafe fn free_external(pair: CountedPtr<Node<T>>) {
        let node = pair.ptr();
        let fold = (pair.count() as u32).wrapping_sub(2).wrapping_mul(INT_ONE);
        let delta = fold.wrapping_sub(EXT_ONE);
        let prior = unsafe { (*node).counts.fetch_add(delta, AcqRel) };
        if prior.wrapping_add(delta) == 0 {
            drop(unsafe { Box::from_raw(node) });
        }
    }
}

impl<T> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        // `&mut self` proves quiescence; walk the chain and free it, payloads
        // included (see `Node::drop`).
        let mut node = self.head.load(Relaxed).ptr();
        while !node.is_null() {
            // Safety: exclusive ownership of the whole chain.
            let next = unsafe { (*node).next.load(Relaxed).ptr() };
            drop(unsafe { Box::from_raw(node) });
            node = next;
        }
    }
}

impl<T> fmt::Debug for MpscQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            head,
            tail,
            has_consumer,
        } = self;
        f.debug_struct("MpscQueue")
            .field("head", &**head)
            .field("tail", &**tail)
            .field("has_consumer", &has_consumer.load(Acquire))
            .finish()
    }
}

impl<T> Default for MpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// # Safety
///
/// The queue owns its values; sending or sharing it sends the `T`s inside.
/// A value pushed on one thread may be popped, and dropped, on another.
unsafe impl<T: Send> Send for MpscQueue<T> {}
unsafe impl<T: Send> Sync for MpscQueue<T> {}

// === impl Consumer ===

impl<T> Consumer<'_, T> {
    /// Pops the oldest value in the queue, or returns `None` if the queue
    /// was observed empty.
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

// === impl TryPopError ===

impl fmt::Display for TryPopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("queue is empty"),
            Self::Busy => f.write_str("another thread is already popping"),
        }
    }
}

feature! {
    #![feature = "std"]
    impl std::error::Error for TryPopError {}
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, vec::Vec};

    #[test]
    fn empty_at_birth() {
        let q = MpscQueue::<i32>::new();
        assert!(q.is_empty());
        assert_eq!(q.try_pop(), Err(TryPopError::Empty));
    }

    #[test]
    fn fifo_order() {
        let q = MpscQueue::new();
        for i in 1..=3 {
            q.push(i);
        }
        assert!(!q.is_empty());
        assert_eq!(q.try_pop(), Ok(1));
        assert_eq!(q.try_pop(), Ok(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn consumer_is_exclusive() {
        let q = MpscQueue::new();
        q.push(1);
        let consumer = q.try_consumer().expect("no consumer exists yet");
        assert!(q.try_consumer().is_none());
        assert_eq!(q.try_pop(), Err(TryPopError::Busy));
        assert_eq!(consumer.try_pop(), Some(1));
        drop(consumer);
        assert_eq!(q.try_pop(), Err(TryPopError::Empty));
    }

    #[test]
    fn concurrent_producers_conserve_values() {
        const PRODUCERS: i32 = 4;
        const PER_PRODUCER: i32 = 1000;

        let q = Arc::new(MpscQueue::new());
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|t| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        q.push(t * PER_PRODUCER + i);
                    }
                })
            })
            .collect();

        let consumer = q.consumer();
        let mut seen = Vec::new();
        while seen.len() < (PRODUCERS * PER_PRODUCER) as usize {
            match consumer.try_pop() {
                Some(value) => seen.push(value),
                None => thread::yield_now(),
            }
        }
        for p in producers {
            p.join().unwrap();
        }

        // Per-producer FIFO: each producer's values arrive in push order.
        for t in 0..PRODUCERS {
            let per: Vec<_> = seen
                .iter()
                .filter(|&&v| v / PER_PRODUCER == t)
                .collect();
            assert!(per.windows(2).all(|w| w[0] < w[1]), "producer {t} reordered");
        }

        seen.sort_unstable();
        let expected: Vec<i32> = (0..PRODUCERS * PER_PRODUCER).collect();
        assert_eq!(seen, expected, "no loss, no duplication, no fabrication");
    }

    #[test]
    fn drop_drains_values() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        struct CountDrop(Arc<AtomicUsize>);
        impl Drop for CountDrop {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let q = MpscQueue::new();
        for _ in 0..4 {
            q.push(CountDrop(drops.clone()));
        }
        drop(q.pop());
        drop(q);
        assert_eq!(drops.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn refs_layout() {
        // The packed word must place the handle field in the low bits, so
        // that internal-count arithmetic (always a multiple of `INT_ONE`)
        // can never disturb it.
        assert_eq!(EXT_ONE, 1);
        assert_eq!(INT_ONE, 4);
        assert_eq!(Refs::new().with(Refs::EXT_HANDLES, 2).0, 2);
        Refs::assert_valid();
    }

    #[test]
    fn queue_is_send_sync() {
        crate::util::assert_send_sync::<MpscQueue<i32>>();
    }
}
