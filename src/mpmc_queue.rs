//! A bounded, lock-free multi-producer, multi-consumer (MPMC) FIFO queue.
//!
//! See the documentation for the [`MpmcQueue`] type for details.
use crate::{
    loom::{
        cell::UnsafeCell,
        sync::atomic::{AtomicUsize, Ordering::*},
    },
    util::CachePadded,
};
use alloc::{boxed::Box, vec::Vec};
use core::fmt;

/// A bounded, lock-free multi-producer, multi-consumer (MPMC) FIFO queue
/// over a fixed ring of slots.
///
/// The ring's capacity is rounded up to a power of two, and the producer and
/// consumer cursors (`head` and `tail` respectively) are plain monotonically
/// increasing counters; a cursor masked by `capacity - 1` names a slot, and
/// a cursor divided by the capacity names a *lap* around the ring.
///
/// Each slot carries a **generation** counter that encodes, in one number,
/// both the slot's lap and which role it expects next:
///
/// - `generation == cursor`: the slot is empty and waiting for the producer
///   whose (unmasked) index is `cursor`,
/// - `generation == cursor + 1`: the slot is full and waiting for the
///   consumer whose index is `cursor`,
/// - anything else: some other thread has claimed the slot and is still
///   mid-commit, or the slot still belongs to a previous lap.
///
/// A producer claims its cursor with a compare-and-swap, writes the payload,
/// and release-stores `generation = cursor + 1` as the commit signal; a
/// consumer claims symmetrically, moves the payload out, and release-stores
/// `generation = cursor + capacity`, handing the slot to the producer one
/// full lap ahead. Wrap-around is safe because a cursor must travel a whole
/// lap before it can meet a given slot again, and by then the slot's
/// generation has advanced with it.
///
/// Neither operation ever blocks or waits for room:
/// [`try_push`](Self::try_push) reports fullness by handing the value back
/// in a [`Full`] error, and [`try_pop`](Self::try_pop) reports emptiness as
/// `None`. Callers that want blocking semantics can spin-retry, ideally with
/// a backoff.
///
/// # Examples
///
/// ```
/// use hypha::MpmcQueue;
///
/// let q = MpmcQueue::new(2);
///
/// assert!(q.try_push(1).is_ok());
/// assert!(q.try_push(2).is_ok());
///
/// // The ring is full; the rejected value comes back in the error.
/// let err = q.try_push(3).unwrap_err();
/// assert_eq!(err.into_inner(), 3);
///
/// assert_eq!(q.try_pop(), Some(1));
/// assert!(q.try_push(3).is_ok());
/// assert_eq!(q.try_pop(), Some(2));
/// assert_eq!(q.try_pop(), Some(3));
/// assert_eq!(q.try_pop(), None);
/// ```
pub struct MpmcQueue<T> {
    slots: Box<[Slot<T>]>,

    /// The producers' cursor.
    head: CachePadded<AtomicUsize>,

    /// The consumers' cursor.
    tail: CachePadded<AtomicUsize>,

    mask: usize,
}

/// Error returned by [`MpmcQueue::try_push`] when the ring is full, handing
/// the rejected element back to the caller.
#[derive(PartialEq, Eq)]
pub struct Full<T>(T);

struct Slot<T> {
    generation: AtomicUsize,
    value: UnsafeCell<Option<T>>,
}

// === impl MpmcQueue ===

impl<T> MpmcQueue<T> {
    /// Returns a new `MpmcQueue` with space for `capacity` elements, rounded
    /// up to the next power of two.
    ///
    /// # Panics
    ///
    /// If `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "a zero-capacity queue cannot hold anything");
        let capacity = capacity.next_power_of_two();
        let slots: Vec<Slot<T>> = (0..capacity)
            .map(|i| Slot {
                // Slot `i` initially awaits the producer with cursor `i`.
                generation: AtomicUsize::new(i),
                value: UnsafeCell::new(None),
            })
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            mask: capacity - 1,
        }
    }

    /// Returns the number of elements the ring can hold, which may be larger
    /// than the capacity requested in [`new`](Self::new) due to rounding.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Attempts to push `value` onto the end of the queue.
    ///
    /// If the ring is full, the value is handed back in [`Full`]; it is the
    /// caller's decision whether to spin, drop the element, or back off.
    /// A `try_push` that returns `Ok` has published the element: it will be
    /// observed by exactly one future pop.
    pub fn try_push(&self, value: T) -> Result<(), Full<T>> {
        loop {
            let head = self.head.load(Relaxed);
            let tail = self.tail.load(Acquire);
            if head.wrapping_sub(tail) >= self.capacity() {
                // A full lap ahead of the consumers; every slot holds an
                // unpopped element.
                return Err(Full(value));
            }

            let slot = &self.slots[head & self.mask];
            if slot.generation.load(Acquire) != head {
                // Another producer claimed this cursor and has not committed
                // yet, or the slot still awaits a consumer from the previous
                // lap.
                crate::loom::hint::spin_loop();
                continue;
            }

            if self
                .head
                .compare_exchange_weak(head, head.wrapping_add(1), Relaxed, Relaxed)
                .is_ok()
            {
                test_trace!(head, "MpmcQueue::try_push -> claimed");
                // Safety: winning the cursor CAS while the generation
                // matched gives us sole access to the slot until we bump the
                // generation below.
                slot.value.with_mut(|slot_value| unsafe {
                    *slot_value = Some(value);
                });
                // Commit: consumers watching for `head + 1` may now take the
                // slot; release publishes the payload write above.
                slot.generation.store(head.wrapping_add(1), Release);
                return Ok(());
            }
        }
    }

    /// Pops the oldest value in the queue, or returns `None` if the queue
    /// was observed empty.
    pub fn try_pop(&self) -> Option<T> {
        loop {
            let tail = self.tail.load(Relaxed);
            let head = self.head.load(Acquire);
            if tail == head {
                return None;
            }

            let slot = &self.slots[tail & self.mask];
            if slot.generation.load(Acquire) != tail.wrapping_add(1) {
                // The producer that claimed this slot has not committed its
                // payload yet; it will, shortly.
                crate::loom::hint::spin_loop();
                continue;
            }

            if self
                .tail
                .compare_exchange_weak(tail, tail.wrapping_add(1), Relaxed, Relaxed)
                .is_ok()
            {
                test_trace!(tail, "MpmcQueue::try_pop -> claimed");
                // Safety: winning the cursor CAS while the generation
                // matched gives us sole access to the slot until we bump the
                // generation below.
                let value = slot.value.with_mut(|slot_value| unsafe {
                    (*slot_value).take()
                });
                debug_assert!(value.is_some(), "a committed slot must hold a payload");
                // Hand the slot to the producer one lap ahead; release
                // publishes the `take` above so the payload slot can be
                // safely rewritten.
                slot.generation
                    .store(tail.wrapping_add(self.capacity()), Release);
                return value;
            }
        }
    }

    /// Returns `true` if the queue was observed empty.
    ///
    /// Under concurrency this is only a hint: the queue may gain or lose
    /// elements before the caller acts on the answer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tail.load(Acquire) == self.head.load(Acquire)
    }
}

impl<T> fmt::Debug for MpmcQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            slots: _,
            head,
            tail,
            mask,
        } = self;
        f.debug_struct("MpmcQueue")
            .field("capacity", &(mask + 1))
            .field("head", &head.load(Relaxed))
            .field("tail", &tail.load(Relaxed))
            .finish()
    }
}

/// # Safety
///
/// The queue owns its values; sending or sharing it sends the `T`s inside.
/// A value pushed on one thread may be popped, and dropped, on another.
unsafe impl<T: Send> Send for MpmcQueue<T> {}
unsafe impl<T: Send> Sync for MpmcQueue<T> {}

// === impl Full ===

impl<T> Full<T> {
    /// Returns the element that could not be pushed.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Deliberately not printing the element: `T` may not be `Debug`.
        f.write_str("Full(..)")
    }
}

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue is full")
    }
}

feature! {
    #![feature = "std"]
    impl<T> std::error::Error for Full<T> {}
}
