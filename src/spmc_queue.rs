//! A lock-free single-producer, multi-consumer (SPMC) FIFO queue.
//!
//! See the documentation for the [`SpmcQueue`] type for details.
use crate::{
    counted::{AtomicCountedPtr, CountedPtr},
    loom::{
        cell::UnsafeCell,
        sync::atomic::{AtomicBool, AtomicI32, Ordering::*},
    },
    util::{lock_flag, try_lock_flag, CachePadded},
};
use alloc::boxed::Box;
use core::fmt;

/// An unbounded, lock-free single-producer, multi-consumer (SPMC) FIFO
/// queue.
///
/// Like the [SPSC queue](crate::spsc_queue), this is a linked list whose
/// `tail` always points at a sentinel node owned by the producer, so the
/// producer side is entirely uncontended. The consumers are where it gets
/// interesting: many threads race to detach the head node, and the loser of
/// a race may still be holding a pointer to a node the winner wants to free.
///
/// Instead of hazard pointers, this queue keeps nodes alive with [counted
/// references](crate::mpsc_queue#counted-references): `head` is an
/// `(external_count, node)` pair
/// read and bumped as a single atomic unit, so a consumer has *already*
/// announced itself in the count by the time it dereferences the node, and
/// the pair as a whole never repeats (defeating ABA). Each consumer's bump
/// is eventually paid back against the node's internal counter (folded in
/// bulk by the winner, or subtracted one by one by the losers), and the node
/// is freed exactly when the counts cancel.
///
/// The single-producer contract is enforced at runtime by the exclusive
/// [`Producer`] handle; consumers need no handle, any number of threads may
/// call [`try_pop`](Self::try_pop) directly.
pub struct SpmcQueue<T> {
    /// The consumers' end: a counted reference raced on by every `try_pop`.
    head: CachePadded<AtomicCountedPtr<Node<T>>>,

    /// The producer's end. Consumers only ever compare against its node
    /// address; they never bump its count, so the producer may replace it
    /// with a plain store.
    tail: CachePadded<AtomicCountedPtr<Node<T>>>,

    /// Does a producer handle exist?
    has_producer: AtomicBool,
}

/// The exclusive right to push into an [`SpmcQueue`].
///
/// Returned by [`SpmcQueue::producer`]; dropping it lets another thread
/// become the producer.
pub struct Producer<'q, T> {
    q: &'q SpmcQueue<T>,
}

struct Node<T> {
    value: UnsafeCell<Option<T>>,

    /// Net count of observers that are finished with this node. Failed
    /// observers subtract one each; the detaching winner folds in the
    /// external count (less the two accounted-for references). Transiently
    /// negative while observers are still in flight; the node is destroyed
    /// when it settles at zero.
    internal: AtomicI32,

    /// Counted reference to the successor; installed into `head` when this
    /// node is detached.
    next: AtomicCountedPtr<Node<T>>,
}

impl<T> Node<T> {
    /// Allocates a fresh sentinel with no payload and no successor.
    fn sentinel() -> *mut Self {
        Box::into_raw(Box::new(Self {
            value: UnsafeCell::new(None),
            internal: AtomicI32::new(0),
            next: AtomicCountedPtr::new(CountedPtr::new(0, core::ptr::null_mut())),
        }))
    }
}

// === impl SpmcQueue ===

impl<T> SpmcQueue<T> {
    /// Returns a new, empty `SpmcQueue`.
    #[must_use]
    pub fn new() -> Self {
        let node = Node::sentinel();
        Self {
            // The head's count of one is the bias carried by every installed
            // pair; the tail pair is never bumped, so it carries none.
            head: CachePadded::new(AtomicCountedPtr::new(CountedPtr::new(1, node))),
            tail: CachePadded::new(AtomicCountedPtr::new(CountedPtr::new(0, node))),
            has_producer: AtomicBool::new(false),
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

    /// Pushes `value` without checking producer exclusivity.
    ///
    /// # Safety
    ///
    /// This is a *single-producer* queue: no other thread may call
    /// `push_unchecked` (or hold a [`Producer`]) concurrently.
    pub unsafe fn push_unchecked(&self, value: T) {
        let new_pair = CountedPtr::new(1, Node::sentinel());
        let tail = self.tail.load(Acquire);
        test_trace!(tail = ?tail.ptr(), "SpmcQueue::push");
        // Safety: consumers never touch a node while it is still the tail
        // (they bail out at `node == tail`), and we are the only producer.
        unsafe {
            (*tail.ptr()).value.with_mut(|slot| *slot = Some(value));
            // Publishing the successor commits the payload: a consumer that
            // observes `tail` advanced past this node also observes both
            // stores.
            (*tail.ptr()).next.store(new_pair, Release);
        }
        self.tail.store(new_pair, Release);
    }

    /// Pops the oldest value in the queue, or returns `None` if the queue
    /// was observed empty.
    ///
    /// Any number of threads may call this concurrently. The operation is
    /// lock-free: a consumer may lose the detach race arbitrarily often, but
    /// only because some other consumer keeps winning.
    pub fn try_pop(&self) -> Option<T> {
        let mut observed = self.head.load(Relaxed);
        loop {
            // Announce ourselves in the pair's count *before* dereferencing
            // the node; from here until the matching `ref_release` or
            // `free_external`, the node cannot be freed.
            self.head.increase_external(&mut observed);
            let node = observed.ptr();

            if node == self.tail.load(Acquire).ptr() {
                test_trace!(?node, "SpmcQueue::try_pop -> empty");
                // Safety: we bumped the pair above and are paying the bump
                // back without having advanced the queue.
                unsafe { Self::ref_release(node) };
                return None;
            }

            // Safety: our bump keeps the node alive while we read its
            // successor.
            let next = unsafe { (*node).next.load(Acquire) };
            match self.head.compare_exchange(observed, next, AcqRel, Relaxed) {
                Ok(_) => {
                    test_trace!(?node, "SpmcQueue::try_pop -> detached");
                    // Safety: we detached the node, so its payload is ours.
                    let value = unsafe { (*node).value.with_mut(|slot| (*slot).take()) };
                    debug_assert!(
                        value.is_some(),
                        "a node behind the tail must carry a payload"
                    );
                    // Safety: `observed` was successfully replaced; fold its
                    // final external count into the node.
                    unsafe { Self::free_external(observed) };
                    return value;
                }
                Err(actual) => {
                    // Some other consumer moved the head (or merely bumped
                    // it); undo our bump and try again from their view.
                    unsafe { Self::ref_release(node) };
                    observed = actual;
                }
            }
        }
    }

    /// Returns `true` if the queue was observed empty.
    ///
    /// Under concurrency this is only a hint; it does not join the
    /// counted-reference protocol, so the answer may be stale by the time the
    /// caller acts on it.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Acquire).ptr() == self.tail.load(Acquire).ptr()
    }

    /// Pay back one observer's bump; the last finisher destroys the node.
    ///
    /// # Safety
    ///
    /// The caller must have previously bumped a pair referencing `node`, and
    /// must not touch the node again afterwards.
    unsafe fn ref_release(node: *mut Node<T>) {
        if unsafe { (*node).internal.fetch_sub(1, AcqRel) } == 1 {
            drop(unsafe { Box::from_raw(node) });
        }
    }

    /// Fold a detached pair's external count into its node's internal
    /// counter.
    ///
    /// Two of the external references need no payback: the pair's own bias,
    /// and the calling thread's bump. If the fold settles the counter at
    /// zero, every other observer has already released and the node is
    /// destroyed here.
    ///
    /// # Safety
    ///
    /// `pair` must be the pair that the caller successfully replaced; the
    /// caller must not touch the node afterwards.
    unsafe fn free_external(pair: CountedPtr<Node<T>>) {
        let node = pair.ptr();
        let fold = pair.count() as i32 - 2;
        if unsafe { (*node).internal.fetch_add(fold, AcqRel) } == -fold {
            drop(unsafe { Box::from_raw(node) });
        }
    }
}

impl<T> Drop for SpmcQueue<T> {
    fn drop(&mut self) {
        // `&mut self` proves quiescence: no consumer is mid-pop, so the
        // chain from head to the tail sentinel can be walked and freed
        // directly, dropping any payloads still in it.
        let mut node = self.head.load(Relaxed).ptr();
        while !node.is_null() {
            // Safety: exclusive ownership of the whole chain.
            let next = unsafe { (*node).next.load(Relaxed).ptr() };
            drop(unsafe { Box::from_raw(node) });
            node = next;
        }
    }
}

impl<T> fmt::Debug for SpmcQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            head,
            tail,
            has_producer,
        } = self;
        f.debug_struct("SpmcQueue")
            .field("head", &**head)
            .field("tail", &**tail)
            .field("has_producer", &has_producer.load(Acquire))
            .finish()
    }
}

impl<T> Default for SpmcQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// # Safety
///
/// The queue owns its values; sending or sharing it sends the `T`s inside.
/// A value pushed on one thread may be popped, and dropped, on another.
unsafe impl<T: Send> Send for SpmcQueue<T> {}
unsafe impl<T: Send> Sync for SpmcQueue<T> {}

// === impl Producer ===

impl<T> Producer<'_, T> {
    /// Pushes `value` onto the end of the queue.
    ///
    /// This never waits and never fails; the queue is unbounded, and the
    /// producer has no one to contend with.
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
