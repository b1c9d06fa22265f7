//! An unbounded, lock-free LIFO stack.
//!
//! See the documentation for the [`Stack`] type for details.
use crate::{
    hazard::Domain,
    loom::{
        cell::UnsafeCell,
        sync::atomic::{AtomicPtr, Ordering::*},
    },
};
use alloc::boxed::Box;
use core::{
    fmt,
    ptr::{self, NonNull},
};

/// An unbounded, lock-free LIFO stack.
///
/// This is the classic [Treiber stack]: a single atomic `head` pointer over a
/// singly-linked list of heap-allocated nodes. Any number of threads may
/// [`push`](Self::push) and [`try_pop`](Self::try_pop) concurrently through
/// `&` references.
///
/// What makes a Treiber stack interesting is not the push; it's that a
/// popping thread must read `head.next` while other threads may concurrently
/// pop *and free* that same head node. This implementation solves the
/// use-after-free with a per-stack [hazard-pointer domain](Domain): a popper
/// publishes the head it is about to dereference, and detached nodes are
/// [retired](Domain::retire) rather than freed, so the domain destroys them
/// only once no thread publishes their address.
///
/// Pops observe pushes from the same thread in reverse order; no ordering is
/// guaranteed between pushes on different threads. Both operations are
/// lock-free but not wait-free: a thread may lose the head CAS any number of
/// times, but some thread always wins.
///
/// [Treiber stack]: https://en.wikipedia.org/wiki/Treiber_stack
pub struct Stack<T> {
    head: AtomicPtr<Node<T>>,
    hazards: Domain<Node<T>>,
}

struct Node<T> {
    /// The next node down. Written while the node is still private to the
    /// pushing thread; read-only once published.
    next: UnsafeCell<*mut Node<T>>,

    /// The payload, taken by whichever thread detaches the node.
    value: UnsafeCell<Option<T>>,
}

unsafe fn destroy_node<T>(node: NonNull<Node<T>>) {
    drop(Box::from_raw(node.as_ptr()));
}

// === impl Stack ===

impl<T> Stack<T> {
    /// Returns a new, empty `Stack`.
    #[cfg(not(loom))]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            hazards: Domain::new(),
        }
    }

    /// Returns a new, empty `Stack`.
    #[cfg(loom)]
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            hazards: Domain::new(),
        }
    }

    /// Returns a new, empty `Stack` whose hazard domain scans for
    /// reclaimable nodes every `scan_threshold` retired nodes, instead of
    /// [the default](Domain::DEFAULT_SCAN_THRESHOLD).
    ///
    /// A smaller threshold trades throughput for a smaller bound on deferred
    /// memory.
    #[cfg(not(loom))]
    #[must_use]
    pub const fn with_scan_threshold(scan_threshold: usize) -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            hazards: Domain::with_scan_threshold(scan_threshold),
        }
    }

    /// Returns a new, empty `Stack` with the given hazard-domain scan
    /// threshold.
    #[cfg(loom)]
    #[must_use]
    pub fn with_scan_threshold(scan_threshold: usize) -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            hazards: Domain::with_scan_threshold(scan_threshold),
        }
    }

    /// Pushes `value` onto the top of the stack.
    ///
    /// This is an *O*(1) operation, although it performs a compare-and-swap
    /// loop that may repeat if other threads are concurrently operating on
    /// the stack's head.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            next: UnsafeCell::new(ptr::null_mut()),
            value: UnsafeCell::new(Some(value)),
        }));
        let mut head = self.head.load(Relaxed);
        loop {
            test_trace!(?node, ?head, "Stack::push");
            // Safety: the node is private to this thread until the CAS below
            // publishes it.
            unsafe { (*node).next.with_mut(|next| *next = head) };
            match self.head.compare_exchange_weak(head, node, AcqRel, Acquire) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Pops the value most recently pushed onto the stack, or returns `None`
    /// if the stack is empty.
    ///
    /// This never blocks; `None` means the stack was observed empty at some
    /// instant during the call.
    pub fn try_pop(&self) -> Option<T> {
        let hp = self.hazards.acquire();
        let node = loop {
            // Publish the head we are about to dereference, confirming the
            // publication against a re-read. `None` (an empty stack) drops
            // the guard, releasing the slot.
            let head = hp.protect(&self.head);
            let node = NonNull::new(head)?;

            // Safety: the confirmed publication above keeps the node from
            // being destroyed, even if another thread detaches it while we
            // read its `next` link.
            let next = unsafe { node.as_ref().next.with(|next| *next) };
            if self
                .head
                .compare_exchange(head, next, AcqRel, Acquire)
                .is_ok()
            {
                break node;
            }
        };
        test_trace!(?node, "Stack::try_pop -> detached");

        // Safety: the node is detached; no thread can newly reach it, and
        // whoever detached it (us) has the sole right to its payload.
        let value = unsafe { node.as_ref().value.with_mut(|value| (*value).take()) };

        // Clear our own publication *before* retiring the node; otherwise
        // every pop would defer its own node to a later scan.
        drop(hp);
        // Safety: the node is unlinked, retired once, and never freed here.
        unsafe { self.hazards.retire(node, destroy_node) };
        value
    }

    /// Returns `true` if the stack was observed empty.
    ///
    /// Under concurrency this is only a hint: the stack may gain or lose
    /// elements before the caller acts on the answer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Acquire).is_null()
    }

}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        // The stack owns any values that were never popped; popping them here
        // both drops the values and retires their nodes into the domain,
        // which destroys everything when it drops right after.
        while self.try_pop().is_some() {}
    }
}

impl<T> fmt::Debug for Stack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { head, hazards } = self;
        f.debug_struct("Stack")
            .field("head", &head.load(Acquire))
            .field("hazards", hazards)
            .finish()
    }
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// # Safety
///
/// A `Stack` owns its values: sending or sharing the stack sends the `T`s in
/// it, and a value inserted on one thread may be popped, and dropped, on
/// another. No `&T` access to the elements is ever given out.
unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

// `Node` is only ever touched through the stack.
unsafe impl<T: Send> Send for Node<T> {}
unsafe impl<T: Send> Sync for Node<T> {}

impl<T> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("stack::Node { ... }")
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, vec::Vec};

    #[test]
    fn empty_at_birth() {
        let stack = Stack::<i32>::new();
        assert!(stack.is_empty());
        assert_eq!(stack.try_pop(), None);
    }

    #[test]
    fn lifo_order() {
        let stack = Stack::new();
        stack.push(1);
        stack.push(2);
        stack.push(3);
        assert!(!stack.is_empty());
        assert_eq!(stack.try_pop(), Some(3));
        assert_eq!(stack.try_pop(), Some(2));
        assert_eq!(stack.try_pop(), Some(1));
        assert_eq!(stack.try_pop(), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn drop_drains_values() {
        struct CountDrop(Arc<std::sync::atomic::AtomicUsize>);
        impl Drop for CountDrop {
            fn drop(&mut self) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let drops = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let stack = Stack::new();
        for _ in 0..3 {
            stack.push(CountDrop(drops.clone()));
        }
        drop(stack);
        assert_eq!(drops.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test]
    fn concurrent_conservation() {
        const PER_THREAD: i32 = 1000;
        // A small scan threshold so the test actually exercises reclamation.
        let stack = Arc::new(Stack::with_scan_threshold(8));

        let producers: Vec<_> = (0..2)
            .map(|t| {
                let stack = stack.clone();
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        stack.push(t * PER_THREAD + i);
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        while seen.len() < 2 * PER_THREAD as usize {
            if let Some(value) = stack.try_pop() {
                seen.push(value);
            } else {
                thread::yield_now();
            }
        }
        for p in producers {
            p.join().unwrap();
        }

        assert_eq!(stack.try_pop(), None);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 2 * PER_THREAD as usize, "no loss, no duplication");
    }

    #[test]
    fn stack_is_send_sync() {
        crate::util::assert_send_sync::<Stack<i32>>();
    }
}
