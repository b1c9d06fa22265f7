#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![warn(missing_debug_implementations, missing_docs)]
//! Concurrent FIFO queues and LIFO stacks for every producer/consumer
//! cardinality, and the [hazard-pointer](hazard) reclamation they rely on.
//!
//! Hyphae are the thread-like conduits of a mycelium; this crate provides the
//! thread-to-thread conduits of a program. It is intended to be embedded into
//! higher-level systems (job queues, worker pools, message buses) that need
//! bounded or unbounded producer–consumer channels with well-specified
//! progress, ordering, and reclamation guarantees.
//!
//! ## containers
//!
//! - **[`Stack`]: an unbounded lock-free LIFO stack.**
//!
//!   A Treiber stack whose nodes are reclaimed through a per-stack
//!   [`hazard::Domain`], so that a node is never freed while another thread
//!   may still dereference it. Any number of threads may push and pop.
//!
//! - **[`SpscQueue`]: an unbounded lock-free single-producer,
//!   single-consumer FIFO queue.**
//!
//!   The cheapest queue in the crate: no compare-and-swap operations at all,
//!   just acquire/release handoff through a dummy node. The cardinality is
//!   enforced at runtime by the [`spsc_queue::Producer`] and
//!   [`spsc_queue::Consumer`] handles.
//!
//! - **[`SpmcQueue`]: an unbounded lock-free single-producer,
//!   multi-consumer FIFO queue.**
//!
//!   Consumers race on a [counted-reference] head; the producer side is
//!   uncontended.
//!
//! - **[`MpscQueue`]: an unbounded lock-free multi-producer,
//!   single-consumer FIFO queue.**
//!
//!   Producers serialize on a payload-slot compare-and-swap; both ends of
//!   the queue are [counted references][counted-reference], with each node's
//!   reference counts packed into a single atomic word.
//!
//! - **[`MpmcQueue`]: a bounded lock-free multi-producer, multi-consumer
//!   FIFO ring.**
//!
//!   A fixed-capacity ring buffer with a per-slot generation counter that
//!   encodes the slot's lap and whether it next expects a producer or a
//!   consumer. [`try_push`](MpmcQueue::try_push) reports fullness instead of
//!   blocking.
//!
//! - **[`blocking::Queue`]: an unbounded queue with fine-grained locking
//!   and blocking pops** (`std` only).
//!
//!   Separate head and tail mutexes let a producer and a consumer proceed in
//!   parallel; [`wait_and_pop`](blocking::Queue::wait_and_pop) parks the
//!   caller until an element arrives.
//!
//! - **[`locked::Queue`] and [`locked::Stack`]: coarse single-mutex
//!   baselines** (`std` only), useful as references and fallbacks.
//!
//! All of the lock-free containers guarantee per-producer FIFO (or, for the
//! stack, per-thread LIFO) ordering, never deliver an element twice, and
//! never lose an element whose push completed. None of them ever block;
//! emptiness and (for the bounded ring) fullness are reported to the caller,
//! who may spin, back off, or do something else entirely.
//!
//! ## feature flags
//!
//! - `std` (default): enables the [`blocking`] and [`locked`] containers.
//! - `alloc`: the lock-free containers; implied by `std`.
//! - `no-cache-pad`: disables cache-line padding of the containers' atomics,
//!   for targets with no data cache.
//!
//! [counted-reference]: crate::mpsc_queue#counted-references
#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(test)]
extern crate std;

#[macro_use]
pub(crate) mod util;

pub(crate) mod loom;

feature! {
    #![feature = "alloc"]

    pub(crate) mod counted;

    pub mod hazard;
    pub mod mpmc_queue;
    pub mod mpsc_queue;
    pub mod spmc_queue;
    pub mod spsc_queue;
    pub mod stack;

    #[doc(inline)]
    pub use self::mpmc_queue::MpmcQueue;
    #[doc(inline)]
    pub use self::mpsc_queue::MpscQueue;
    #[doc(inline)]
    pub use self::spmc_queue::SpmcQueue;
    #[doc(inline)]
    pub use self::spsc_queue::SpscQueue;
    #[doc(inline)]
    pub use self::stack::Stack;
}

feature! {
    #![feature = "std"]

    pub mod blocking;
    pub mod locked;
}
