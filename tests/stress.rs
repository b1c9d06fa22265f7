//! Cross-thread workloads for every container: ordering, conservation (no
//! element lost, duplicated, or fabricated), and full/empty behavior under
//! sustained contention.
#![cfg(not(loom))]

use hypha::{blocking, MpmcQueue, MpscQueue, SpmcQueue, SpscQueue, Stack};
use std::{sync::Arc, thread};

/// One producer, one consumer, values must arrive in exactly push order.
#[test]
fn spsc_ordered_handoff() {
    const N: usize = if cfg!(debug_assertions) { 100_000 } else { 1_000_000 };

    let q = Arc::new(SpscQueue::new());
    let producer = thread::spawn({
        let q = q.clone();
        move || {
            let producer = q.producer();
            for i in 0..N {
                producer.push(i);
            }
        }
    });

    let consumer = q.consumer();
    let mut expected = 0;
    while expected < N {
        match consumer.try_pop() {
            Some(value) => {
                assert_eq!(value, expected, "SPSC delivered out of order");
                expected += 1;
            }
            None => thread::yield_now(),
        }
    }

    producer.join().unwrap();
    assert!(q.is_empty());
}

/// One producer, fifteen consumers; the union of everything popped is
/// exactly the set pushed.
#[test]
fn spmc_union_across_consumers() {
    const CONSUMERS: usize = 15;
    const PER_CONSUMER: usize = 1_000;
    const TOTAL: usize = CONSUMERS * PER_CONSUMER;

    let q = Arc::new(SpmcQueue::new());
    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let q = q.clone();
            thread::spawn(move || {
                let mut seen = Vec::with_capacity(PER_CONSUMER);
                while seen.len() < PER_CONSUMER {
                    match q.try_pop() {
                        Some(value) => seen.push(value),
                        None => thread::yield_now(),
                    }
                }
                seen
            })
        })
        .collect();

    let producer = q.producer();
    for i in 0..TOTAL {
        producer.push(i);
    }

    let mut all: Vec<usize> = consumers
        .into_iter()
        .flat_map(|c| c.join().unwrap())
        .collect();
    all.sort_unstable();
    let expected: Vec<usize> = (0..TOTAL).collect();
    assert_eq!(all, expected, "values lost, duplicated, or fabricated");
}

/// Fifteen producers with disjoint ranges, one consumer; the union is the
/// full set and each producer's values arrive in its own push order.
#[test]
fn mpsc_union_across_producers() {
    const PRODUCERS: usize = 15;
    const PER_PRODUCER: usize = 1_000;
    const TOTAL: usize = PRODUCERS * PER_PRODUCER;

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
    let mut seen = Vec::with_capacity(TOTAL);
    while seen.len() < TOTAL {
        match consumer.try_pop() {
            Some(value) => seen.push(value),
            None => thread::yield_now(),
        }
    }
    for p in producers {
        p.join().unwrap();
    }

    for t in 0..PRODUCERS {
        let per_producer: Vec<_> = seen.iter().filter(|&&v| v / PER_PRODUCER == t).collect();
        assert!(
            per_producer.windows(2).all(|w| w[0] < w[1]),
            "producer {t}'s values were reordered"
        );
    }

    seen.sort_unstable();
    let expected: Vec<usize> = (0..TOTAL).collect();
    assert_eq!(seen, expected, "values lost, duplicated, or fabricated");
}

/// Four producers and eight consumers over a bounded ring; producers retry
/// on full, consumers on empty, and nothing is lost either way.
#[test]
fn mpmc_bounded_stress() {
    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 8;
    const PER_PRODUCER: usize = 300;
    const TOTAL: usize = PRODUCERS * PER_PRODUCER;

    let q = Arc::new(MpmcQueue::new(1024));
    assert_eq!(q.capacity(), 1024);

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let q = q.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                while seen.len() < TOTAL / CONSUMERS {
                    match q.try_pop() {
                        Some(value) => seen.push(value),
                        None => thread::yield_now(),
                    }
                }
                seen
            })
        })
        .collect();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|t| {
            let q = q.clone();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut value = t * PER_PRODUCER + i;
                    loop {
                        match q.try_push(value) {
                            Ok(()) => break,
                            Err(full) => {
                                value = full.into_inner();
                                thread::yield_now();
                            }
                        }
                    }
                }
            })
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }
    let mut all: Vec<usize> = consumers
        .into_iter()
        .flat_map(|c| c.join().unwrap())
        .collect();
    all.sort_unstable();
    let expected: Vec<usize> = (0..TOTAL).collect();
    assert_eq!(all, expected, "values lost, duplicated, or fabricated");
    assert!(q.is_empty());
}

/// Pushes and pops racing on the stack from many threads; every pushed value
/// is popped exactly once, with reclamation kept busy by a low threshold.
#[test]
fn stack_concurrent_conservation() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 2_000;
    const TOTAL: usize = THREADS * PER_THREAD;

    let stack = Arc::new(Stack::with_scan_threshold(32));
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let stack = stack.clone();
            thread::spawn(move || {
                // Interleave pushes with opportunistic pops, so threads race
                // on both sides of the head.
                let mut popped = Vec::new();
                for i in 0..PER_THREAD {
                    stack.push(t * PER_THREAD + i);
                    if i % 2 == 0 {
                        if let Some(value) = stack.try_pop() {
                            popped.push(value);
                        }
                    }
                }
                popped
            })
        })
        .collect();

    let mut all = Vec::with_capacity(TOTAL);
    for w in workers {
        all.extend(w.join().unwrap());
    }
    while let Some(value) = stack.try_pop() {
        all.push(value);
    }

    all.sort_unstable();
    let expected: Vec<usize> = (0..TOTAL).collect();
    assert_eq!(all, expected, "values lost, duplicated, or fabricated");
}

/// Producers and blocking consumers on the two-lock queue, shut down by one
/// sentinel per consumer.
#[test]
fn blocking_queue_stress() {
    const PRODUCERS: usize = 2;
    const CONSUMERS: usize = 3;
    const PER_PRODUCER: usize = 5_000;
    const TOTAL: usize = PRODUCERS * PER_PRODUCER;

    let q = Arc::new(blocking::Queue::<Option<usize>>::new());
    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let q = q.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(value) = q.wait_and_pop() {
                    seen.push(value);
                }
                seen
            })
        })
        .collect();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|t| {
            let q = q.clone();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    q.push(Some(t * PER_PRODUCER + i));
                }
            })
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }
    for _ in 0..CONSUMERS {
        q.push(None);
    }

    let mut all: Vec<usize> = consumers
        .into_iter()
        .flat_map(|c| c.join().unwrap())
        .collect();
    all.sort_unstable();
    let expected: Vec<usize> = (0..TOTAL).collect();
    assert_eq!(all, expected, "values lost, duplicated, or fabricated");
}
