//! The hazard-pointer domain exercised directly, without a container in
//! front of it: threads race to claim pointers out of shared cells, and the
//! loser of a race must never observe freed memory.
#![cfg(not(loom))]

use hypha::hazard::Domain;
use std::{
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicPtr, Ordering},
    thread,
};

unsafe fn destroy_usize(ptr: NonNull<usize>) {
    drop(Box::from_raw(ptr.as_ptr()));
}

/// Each cell holds one heap pointer; every thread tries to claim every cell.
/// Exactly one claimant must win each, and the memory a loser may still be
/// reading stays alive until its hazard is cleared.
fn claim_workload(threads: usize, cells_len: usize) {
    let domain = Domain::<usize>::with_scan_threshold(64);
    let cells: Vec<AtomicPtr<usize>> = (0..cells_len)
        .map(|i| AtomicPtr::new(Box::into_raw(Box::new(i))))
        .collect();
    let claimed: Vec<AtomicBool> = (0..cells_len).map(|_| AtomicBool::new(false)).collect();

    thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| {
                for cell in &cells {
                    let hp = domain.acquire();

                    // Publish-and-confirm, then try to take the cell.
                    let mut ptr = cell.load(Ordering::SeqCst);
                    let won = loop {
                        hp.publish(ptr);
                        let reread = cell.load(Ordering::SeqCst);
                        if reread != ptr {
                            ptr = reread;
                            continue;
                        }
                        if ptr.is_null() {
                            break None;
                        }
                        match cell.compare_exchange(
                            ptr,
                            std::ptr::null_mut(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => break Some(ptr),
                            Err(actual) => ptr = actual,
                        }
                    };

                    if let Some(ptr) = won {
                        // We detached the pointer; the publication above
                        // makes this dereference safe even if another thread
                        // raced us here.
                        let value = unsafe { *ptr };
                        assert!(
                            !claimed[value].swap(true, Ordering::SeqCst),
                            "cell {value} claimed twice"
                        );
                        drop(hp);
                        // Safety: detached, retired once, never freed here.
                        unsafe { domain.retire(NonNull::new_unchecked(ptr), destroy_usize) };
                    }
                }
            });
        }
    });

    for (i, flag) in claimed.iter().enumerate() {
        assert!(flag.load(Ordering::SeqCst), "cell {i} was never claimed");
    }
    // `domain` drops here, running the final scan over whatever is left on
    // the retired list.
}

#[test]
fn two_threads() {
    claim_workload(2, 1_000);
}

#[test]
fn eight_threads() {
    claim_workload(8, if cfg!(debug_assertions) { 10_000 } else { 80_000 });
}
