//! Hazard pointers: safe deferred reclamation for lock-free data structures.
//!
//! See the documentation for the [`Domain`] type for details.
//!
//! Based on [Maged Michael's hazard pointers][michael].
//!
//! [michael]: https://ieeexplore.ieee.org/document/1291819
use crate::loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering::*};
use alloc::boxed::Box;
use core::{
    fmt,
    ptr::{self, NonNull},
};

/// A reclamation domain: a set of hazard-pointer slots and a list of retired
/// objects awaiting destruction.
///
/// The problem a `Domain` solves is the fundamental one of lock-free linked
/// structures: a thread that has loaded a node pointer from the structure may
/// dereference it *after* another thread has already unlinked that node and
/// wants to free it. Before dereferencing, a reader therefore *publishes* the
/// pointer into a [`HazardPointer`] acquired from the domain; a writer that
/// has unlinked a node hands it to [`retire`] instead of freeing it, and the
/// domain destroys it only once no slot publishes its address.
///
/// A `Domain` is intended to be owned by the data structure whose nodes it
/// protects, one domain per container instance; retiring pointers from
/// unrelated structures into one domain works, but couples their reclamation
/// cadence for no benefit.
///
/// # Protocol
///
/// Readers:
///
/// 1. [`acquire`] a [`HazardPointer`].
/// 2. Load a node pointer from the structure and [`publish`] it, then re-load
///    and confirm the structure still references the node, retrying the
///    publication if not ([`HazardPointer::protect`] packages this loop).
///    Once confirmed, the node cannot be destroyed while the publication
///    stands.
/// 3. Drop the [`HazardPointer`] (or [`clear`] it) once done with the node.
///
/// Writers, having unlinked a node so that no *new* reader can reach it, pass
/// it to [`retire`] with a destructor. Retired nodes accumulate on an
/// append-only list; when the list length crosses the domain's scan
/// threshold, the retiring thread attempts a [`try_scan`], which destroys
/// every retired node no slot currently publishes and re-queues the rest.
/// Scans are single-flight: one scanner at a time, and contending scanners
/// skip the scan rather than wait, so no thread ever blocks on reclamation.
///
/// # Slots
///
/// The slot list only grows: released slots are marked inactive and reused by
/// later [`acquire`] calls, and the slots themselves are freed only when the
/// domain is dropped. This keeps the list traversable without any
/// reader/writer coordination beyond the per-slot `active` flag.
///
/// [`acquire`]: Domain::acquire
/// [`retire`]: Domain::retire
/// [`try_scan`]: Domain::try_scan
/// [`publish`]: HazardPointer::publish
/// [`clear`]: HazardPointer::clear
pub struct Domain<N> {
    /// Head of the append-only slot list.
    slots: AtomicPtr<Slot<N>>,

    /// Head of the retired-record list.
    retired: AtomicPtr<Retired<N>>,

    /// Number of records on the retired list. Maintained approximately; this
    /// only paces scans, it is not a correctness parameter.
    retired_len: AtomicUsize,

    /// Scan gate. At most one thread scans at a time; others skip.
    scanning: AtomicBool,

    scan_threshold: usize,
}

/// An acquired hazard-pointer slot, used to publish the address a thread is
/// about to dereference.
///
/// Dropping a `HazardPointer` clears the publication and releases the slot
/// for reuse. The type is deliberately not `Send`: a slot belongs to the
/// thread that acquired it.
///
/// Returned by [`Domain::acquire`].
pub struct HazardPointer<'domain, N> {
    domain: &'domain Domain<N>,
    slot: &'domain Slot<N>,
}

struct Slot<N> {
    /// Next slot in the list. Written once, before the slot is published;
    /// immutable afterwards.
    next: *mut Slot<N>,
    protected: AtomicPtr<N>,
    active: AtomicBool,
}

/// A retired object: destroyed by a scan once no slot publishes `ptr`.
struct Retired<N> {
    ptr: NonNull<N>,
    destroy: unsafe fn(NonNull<N>),
    next: *mut Retired<N>,
}

// === impl Domain ===

impl<N> Domain<N> {
    /// The retired-list length at which [`retire`](Domain::retire) attempts a
    /// scan.
    ///
    /// This trades per-retire work against the memory held on the retired
    /// list; it has no bearing on correctness. [`Domain::with_scan_threshold`]
    /// overrides it.
    pub const DEFAULT_SCAN_THRESHOLD: usize = 20_000;

    /// Returns a new `Domain` with the default scan threshold.
    #[cfg(not(loom))]
    #[must_use]
    pub const fn new() -> Self {
        Self::with_scan_threshold(Self::DEFAULT_SCAN_THRESHOLD)
    }

    /// Returns a new `Domain` with the default scan threshold.
    #[cfg(loom)]
    #[must_use]
    pub fn new() -> Self {
        Self::with_scan_threshold(Self::DEFAULT_SCAN_THRESHOLD)
    }

    /// Returns a new `Domain` that attempts a scan once `scan_threshold`
    /// retired records have accumulated.
    #[cfg(not(loom))]
    #[must_use]
    pub const fn with_scan_threshold(scan_threshold: usize) -> Self {
        Self {
            slots: AtomicPtr::new(ptr::null_mut()),
            retired: AtomicPtr::new(ptr::null_mut()),
            retired_len: AtomicUsize::new(0),
            scanning: AtomicBool::new(false),
            scan_threshold,
        }
    }

    /// Returns a new `Domain` that attempts a scan once `scan_threshold`
    /// retired records have accumulated.
    #[cfg(loom)]
    #[must_use]
    pub fn with_scan_threshold(scan_threshold: usize) -> Self {
        Self {
            slots: AtomicPtr::new(ptr::null_mut()),
            retired: AtomicPtr::new(ptr::null_mut()),
            retired_len: AtomicUsize::new(0),
            scanning: AtomicBool::new(false),
            scan_threshold,
        }
    }

    /// Acquires a [`HazardPointer`] slot from this domain.
    ///
    /// An inactive slot is reused if one exists; otherwise a new slot is
    /// pushed onto the front of the slot list. Each call returns a distinct
    /// slot, so a thread that (unusually) needs to protect two addresses at
    /// once may simply acquire twice.
    pub fn acquire(&self) -> HazardPointer<'_, N> {
        // First, try to claim a previously-released slot.
        let mut slot_ptr = self.slots.load(Acquire);
        while let Some(slot) = NonNull::new(slot_ptr) {
            // Safety: slots are never freed while the domain is alive, and
            // the `&self` borrow keeps the domain alive.
            let slot = unsafe { &*slot.as_ptr() };
            if slot
                .active
                .compare_exchange(false, true, AcqRel, Relaxed)
                .is_ok()
            {
                test_trace!(slot = ?ptr::addr_of!(*slot), "Domain::acquire -> reused");
                return HazardPointer { domain: self, slot };
            }
            slot_ptr = slot.next;
        }

        // No inactive slot; push a fresh one onto the front of the list.
        let slot = Box::into_raw(Box::new(Slot {
            next: ptr::null_mut(),
            protected: AtomicPtr::new(ptr::null_mut()),
            active: AtomicBool::new(true),
        }));
        let mut head = self.slots.load(Relaxed);
        loop {
            // Safety: the new slot is unreachable until the CAS below
            // publishes it, so writing its `next` link is unsynchronized.
            unsafe { (*slot).next = head };
            match self.slots.compare_exchange_weak(head, slot, AcqRel, Acquire) {
                Ok(_) => {
                    test_trace!(?slot, "Domain::acquire -> new slot");
                    // Safety: as above, slots live as long as the domain.
                    return HazardPointer {
                        domain: self,
                        slot: unsafe { &*slot },
                    };
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Returns `true` if any slot in this domain currently publishes `ptr`.
    pub fn is_hazardous(&self, ptr: *mut N) -> bool {
        let mut slot_ptr = self.slots.load(Acquire);
        while let Some(slot) = NonNull::new(slot_ptr) {
            // Safety: slots live as long as the domain.
            let slot = unsafe { &*slot.as_ptr() };
            // This load must be ordered with respect to readers' `publish`
            // stores; see the comment in `HazardPointer::publish`.
            if slot.protected.load(SeqCst) == ptr {
                return true;
            }
            slot_ptr = slot.next;
        }
        false
    }

    /// Hands `ptr` to the domain for deferred destruction.
    ///
    /// `destroy` will be invoked exactly once, by whichever scan first finds
    /// no slot publishing `ptr` (possibly the final scan in the domain's
    /// destructor). If the retired list has reached the scan threshold, this
    /// call attempts the scan itself.
    ///
    /// # Safety
    ///
    /// - `ptr` must be unlinked: no thread may be able to *newly* reach it
    ///   from the protected structure (threads that already published it are
    ///   exactly what the domain defends against).
    /// - `ptr` must not be retired twice, and must not be freed by the caller
    ///   after this call.
    /// - The caller's own hazard slot, if any, must no longer publish `ptr`,
    ///   or the node will survive scans until that slot is cleared.
    pub unsafe fn retire(&self, ptr: NonNull<N>, destroy: unsafe fn(NonNull<N>)) {
        let record = Box::into_raw(Box::new(Retired {
            ptr,
            destroy,
            next: ptr::null_mut(),
        }));
        self.insert_retired(record);
        if self.retired_len.fetch_add(1, Relaxed) + 1 >= self.scan_threshold {
            self.try_scan();
        }
    }

    /// Attempts to destroy retired objects that are no longer protected.
    ///
    /// At most one scan runs at a time; if another thread is already
    /// scanning, this returns `false` without waiting (the in-flight scan
    /// covers the caller's records too). Each record on the detached list is
    /// examined exactly once: still-hazardous records are re-queued for a
    /// later scan, the rest are destroyed.
    pub fn try_scan(&self) -> bool {
        if self
            .scanning
            .compare_exchange(false, true, AcqRel, Relaxed)
            .is_err()
        {
            return false;
        }

        let mut record = self.retired.swap(ptr::null_mut(), AcqRel);
        self.retired_len.store(0, Relaxed);
        let mut requeued = 0;
        while !record.is_null() {
            // Safety: records on the detached list are owned by this scan;
            // the single-flight gate keeps other scanners off it, and
            // `insert_retired` callers only touch the live list head.
            let rec = unsafe { Box::from_raw(record) };
            record = rec.next;
            if self.is_hazardous(rec.ptr.as_ptr()) {
                self.insert_retired(Box::into_raw(rec));
                requeued += 1;
            } else {
                test_trace!(ptr = ?rec.ptr, "Domain::try_scan -> destroy");
                // Safety: no slot publishes the pointer, no new reader can
                // reach it, and retire took over sole ownership of it.
                unsafe { (rec.destroy)(rec.ptr) };
            }
        }
        if requeued > 0 {
            self.retired_len.fetch_add(requeued, Relaxed);
        }
        self.scanning.store(false, Release);
        true
    }

    /// Push `record` onto the front of the retired list.
    fn insert_retired(&self, record: *mut Retired<N>) {
        let mut head = self.retired.load(Relaxed);
        loop {
            // Safety: the record is unreachable until the CAS publishes it.
            unsafe { (*record).next = head };
            match self
                .retired
                .compare_exchange_weak(head, record, AcqRel, Acquire)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> usize {
        let mut count = 0;
        let mut slot_ptr = self.slots.load(Acquire);
        while let Some(slot) = NonNull::new(slot_ptr) {
            count += 1;
            slot_ptr = unsafe { slot.as_ref() }.next;
        }
        count
    }
}

impl<N> Drop for Domain<N> {
    fn drop(&mut self) {
        // `Drop` requires exclusive ownership, so every `HazardPointer` into
        // this domain has been dropped and every slot must be inactive; an
        // active slot here means a guard outlived its domain.
        let mut slot_ptr = self.slots.load(Acquire);
        while !slot_ptr.is_null() {
            // Safety: we have exclusive ownership of the slot list.
            let slot = unsafe { Box::from_raw(slot_ptr) };
            assert!(
                !slot.active.load(Acquire),
                "hazard::Domain dropped while a HazardPointer was still active"
            );
            slot_ptr = slot.next;
        }

        // With no slots left, nothing is protected: destroy everything that
        // is still retired.
        let mut record = self.retired.swap(ptr::null_mut(), AcqRel);
        while !record.is_null() {
            // Safety: exclusive ownership, as above.
            let rec = unsafe { Box::from_raw(record) };
            record = rec.next;
            // Safety: retire took over sole ownership of the pointer, and no
            // reader can exist during drop.
            unsafe { (rec.destroy)(rec.ptr) };
        }
    }
}

impl<N> fmt::Debug for Domain<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            slots: _,
            retired: _,
            retired_len,
            scanning,
            scan_threshold,
        } = self;
        f.debug_struct("Domain")
            .field("retired_len", &retired_len.load(Relaxed))
            .field("scanning", &scanning.load(Relaxed))
            .field("scan_threshold", scan_threshold)
            .finish()
    }
}

impl<N> Default for Domain<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// # Safety
///
/// A `Domain` owns the retired `N`s it will eventually destroy, so sending or
/// sharing a domain across threads moves/shares those `N`s as well.
unsafe impl<N: Send> Send for Domain<N> {}
unsafe impl<N: Send> Sync for Domain<N> {}

// === impl HazardPointer ===

impl<N> HazardPointer<'_, N> {
    /// Publishes `ptr` in this slot, preventing the domain from destroying it
    /// until the publication is cleared.
    ///
    /// Note that publication alone proves nothing: the pointer may already
    /// have been retired before the publication landed. Callers must re-load
    /// the pointer from the data structure after publishing and confirm it is
    /// still reachable; [`protect`](Self::protect) does both.
    #[inline]
    pub fn publish(&self, ptr: *mut N) {
        // SeqCst orders this store before the caller's subsequent
        // confirmation load, and into a single total order with the scanner's
        // reads in `is_hazardous`: either the scanner observes the
        // publication, or the publisher's confirmation load observes the
        // structure without the node and gives up on it.
        self.slot.protected.store(ptr, SeqCst);
    }

    /// Clears the publication without releasing the slot.
    #[inline]
    pub fn clear(&self) {
        self.slot.protected.store(ptr::null_mut(), Release);
    }

    /// Loads a pointer from `src` and publishes it, re-trying until the
    /// publication is confirmed by a second load.
    ///
    /// On return, the protected pointer (which may be null) was observed in
    /// `src` *after* its publication, so until this slot is cleared the
    /// domain will not destroy the node it points to.
    pub(crate) fn protect(&self, src: &AtomicPtr<N>) -> *mut N {
        let mut ptr = src.load(SeqCst);
        loop {
            self.publish(ptr);
            let reread = src.load(SeqCst);
            if reread == ptr {
                return ptr;
            }
            ptr = reread;
        }
    }

    /// Returns the domain this hazard pointer belongs to.
    pub fn domain(&self) -> &Domain<N> {
        self.domain
    }
}

impl<N> Drop for HazardPointer<'_, N> {
    fn drop(&mut self) {
        // Clear the publication before deactivating, so that the slot can
        // never be observed inactive while still publishing a stale pointer.
        self.slot.protected.store(ptr::null_mut(), Release);
        self.slot.active.store(false, Release);
    }
}

impl<N> fmt::Debug for HazardPointer<'_, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HazardPointer")
            .field("protected", &self.slot.protected.load(Relaxed))
            .finish()
    }
}


#[cfg(all(test, loom))]
mod loom {
    use super::*;
    use crate::loom::{self, alloc::Track, sync::Arc, thread};
    use std::sync::atomic::{AtomicUsize, Ordering};

    unsafe fn destroy_tracked(ptr: NonNull<Track<usize>>) {
        drop(Box::from_raw(ptr.as_ptr()));
    }

    #[test]
    fn concurrent_claim() {
        // Two threads race to claim a shared pointer; whichever wins retires
        // it. Loom's leak tracking confirms the node is destroyed exactly
        // once, and never while the loser might still dereference it.
        loom::model(|| {
            let domain = Arc::new(Domain::<Track<usize>>::with_scan_threshold(1));
            let cell = Arc::new(AtomicPtr::new(Box::into_raw(Box::new(Track::new(7)))));
            let claimed = Arc::new(AtomicUsize::new(0));

            let threads: Vec<_> = (0..2)
                .map(|_| {
                    let domain = domain.clone();
                    let cell = cell.clone();
                    let claimed = claimed.clone();
                    thread::spawn(move || {
                        let hp = domain.acquire();
                        let ptr = hp.protect(&cell);
                        if ptr.is_null() {
                            return;
                        }
                        // Read through the protected pointer, then try to
                        // take the cell.
                        let tracked = unsafe { &*ptr };
                        let value = *tracked.get_ref();
                        if cell
                            .compare_exchange(ptr, core::ptr::null_mut(), AcqRel, Relaxed)
                            .is_ok()
                        {
                            assert_eq!(value, 7);
                            claimed.fetch_add(1, Ordering::SeqCst);
                            drop(hp);
                            unsafe {
                                domain.retire(NonNull::new_unchecked(ptr), destroy_tracked)
                            };
                        }
                    })
                })
                .collect();

            for t in threads {
                t.join().unwrap();
            }
            assert_eq!(claimed.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn scan_contention() {
        // Concurrent scans are single-flight; records must still all be
        // destroyed by the time the domain drops.
        loom::model(|| {
            let domain = Arc::new(Domain::<Track<usize>>::with_scan_threshold(usize::MAX));
            let threads: Vec<_> = (0..2)
                .map(|i| {
                    let domain = domain.clone();
                    thread::spawn(move || {
                        let node = Box::into_raw(Box::new(Track::new(i)));
                        unsafe {
                            domain.retire(NonNull::new_unchecked(node), destroy_tracked)
                        };
                        domain.try_scan();
                    })
                })
                .collect();
            for t in threads {
                t.join().unwrap();
            }
        });
    }
}
