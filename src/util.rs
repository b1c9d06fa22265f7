use crate::loom::{
    hint,
    sync::atomic::{AtomicBool, Ordering::*},
};
use core::{
    fmt,
    ops::{Deref, DerefMut},
};

/// Conditionally compiles a set of items based on a feature flag, and tags
/// their documentation with the feature they require.
macro_rules! feature {
    (
        #![$meta:meta]
        $($item:item)*
    ) => {
        $(
            #[cfg($meta)]
            #[cfg_attr(docsrs, doc(cfg($meta)))]
            $item
        )*
    }
}

macro_rules! test_trace {
    ($($tt:tt)*) => {
        #[cfg(test)]
        tracing::trace!($($tt)*)
    }
}

/// Doubling backoff for compare-and-swap retry loops.
///
/// Tracks the number of pause instructions to issue on the next retry,
/// starting from one and doubling after every wait until [`Self::MAX_SPINS`].
/// Losing a race once is cheap; losing it over and over pushes the loser off
/// the contended line for longer and longer stretches.
#[derive(Debug)]
pub(crate) struct Backoff {
    spins: u32,
}

/// Pads and aligns a value to the length of a cache line.
///
/// This wraps the head- and tail-side atomics of the queues, so that
/// producers and consumers hammering on opposite ends of a queue do not
/// [falsely share] a cache line. A line is assumed to be 128 bytes on
/// `x86_64` and `aarch64` (adjacent-line prefetch pairs) and 64 bytes
/// elsewhere; the `no-cache-pad` feature strips the alignment entirely, for
/// targets with no data cache.
///
/// [falsely share]: https://en.wikipedia.org/wiki/False_sharing
#[cfg_attr(
    all(
        not(feature = "no-cache-pad"),
        any(target_arch = "x86_64", target_arch = "aarch64")
    ),
    repr(align(128))
)]
#[cfg_attr(
    all(
        not(feature = "no-cache-pad"),
        not(any(target_arch = "x86_64", target_arch = "aarch64"))
    ),
    repr(align(64))
)]
#[derive(Clone, Copy, Default)]
pub(crate) struct CachePadded<T>(T);

// === impl Backoff ===

impl Backoff {
    /// The longest single wait, in pause instructions.
    ///
    /// Capped fairly low: the retry loops in this crate lose races to
    /// operations that are a handful of instructions long, so waiting much
    /// longer than this just adds latency once the line quiets down.
    const MAX_SPINS: u32 = 64;

    pub(crate) const fn new() -> Self {
        Self { spins: 1 }
    }

    /// Wait out one round of contention, doubling the next round's length.
    #[inline]
    pub(crate) fn spin(&mut self) {
        for _ in 0..self.spins {
            hint::spin_loop();
        }
        if self.spins < Self::MAX_SPINS {
            self.spins <<= 1;
        }
    }
}

// === impl CachePadded ===

impl<T> CachePadded<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self(value)
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for CachePadded<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T: fmt::Debug> fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Claim an exclusive-role flag (e.g. "the producer exists"), spinning with a
/// backoff until the current holder releases it.
pub(crate) fn lock_flag(flag: &AtomicBool) {
    let mut boff = Backoff::new();
    while flag.compare_exchange(false, true, AcqRel, Acquire).is_err() {
        while flag.load(Relaxed) {
            boff.spin();
        }
    }
}

/// Claim an exclusive-role flag, or return `None` if it is already held.
pub(crate) fn try_lock_flag(flag: &AtomicBool) -> Option<()> {
    flag.compare_exchange(false, true, AcqRel, Acquire)
        .map(|_| ())
        .ok()
}

#[cfg(test)]
pub(crate) fn assert_send_sync<T: Send + Sync>() {}
