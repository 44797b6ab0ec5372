//! Synchronization primitives with optional loom support.
//!
//! Bucket slots, chain links and the migration cursor are plain atomics so
//! the relink protocol can be model checked with loom while production builds
//! use std atomics.

#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// Back off while a migration step waits on a busy bucket.
///
/// Under loom this yields so the model checker can schedule the lock holder.
#[inline]
pub fn backoff(duration: std::time::Duration) {
    #[cfg(not(feature = "loom"))]
    std::thread::sleep(duration);

    #[cfg(feature = "loom")]
    {
        let _ = duration;
        loom::thread::yield_now();
    }
}
