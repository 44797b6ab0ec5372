//! Per-bucket locking capability.
//!
//! The index does not lock on its own. Callers take the lock for a hash
//! before find/insert/delete, and the maintenance thread takes the same
//! locks when it migrates a bucket. Locks are sharded by the low bits of
//! the hash; as long as the shard count never exceeds the bucket count,
//! one shard covers an old bucket and both of its migration destinations.

use crate::config::MAX_LOCK_POWER;
use parking_lot::{Mutex, MutexGuard};

/// Lock facility keyed by hash (or bucket index; only the low bits matter).
///
/// Dropping a guard releases the lock.
pub trait BucketLocks: Send + Sync {
    /// Guard held while a bucket is locked.
    type Guard<'a>
    where
        Self: 'a;

    /// Block until the lock covering `hash` is held.
    fn lock(&self, hash: u32) -> Self::Guard<'_>;

    /// Take the lock covering `hash` if it is free.
    fn try_lock(&self, hash: u32) -> Option<Self::Guard<'_>>;

    /// Number of lock shards. Must be a power of two.
    fn count(&self) -> usize;
}

/// Item locks backed by a power-of-two array of mutexes.
pub struct ItemLocks {
    locks: Box<[Mutex<()>]>,
    mask: u32,
}

impl ItemLocks {
    /// Create `2^power` lock shards.
    pub fn new(power: u8) -> Self {
        assert!(
            power <= MAX_LOCK_POWER,
            "lock power must be at most {}",
            MAX_LOCK_POWER
        );
        let count = 1_usize << power;
        let locks = (0..count)
            .map(|_| Mutex::new(()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            locks,
            mask: (count - 1) as u32,
        }
    }

    #[inline]
    fn shard(&self, hash: u32) -> &Mutex<()> {
        &self.locks[(hash & self.mask) as usize]
    }
}

impl BucketLocks for ItemLocks {
    type Guard<'a> = MutexGuard<'a, ()>;

    #[inline]
    fn lock(&self, hash: u32) -> Self::Guard<'_> {
        self.shard(hash).lock()
    }

    #[inline]
    fn try_lock(&self, hash: u32) -> Option<Self::Guard<'_>> {
        self.shard(hash).try_lock()
    }

    #[inline]
    fn count(&self) -> usize {
        self.locks.len()
    }
}
