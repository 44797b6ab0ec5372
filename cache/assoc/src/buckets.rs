//! Bucket arrays and hash addressing.
//!
//! A table is one primary array of `2^hash_power` slots, plus, while an
//! expansion is migrating, the previous primary as the old array of
//! `2^(hash_power - 1)` slots. Old buckets below the migration cursor have
//! been moved; everything at or above it is still served from the old array.
//!
//! The arrays, hash power and cursor are published together as a [`Buckets`]
//! snapshot. Foreground operations load the current snapshot without
//! locking; the caller's bucket lock is what orders them against migration.

use crate::entry::EntryId;
use crate::error::{AssocError, AssocResult};
use crate::sync::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Bytes used by one bucket slot.
pub const SLOT_SIZE: usize = std::mem::size_of::<u32>();

/// Mask selecting the bucket index for a table of `2^power` buckets.
#[inline]
pub fn hashmask(power: u8) -> u32 {
    ((1_u64 << power) - 1) as u32
}

/// Number of buckets in a table of `2^power` buckets.
#[inline]
pub fn hashsize(power: u8) -> usize {
    1_usize << power
}

/// A power-of-two array of chain heads.
pub(crate) struct BucketArray {
    slots: Box<[AtomicU32]>,
}

impl BucketArray {
    /// Allocate `2^power` empty buckets without aborting on failure.
    pub fn allocate(power: u8) -> AssocResult<Self> {
        let buckets = hashsize(power);
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(buckets)
            .map_err(|_| AssocError::AllocationFailed { buckets })?;
        slots.extend((0..buckets).map(|_| AtomicU32::new(0)));

        Ok(Self {
            slots: slots.into_boxed_slice(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn bytes(&self) -> usize {
        self.slots.len() * SLOT_SIZE
    }

    #[inline]
    pub fn head(&self, index: usize) -> Option<EntryId> {
        EntryId::unpack(self.slots[index].load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_head(&self, index: usize, head: Option<EntryId>) {
        self.slots[index].store(EntryId::pack(head), Ordering::Relaxed);
    }
}

/// One slot of one array.
#[derive(Clone, Copy)]
pub(crate) struct BucketRef<'a> {
    array: &'a BucketArray,
    index: usize,
}

impl BucketRef<'_> {
    #[inline]
    pub fn head(&self) -> Option<EntryId> {
        self.array.head(self.index)
    }

    #[inline]
    pub fn set_head(&self, head: Option<EntryId>) {
        self.array.set_head(self.index, head);
    }
}

/// Which array currently holds a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The primary array.
    Primary,
    /// The old array of an expansion in progress.
    Old,
}

/// One published snapshot of the table: arrays, hash power and the
/// migration cursor of that snapshot.
///
/// Snapshots are immutable apart from bucket slots and the cursor, and are
/// replaced whole by the maintenance lock holder. Arrays are shared between
/// consecutive snapshots, so a thread still holding the previous snapshot
/// reaches the same chains as one holding the new snapshot. The cursor
/// advances while the migrating thread holds the lock for the bucket being
/// moved.
pub(crate) struct Buckets {
    pub primary: Arc<BucketArray>,
    pub old: Option<Arc<BucketArray>>,
    pub hash_power: u8,
    pub expand_bucket: AtomicUsize,
}

impl Buckets {
    /// A stable snapshot.
    pub fn new(primary: Arc<BucketArray>, hash_power: u8) -> Self {
        debug_assert_eq!(primary.len(), hashsize(hash_power));
        Self {
            primary,
            old: None,
            hash_power,
            expand_bucket: AtomicUsize::new(0),
        }
    }

    /// An expanding snapshot with nothing migrated yet.
    pub fn expanding(primary: Arc<BucketArray>, old: Arc<BucketArray>, hash_power: u8) -> Self {
        debug_assert_eq!(primary.len(), hashsize(hash_power));
        debug_assert_eq!(old.len() * 2, primary.len());
        Self {
            primary,
            old: Some(old),
            hash_power,
            expand_bucket: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn is_expanding(&self) -> bool {
        self.old.is_some()
    }

    #[inline]
    pub fn expand_bucket(&self) -> usize {
        self.expand_bucket.load(Ordering::Acquire)
    }

    /// Bytes held by all bucket arrays.
    pub fn bytes(&self) -> usize {
        self.primary.bytes() + self.old.as_deref().map_or(0, BucketArray::bytes)
    }

    /// The authoritative bucket for `hash`, and which array it lives in.
    ///
    /// The old array is only reachable through the snapshot that holds it.
    #[inline]
    fn locate(&self, hash: u32) -> (Placement, BucketRef<'_>) {
        if let Some(old) = self.old.as_deref() {
            let index = (hash & hashmask(self.hash_power - 1)) as usize;
            if index >= self.expand_bucket() {
                return (Placement::Old, BucketRef { array: old, index });
            }
        }
        (
            Placement::Primary,
            self.primary_bucket((hash & hashmask(self.hash_power)) as usize),
        )
    }

    /// Which array serves `hash`, and the bucket index within it.
    #[inline]
    pub fn placement(&self, hash: u32) -> (Placement, usize) {
        let (placement, bucket) = self.locate(hash);
        (placement, bucket.index)
    }

    /// The authoritative bucket for `hash`.
    #[inline]
    pub fn bucket(&self, hash: u32) -> BucketRef<'_> {
        self.locate(hash).1
    }

    /// The primary bucket at `index`, ignoring migration state.
    #[inline]
    pub fn primary_bucket(&self, index: usize) -> BucketRef<'_> {
        BucketRef {
            array: &self.primary,
            index,
        }
    }

    /// The old bucket at `index`, if expanding.
    #[inline]
    pub fn old_bucket(&self, index: usize) -> Option<BucketRef<'_>> {
        self.old.as_deref().map(|array| BucketRef { array, index })
    }
}
