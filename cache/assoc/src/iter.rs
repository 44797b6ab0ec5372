//! Full-table iteration.

use crate::entry::{EntryId, EntryStore};
use crate::locks::BucketLocks;
use crate::maintenance::Maintenance;

/// One pass over every linked entry.
///
/// Buckets are visited in ascending order and each chain from its head
/// (most recently inserted first). The iterator keeps the maintenance lock
/// for its whole life, so the primary array cannot be replaced underneath
/// it, and holds the lock of the bucket it is currently walking.
///
/// Because the successor of each returned entry is recorded before the
/// entry is handed out, the caller may `delete` the entry it was just given
/// without taking any lock: the iterator already holds it.
pub struct AssocIter<'a, S: EntryStore + 'a, L: BucketLocks + 'a> {
    // field order matters: the bucket lock is released before maintenance
    bucket_guard: Option<L::Guard<'a>>,
    maintenance: Maintenance<'a, S, L>,
    bucket: usize,
    buckets: usize,
    next: Option<EntryId>,
}

impl<'a, S: EntryStore, L: BucketLocks> AssocIter<'a, S, L> {
    pub(crate) fn new(mut maintenance: Maintenance<'a, S, L>) -> Self {
        // only the primary array is walked, so no migration may be pending
        maintenance.finish_migration();
        let buckets = maintenance.table.buckets.load().primary.len();

        Self {
            bucket_guard: None,
            maintenance,
            bucket: 0,
            buckets,
            next: None,
        }
    }

    /// Index of the bucket being walked.
    pub fn bucket(&self) -> usize {
        self.bucket
    }

    /// Whether the iterator currently holds a bucket lock.
    pub fn is_bucket_locked(&self) -> bool {
        self.bucket_guard.is_some()
    }

    /// Release all locks.
    pub fn close(self) {}
}

impl<S: EntryStore, L: BucketLocks> Iterator for AssocIter<'_, S, L> {
    type Item = EntryId;

    fn next(&mut self) -> Option<EntryId> {
        let table = self.maintenance.table;

        loop {
            if self.bucket_guard.is_some() {
                if let Some(id) = self.next {
                    self.next = table.store.next(id);
                    return Some(id);
                }
                self.bucket_guard = None;
                self.bucket += 1;
            }

            if self.bucket >= self.buckets {
                return None;
            }

            let guard = table.locks.lock(self.bucket as u32);
            let head = table.buckets.load().primary_bucket(self.bucket).head();
            match head {
                Some(id) => {
                    self.next = table.store.next(id);
                    self.bucket_guard = Some(guard);
                    return Some(id);
                }
                None => {
                    drop(guard);
                    self.bucket += 1;
                }
            }
        }
    }
}
