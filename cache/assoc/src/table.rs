//! The index aggregate and its chain operations.

use crate::buckets::{BucketArray, Buckets, Placement, SLOT_SIZE, hashmask, hashsize};
use crate::config::Config;
use crate::entry::{EntryId, EntryStore};
use crate::error::{AssocError, AssocResult};
use crate::iter::AssocIter;
use crate::locks::{BucketLocks, ItemLocks};
use crate::maintenance::{Maintenance, MaintenanceState, NoQuiesce, Quiesce};
use crate::stats::{HashStats, HashStatsState};
use crate::sync::AtomicBool;
use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Primary key index: hashed keys to entry handles, with incremental resize.
///
/// # Locking protocol
///
/// The table does not lock buckets itself. Before calling [`find`],
/// [`insert`] or [`delete`] the caller must hold the bucket lock for the
/// key's hash (see [`lock`]). The maintenance thread migrates buckets under
/// the same locks, so a caller never observes a chain mid-move.
///
/// Foreground operations take no lock of their own. They read the current
/// table snapshot through an atomic pointer load; only the maintenance lock
/// holder publishes a new snapshot.
///
/// [`find`]: AssocTable::find
/// [`insert`]: AssocTable::insert
/// [`delete`]: AssocTable::delete
/// [`lock`]: AssocTable::lock
pub struct AssocTable<S: EntryStore, L: BucketLocks = ItemLocks> {
    pub(crate) config: Config,
    pub(crate) store: S,
    pub(crate) locks: L,
    pub(crate) buckets: ArcSwap<Buckets>,
    pub(crate) maintenance: Mutex<MaintenanceState>,
    pub(crate) maintenance_cond: Condvar,
    pub(crate) running: AtomicBool,
    pub(crate) quiesce: Box<dyn Quiesce>,
    pub(crate) stats: Arc<HashStatsState>,
}

impl<S: EntryStore> AssocTable<S, ItemLocks> {
    /// Create a table with [`ItemLocks`] sized from the config.
    pub fn new(config: Config, store: S) -> AssocResult<Self> {
        let locks = ItemLocks::new(config.effective_lock_power());
        Self::try_new(config, store, locks)
    }
}

impl<S: EntryStore, L: BucketLocks> AssocTable<S, L> {
    /// Create a table, exiting the process if it cannot be allocated.
    ///
    /// Without an initial table there is no degraded mode to fall back to.
    pub fn init(config: Config, store: S, locks: L) -> Self {
        match Self::try_new(config, store, locks) {
            Ok(table) => table,
            Err(e) => {
                tracing::error!(error = %e, "failed to init hashtable");
                eprintln!("Failed to init hashtable: {e}");
                std::process::exit(1);
            }
        }
    }

    /// Create a table.
    pub fn try_new(config: Config, store: S, locks: L) -> AssocResult<Self> {
        config.validate()?;
        let power = config.initial_power();

        let lock_count = locks.count();
        if !lock_count.is_power_of_two() || lock_count > hashsize(power) {
            return Err(AssocError::InvalidConfig {
                reason: format!(
                    "lock count must be a power of two no larger than {} buckets, got {}",
                    hashsize(power),
                    lock_count
                ),
            });
        }

        if let Some(limit) = config.hash_bytes_limit
            && hashsize(power) * SLOT_SIZE > limit
        {
            return Err(AssocError::AllocationFailed {
                buckets: hashsize(power),
            });
        }

        let primary = BucketArray::allocate(power)?;
        let stats = Arc::new(HashStatsState::new());
        stats.update(|stats| {
            stats.hash_power_level = power;
            stats.hash_bytes = primary.bytes() as u64;
            stats.hash_is_expanding = false;
        });

        tracing::debug!(
            hash_power = power,
            locks = lock_count,
            "hashtable initialized"
        );

        Ok(Self {
            config,
            store,
            locks,
            buckets: ArcSwap::from_pointee(Buckets::new(Arc::new(primary), power)),
            maintenance: Mutex::new(MaintenanceState::default()),
            maintenance_cond: Condvar::new(),
            running: AtomicBool::new(false),
            quiesce: Box::new(NoQuiesce),
            stats,
        })
    }

    /// Use a thread coordinator to pause foreground threads while the
    /// table is swapped at the start of an expansion.
    pub fn with_quiesce(mut self, quiesce: impl Quiesce + 'static) -> Self {
        self.quiesce = Box::new(quiesce);
        self
    }

    /// Publish stats into a caller-owned state block.
    pub fn with_stats_state(mut self, state: Arc<HashStatsState>) -> Self {
        let current = self.stats.snapshot();
        state.update(|stats| *stats = current);
        self.stats = state;
        self
    }

    /// The configuration the table was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The entry store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The bucket lock facility.
    pub fn locks(&self) -> &L {
        &self.locks
    }

    /// Take the bucket lock covering `hash`.
    #[inline]
    pub fn lock(&self, hash: u32) -> L::Guard<'_> {
        self.locks.lock(hash)
    }

    /// Find the entry with `key`.
    ///
    /// The caller must hold the bucket lock for `hash`.
    pub fn find(&self, key: &[u8], hash: u32) -> Option<EntryId> {
        let buckets = self.buckets.load();
        let mut it = buckets.bucket(hash).head();
        while let Some(id) = it {
            if self.store.key_matches(id, key) {
                return Some(id);
            }
            it = self.store.next(id);
        }
        None
    }

    /// Link an entry at the head of its bucket's chain.
    ///
    /// The caller must hold the bucket lock for `hash` and must have checked
    /// that no entry with the same key is linked.
    pub fn insert(&self, id: EntryId, hash: u32) {
        let buckets = self.buckets.load();
        let bucket = buckets.bucket(hash);
        self.store.set_next(id, bucket.head());
        bucket.set_head(Some(id));
    }

    /// Unlink the entry with `key` and return it.
    ///
    /// Returns `None` if no such entry is linked, which means the caller did
    /// not find the key first. The caller must hold the bucket lock for
    /// `hash`.
    #[must_use = "an unlinked entry should be returned to its store"]
    pub fn delete(&self, key: &[u8], hash: u32) -> Option<EntryId> {
        let buckets = self.buckets.load();
        let bucket = buckets.bucket(hash);

        let mut prev: Option<EntryId> = None;
        let mut it = bucket.head();
        while let Some(id) = it {
            if self.store.key_matches(id, key) {
                let next = self.store.next(id);
                match prev {
                    Some(prev) => self.store.set_next(prev, next),
                    None => bucket.set_head(next),
                }
                self.store.set_next(id, None);
                return Some(id);
            }
            prev = it;
            it = self.store.next(id);
        }
        None
    }

    /// Report the live entry count, requesting an expansion if the table is
    /// over 1.5x loaded.
    ///
    /// Never blocks: if maintenance is busy (migrating, or an iterator is
    /// open) the report is dropped and a later one will retry. Returns
    /// whether an expansion was requested.
    pub fn start_expand(&self, curr_items: u64) -> bool {
        let Some(mut state) = self.maintenance.try_lock() else {
            return false;
        };

        let power = self.buckets.load().hash_power;
        if curr_items > (hashsize(power) as u64 * 3) / 2 && power < self.config.hash_power_max {
            state.expand_requested = true;
            self.maintenance_cond.notify_one();
            true
        } else {
            false
        }
    }

    /// Take the maintenance lock.
    ///
    /// Blocks while the maintenance thread is migrating or an iterator is
    /// open. Holding the returned handle keeps the table from starting an
    /// expansion.
    pub fn maintenance(&self) -> Maintenance<'_, S, L> {
        Maintenance::new(self, self.maintenance.lock())
    }

    /// Iterate over every linked entry.
    ///
    /// Holds the maintenance lock until dropped, so no expansion starts
    /// while iterating. An expansion left unfinished by a stopped
    /// maintenance thread is completed first. The caller must not hold any
    /// bucket lock when calling this or while advancing the iterator.
    pub fn iter(&self) -> AssocIter<'_, S, L> {
        self.maintenance().iter()
    }

    /// Current hash power.
    pub fn hash_power(&self) -> u8 {
        self.buckets.load().hash_power
    }

    /// Number of buckets in the primary array.
    pub fn capacity(&self) -> usize {
        hashsize(self.hash_power())
    }

    /// Whether an expansion is migrating.
    pub fn is_expanding(&self) -> bool {
        self.buckets.load().is_expanding()
    }

    /// The migration cursor: old buckets below it have been moved.
    pub fn expand_bucket(&self) -> usize {
        self.buckets.load().expand_bucket()
    }

    /// Which array currently serves `hash`, and the bucket within it.
    pub fn placement(&self, hash: u32) -> (Placement, usize) {
        self.buckets.load().placement(hash)
    }

    /// Look for `key` in both arrays, regardless of the migration cursor.
    ///
    /// Returns whether it is linked in the old and in the primary array.
    /// Diagnostic; the caller must hold the bucket lock for `hash`.
    pub fn residency(&self, key: &[u8], hash: u32) -> (bool, bool) {
        let buckets = self.buckets.load();
        let in_chain = |mut it: Option<EntryId>| {
            while let Some(id) = it {
                if self.store.key_matches(id, key) {
                    return true;
                }
                it = self.store.next(id);
            }
            false
        };

        let in_old = buckets
            .hash_power
            .checked_sub(1)
            .and_then(|power| buckets.old_bucket((hash & hashmask(power)) as usize))
            .is_some_and(|bucket| in_chain(bucket.head()));
        let in_primary = in_chain(
            buckets
                .primary_bucket((hash & hashmask(buckets.hash_power)) as usize)
                .head(),
        );

        (in_old, in_primary)
    }

    /// Current stats.
    pub fn stats(&self) -> HashStats {
        self.stats.snapshot()
    }

    /// The shared stats block.
    pub fn stats_state(&self) -> Arc<HashStatsState> {
        self.stats.clone()
    }
}
