//! Table expansion and the background maintenance thread.
//!
//! Expansion is a two-phase process:
//!
//! 1. **Swap**: with foreground threads paused, the current primary array
//!    becomes the old array and a freshly allocated array of twice the size
//!    becomes the primary. This is the only moment array identity changes.
//! 2. **Migrate**: one old bucket at a time, under that bucket's lock, every
//!    entry is relinked into its bucket under the wider mask and the
//!    migration cursor advances. Foreground operations keep running; the
//!    cursor tells them which array holds their key.
//!
//! When the cursor reaches the end of the old array, the old array is
//! released and the table is stable again.

use crate::buckets::{BucketArray, Buckets, SLOT_SIZE, hashmask, hashsize};
use crate::config::{Config, bulk_move_from_env};
use crate::entry::EntryStore;
use crate::error::{AssocError, AssocResult};
use crate::iter::AssocIter;
use crate::locks::BucketLocks;
use crate::stats::{
    HASH_EXPANSION_FAILURES, HASH_EXPANSIONS, HASH_MIGRATED_BUCKETS, HASH_MIGRATION_DEFERRALS,
};
use crate::sync::{Ordering, backoff};
use crate::table::AssocTable;
use parking_lot::MutexGuard;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long a migration step waits before retrying a busy bucket.
pub const MIGRATION_BACKOFF: Duration = Duration::from_millis(10);

/// Name of the maintenance thread.
pub const THREAD_NAME: &str = "assoc-maint";

/// Coordinates a brief pause of foreground threads.
///
/// Called around publishing the doubled table at the start of an expansion.
/// The new snapshot is stored between `pause` and `resume`; foreground
/// threads that loaded the previous snapshot keep reaching the same chains,
/// so the table itself never waits on them.
pub trait Quiesce: Send + Sync {
    /// Pause all foreground threads. Returns once they are paused.
    fn pause(&self);

    /// Let paused threads continue.
    fn resume(&self);
}

/// A coordinator that pauses nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoQuiesce;

impl Quiesce for NoQuiesce {
    fn pause(&self) {}

    fn resume(&self) {}
}

/// State protected by the maintenance lock.
#[derive(Debug, Default)]
pub(crate) struct MaintenanceState {
    /// Set by a load-factor trigger, cleared when the expansion starts.
    pub expand_requested: bool,
}

/// Outcome of a single migration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateStatus {
    /// No expansion is in progress.
    Idle,
    /// One bucket was migrated and more remain.
    Migrated,
    /// The next bucket's lock was held by someone else; nothing moved.
    Busy,
    /// The last bucket was migrated and the old array released.
    Complete,
}

/// Exclusive access to table maintenance.
///
/// Holding this handle keeps the maintenance thread, iterators and other
/// maintainers out. It is the only way to start or advance an expansion.
pub struct Maintenance<'a, S: EntryStore, L: BucketLocks> {
    pub(crate) table: &'a AssocTable<S, L>,
    guard: MutexGuard<'a, MaintenanceState>,
}

impl<'a, S: EntryStore, L: BucketLocks> Maintenance<'a, S, L> {
    pub(crate) fn new(
        table: &'a AssocTable<S, L>,
        guard: MutexGuard<'a, MaintenanceState>,
    ) -> Self {
        Self { table, guard }
    }

    /// Whether an expansion is migrating.
    pub fn is_expanding(&self) -> bool {
        self.table.buckets.load().is_expanding()
    }

    /// Whether a load-factor trigger is waiting to be served.
    pub fn expand_requested(&self) -> bool {
        self.guard.expand_requested
    }

    /// Start an expansion: double the primary array and begin migrating.
    ///
    /// On allocation failure the table is left exactly as it was and keeps
    /// serving at its current size.
    pub fn expand(&mut self) -> AssocResult<()> {
        let table = self.table;
        // a failed attempt waits for the next trigger rather than retrying
        self.guard.expand_requested = false;

        let current = table.buckets.load_full();
        if current.is_expanding() {
            return Err(AssocError::AlreadyExpanding);
        }
        let (power, bytes) = (current.hash_power, current.bytes());
        if power >= table.config.hash_power_max {
            return Err(AssocError::MaxHashPower { power });
        }

        let new_power = power + 1;
        let primary = match Self::allocate(table.config.hash_bytes_limit, bytes, new_power) {
            Ok(primary) => primary,
            Err(e) => {
                HASH_EXPANSION_FAILURES.increment();
                tracing::warn!(
                    error = %e,
                    hash_power = power,
                    "hash table expansion failed, continuing at current size"
                );
                return Err(e);
            }
        };
        let added = primary.bytes();

        // the current primary becomes the old array, cursor at 0
        let next = Buckets::expanding(Arc::new(primary), current.primary.clone(), new_power);
        table.quiesce.pause();
        table.buckets.store(Arc::new(next));
        table.quiesce.resume();

        table.stats.update(|stats| {
            stats.hash_power_level = new_power;
            stats.hash_bytes += added as u64;
            stats.hash_is_expanding = true;
        });
        HASH_EXPANSIONS.increment();
        tracing::info!(hash_power = new_power, "hash table expansion starting");

        Ok(())
    }

    fn allocate(limit: Option<usize>, held: usize, power: u8) -> AssocResult<BucketArray> {
        if let Some(limit) = limit
            && held + hashsize(power) * SLOT_SIZE > limit
        {
            return Err(AssocError::AllocationFailed {
                buckets: hashsize(power),
            });
        }
        BucketArray::allocate(power)
    }

    /// Migrate the bucket at the migration cursor.
    ///
    /// Never blocks on a bucket lock: if the bucket is busy, returns
    /// [`MigrateStatus::Busy`] and the caller retries later.
    pub fn migrate_bucket(&mut self) -> MigrateStatus {
        let table = self.table;
        let done = {
            let buckets = table.buckets.load();
            let Some(old) = buckets.old.as_deref() else {
                return MigrateStatus::Idle;
            };
            // only the maintenance lock holder moves the cursor
            let bucket = buckets.expand_bucket.load(Ordering::Relaxed);

            // lock shards are keyed by the low bits, which the old index keeps
            let Some(_guard) = table.locks.try_lock(bucket as u32) else {
                HASH_MIGRATION_DEFERRALS.increment();
                tracing::trace!(bucket, "bucket busy, deferring migration");
                return MigrateStatus::Busy;
            };

            let mask = hashmask(buckets.hash_power);
            let mut it = old.head(bucket);
            while let Some(id) = it {
                it = table.store.next(id);
                let dest = buckets.primary_bucket((table.store.hash(id) & mask) as usize);
                table.store.set_next(id, dest.head());
                dest.set_head(Some(id));
            }
            old.set_head(bucket, None);

            let next = bucket + 1;
            buckets.expand_bucket.store(next, Ordering::Release);
            HASH_MIGRATED_BUCKETS.increment();
            next == old.len()
        };

        if done {
            self.finish_expansion();
            MigrateStatus::Complete
        } else {
            MigrateStatus::Migrated
        }
    }

    fn finish_expansion(&mut self) {
        let table = self.table;
        let current = table.buckets.load_full();
        let power = current.hash_power;
        let released = current.old.as_deref().map_or(0, BucketArray::bytes);

        // every old bucket is empty; the array is freed with the last
        // snapshot that still refers to it
        table
            .buckets
            .store(Arc::new(Buckets::new(current.primary.clone(), power)));
        drop(current);

        table.stats.update(|stats| {
            stats.hash_bytes -= released as u64;
            stats.hash_is_expanding = false;
        });
        tracing::info!(hash_power = power, "hash table expansion done");
    }

    /// Migrate up to `max_buckets` buckets.
    ///
    /// Stops early when the expansion completes or a bucket is busy.
    pub fn migrate(&mut self, max_buckets: usize) -> MigrateStatus {
        let mut status = MigrateStatus::Idle;
        for _ in 0..max_buckets {
            status = self.migrate_bucket();
            if status != MigrateStatus::Migrated {
                break;
            }
        }
        status
    }

    /// Migrate until no expansion is in progress, backing off on busy
    /// buckets.
    pub fn finish_migration(&mut self) {
        loop {
            match self.migrate_bucket() {
                MigrateStatus::Idle | MigrateStatus::Complete => return,
                MigrateStatus::Migrated => {}
                MigrateStatus::Busy => backoff(MIGRATION_BACKOFF),
            }
        }
    }

    /// Iterate over every linked entry, keeping the maintenance lock.
    pub fn iter(self) -> AssocIter<'a, S, L> {
        AssocIter::new(self)
    }

    /// Block until an expansion is requested or the thread is told to stop.
    ///
    /// Returns `true` if an expansion should start.
    fn wait_for_request(&mut self) -> bool {
        let table = self.table;
        while !self.guard.expand_requested && table.running.load(Ordering::Acquire) {
            table.maintenance_cond.wait(&mut self.guard);
        }
        table.running.load(Ordering::Acquire) && self.guard.expand_requested
    }
}

/// Handle to a running maintenance thread.
///
/// Dropping the handle stops the thread and waits for it to exit.
pub struct MaintenanceHandle<S, L>
where
    S: EntryStore + 'static,
    L: BucketLocks + 'static,
{
    table: Arc<AssocTable<S, L>>,
    bulk_move: usize,
    join: Option<JoinHandle<()>>,
}

impl<S, L> MaintenanceHandle<S, L>
where
    S: EntryStore + 'static,
    L: BucketLocks + 'static,
{
    /// Spawn the maintenance thread for `table`.
    ///
    /// The migration batch size comes from the config unless overridden by
    /// the `ASSOC_HASH_BULK_MOVE` environment variable.
    pub fn start(table: Arc<AssocTable<S, L>>) -> AssocResult<Self> {
        if table.running.swap(true, Ordering::AcqRel) {
            return Err(AssocError::MaintenanceRunning);
        }

        let bulk_move = resolve_bulk_move(bulk_move_from_env(), &table.config);
        let worker = table.clone();
        let join = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || run(&worker, bulk_move));

        match join {
            Ok(join) => Ok(Self {
                table,
                bulk_move,
                join: Some(join),
            }),
            Err(e) => {
                table.running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// The table being maintained.
    pub fn table(&self) -> &Arc<AssocTable<S, L>> {
        &self.table
    }

    /// Buckets the thread migrates per scheduling quantum.
    pub fn bulk_move(&self) -> usize {
        self.bulk_move
    }

    /// Stop the thread and wait for it to exit.
    ///
    /// A migration in progress is abandoned between buckets; the table stays
    /// consistent and a later maintainer picks it up.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };

        self.table.running.store(false, Ordering::Release);
        {
            let _state = self.table.maintenance.lock();
            self.table.maintenance_cond.notify_one();
        }

        if join.join().is_err() {
            tracing::error!("maintenance thread panicked");
        }
    }
}

impl<S, L> Drop for MaintenanceHandle<S, L>
where
    S: EntryStore + 'static,
    L: BucketLocks + 'static,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The environment override wins over the config.
fn resolve_bulk_move(env: Option<usize>, config: &Config) -> usize {
    env.unwrap_or_else(|| config.effective_bulk_move())
}

fn run<S: EntryStore, L: BucketLocks>(table: &AssocTable<S, L>, bulk_move: usize) {
    let mut maintenance = table.maintenance();
    tracing::debug!(bulk_move, "maintenance thread started");

    while table.running.load(Ordering::Acquire) {
        for _ in 0..bulk_move {
            match maintenance.migrate_bucket() {
                MigrateStatus::Idle | MigrateStatus::Complete => break,
                MigrateStatus::Migrated => {}
                MigrateStatus::Busy => backoff(MIGRATION_BACKOFF),
            }
        }

        if maintenance.is_expanding() {
            thread::yield_now();
            continue;
        }

        if !maintenance.wait_for_request() {
            continue;
        }

        match maintenance.expand() {
            Ok(()) => {}
            // already logged
            Err(AssocError::AllocationFailed { .. }) => {}
            Err(e) => tracing::debug!(error = %e, "hash table expansion skipped"),
        }
    }

    tracing::debug!("maintenance thread stopped");
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::entry::{EntryArena, EntryId, hash};
    use parking_lot::Mutex;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Instant;

    fn filled(power: u8, count: usize) -> (AssocTable<EntryArena>, Vec<(Vec<u8>, EntryId)>) {
        let config = Config::new().with_hash_power(power);
        let table = AssocTable::new(config, EntryArena::with_capacity(count)).unwrap();
        let mut keys = Vec::with_capacity(count);
        for i in 0..count {
            let key = format!("key:{i}").into_bytes();
            let hv = hash(&key);
            let id = table.store().alloc(&key, hv).unwrap();
            let _guard = table.lock(hv);
            table.insert(id, hv);
            keys.push((key, id));
        }
        (table, keys)
    }

    #[test]
    fn test_expand_swaps_tables() {
        let (table, keys) = filled(4, 20);
        let mut maintenance = table.maintenance();
        maintenance.expand().unwrap();

        assert!(maintenance.is_expanding());
        let stats = table.stats();
        assert_eq!(stats.hash_power_level, 5);
        assert_eq!(stats.hash_bytes, (32 + 16) * SLOT_SIZE as u64);
        assert!(stats.hash_is_expanding);

        // nothing migrated yet: every key is still in the old array
        for (key, id) in &keys {
            let hv = hash(key);
            assert_eq!(table.find(key, hv), Some(*id));
            assert_eq!(table.residency(key, hv), (true, false));
        }
    }

    #[test]
    fn test_expand_refused_while_expanding() {
        let (table, _) = filled(4, 1);
        let mut maintenance = table.maintenance();
        maintenance.expand().unwrap();
        assert!(matches!(
            maintenance.expand(),
            Err(AssocError::AlreadyExpanding)
        ));
    }

    #[test]
    fn test_expand_refused_at_max_power() {
        let config = Config::new().with_hash_power(4).with_hash_power_max(4);
        let table = AssocTable::new(config, EntryArena::with_capacity(1)).unwrap();
        assert!(matches!(
            table.maintenance().expand(),
            Err(AssocError::MaxHashPower { power: 4 })
        ));
    }

    #[test]
    fn test_migrate_to_completion() {
        let (table, keys) = filled(4, 40);
        let mut maintenance = table.maintenance();
        maintenance.expand().unwrap();

        let mut steps = 0;
        loop {
            match maintenance.migrate_bucket() {
                MigrateStatus::Migrated => steps += 1,
                MigrateStatus::Complete => break,
                status => panic!("unexpected {status:?}"),
            }
        }
        assert_eq!(steps, 15);
        assert_eq!(maintenance.migrate_bucket(), MigrateStatus::Idle);
        drop(maintenance);

        assert!(!table.is_expanding());
        assert_eq!(table.hash_power(), 5);
        let stats = table.stats();
        assert_eq!(stats.hash_bytes, 32 * SLOT_SIZE as u64);
        assert!(!stats.hash_is_expanding);

        for (key, id) in &keys {
            let hv = hash(key);
            assert_eq!(table.find(key, hv), Some(*id));
            assert_eq!(table.residency(key, hv), (false, true));
        }
    }

    #[test]
    fn test_migrate_batch() {
        let (table, _) = filled(4, 8);
        let mut maintenance = table.maintenance();
        maintenance.expand().unwrap();
        assert_eq!(maintenance.migrate(4), MigrateStatus::Migrated);
        assert_eq!(table.expand_bucket(), 4);
        assert_eq!(maintenance.migrate(100), MigrateStatus::Complete);
        assert!(!maintenance.is_expanding());
    }

    #[test]
    fn test_busy_bucket_defers() {
        let (table, _) = filled(4, 8);
        let mut maintenance = table.maintenance();
        maintenance.expand().unwrap();

        let guard = table.lock(0);
        assert_eq!(maintenance.migrate_bucket(), MigrateStatus::Busy);
        assert_eq!(table.expand_bucket(), 0);
        drop(guard);

        assert_eq!(maintenance.migrate_bucket(), MigrateStatus::Migrated);
        assert_eq!(table.expand_bucket(), 1);
    }

    #[test]
    fn test_allocation_failure_leaves_table_unchanged() {
        let config = Config::new()
            .with_hash_power(4)
            .with_hash_bytes_limit(16 * SLOT_SIZE);
        let table = AssocTable::new(config, EntryArena::with_capacity(4)).unwrap();
        let before = table.stats();

        let result = table.maintenance().expand();
        assert!(matches!(
            result,
            Err(AssocError::AllocationFailed { buckets: 32 })
        ));
        assert_eq!(table.hash_power(), 4);
        assert!(!table.is_expanding());
        assert_eq!(table.stats(), before);
    }

    #[derive(Default)]
    struct CountingQuiesce {
        paused: Arc<AtomicUsize>,
        resumed: Arc<AtomicUsize>,
    }

    impl Quiesce for CountingQuiesce {
        fn pause(&self) {
            self.paused.fetch_add(1, Ordering::SeqCst);
        }

        fn resume(&self) {
            self.resumed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_quiesce_around_swap() {
        let quiesce = CountingQuiesce::default();
        let paused = quiesce.paused.clone();
        let resumed = quiesce.resumed.clone();

        let config = Config::new().with_hash_power(4);
        let table = AssocTable::new(config, EntryArena::with_capacity(1))
            .unwrap()
            .with_quiesce(quiesce);

        table.maintenance().expand().unwrap();
        assert_eq!(paused.load(Ordering::SeqCst), 1);
        assert_eq!(resumed.load(Ordering::SeqCst), 1);

        // migration never pauses foreground threads
        table.maintenance().finish_migration();
        assert_eq!(paused.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_thread_start_stop() {
        let config = Config::new().with_hash_power(4);
        let table = Arc::new(AssocTable::new(config, EntryArena::with_capacity(1)).unwrap());

        let handle = MaintenanceHandle::start(table.clone()).unwrap();
        assert!(matches!(
            MaintenanceHandle::start(table.clone()),
            Err(AssocError::MaintenanceRunning)
        ));
        handle.stop();

        // restartable once stopped
        let handle = MaintenanceHandle::start(table).unwrap();
        drop(handle);
    }

    #[test]
    fn test_env_overrides_bulk_move() {
        let config = Config::new().with_bulk_move(3);
        assert_eq!(resolve_bulk_move(None, &config), 3);
        assert_eq!(resolve_bulk_move(Some(8), &config), 8);
        // zero and garbage parse to the default before they get here
        let parsed = Some(crate::config::parse_bulk_move("0"));
        assert_eq!(resolve_bulk_move(parsed, &config), 1);
        assert_eq!(resolve_bulk_move(None, &Config::new().with_bulk_move(0)), 1);
    }

    /// Records which thread published the expanded table.
    #[derive(Default)]
    struct ThreadNameQuiesce {
        name: Arc<Mutex<Option<String>>>,
    }

    impl Quiesce for ThreadNameQuiesce {
        fn pause(&self) {
            *self.name.lock() = thread::current().name().map(str::to_string);
        }

        fn resume(&self) {}
    }

    #[test]
    fn test_thread_is_named() {
        let quiesce = ThreadNameQuiesce::default();
        let name = quiesce.name.clone();

        let config = Config::new().with_hash_power(4);
        let table = Arc::new(
            AssocTable::new(config, EntryArena::with_capacity(1))
                .unwrap()
                .with_quiesce(quiesce),
        );
        let handle = MaintenanceHandle::start(table.clone()).unwrap();
        assert_eq!(
            handle.bulk_move(),
            resolve_bulk_move(bulk_move_from_env(), table.config())
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while name.lock().is_none() && Instant::now() < deadline {
            table.start_expand(1_000);
            thread::sleep(Duration::from_millis(1));
        }
        handle.stop();

        assert_eq!(name.lock().as_deref(), Some(THREAD_NAME));
        assert_eq!(THREAD_NAME, "assoc-maint");
    }

    /// Entry store whose next key comparison parks until released.
    struct GatedStore {
        arena: EntryArena,
        armed: AtomicBool,
        entered: Barrier,
        release: Barrier,
    }

    impl GatedStore {
        fn new(capacity: usize) -> Self {
            Self {
                arena: EntryArena::with_capacity(capacity),
                armed: AtomicBool::new(false),
                entered: Barrier::new(2),
                release: Barrier::new(2),
            }
        }
    }

    impl EntryStore for GatedStore {
        fn hash(&self, id: EntryId) -> u32 {
            self.arena.hash(id)
        }

        fn key_matches(&self, id: EntryId, key: &[u8]) -> bool {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.wait();
                self.release.wait();
            }
            self.arena.key_matches(id, key)
        }

        fn next(&self, id: EntryId) -> Option<EntryId> {
            self.arena.next(id)
        }

        fn set_next(&self, id: EntryId, next: Option<EntryId>) {
            self.arena.set_next(id, next)
        }
    }

    #[test]
    fn test_expand_does_not_wait_for_lookups() {
        let config = Config::new().with_hash_power(4);
        let table = Arc::new(AssocTable::new(config, GatedStore::new(32)).unwrap());

        let mut keys = Vec::new();
        for i in 0..20 {
            let key = format!("key:{i}").into_bytes();
            let hv = hash(&key);
            let id = table.store().arena.alloc(&key, hv).unwrap();
            let _guard = table.lock(hv);
            table.insert(id, hv);
            keys.push((key, hv, id));
        }

        // park a lookup inside find, holding its bucket lock
        let (parked_key, parked_hv, parked_id) = keys[0].clone();
        table.store().armed.store(true, Ordering::SeqCst);
        let reader = {
            let table = table.clone();
            thread::spawn(move || {
                let _guard = table.lock(parked_hv);
                table.find(&parked_key, parked_hv)
            })
        };
        table.store().entered.wait();

        // the swap completes while the lookup is in flight
        let mut maintenance = table.maintenance();
        maintenance.expand().unwrap();
        assert!(maintenance.is_expanding());
        assert_eq!(table.hash_power(), 5);

        // lookups on other lock shards proceed against the new snapshot
        let shard_mask = table.locks().count() as u32 - 1;
        for (key, hv, id) in &keys {
            if hv & shard_mask != parked_hv & shard_mask {
                let _guard = table.lock(*hv);
                assert_eq!(table.find(key, *hv), Some(*id));
            }
        }

        // the stale lookup still resolves through the previous snapshot
        table.store().release.wait();
        assert_eq!(reader.join().unwrap(), Some(parked_id));

        maintenance.finish_migration();
        drop(maintenance);
        for (key, hv, id) in &keys {
            let _guard = table.lock(*hv);
            assert_eq!(table.find(key, *hv), Some(*id));
        }
    }
}
