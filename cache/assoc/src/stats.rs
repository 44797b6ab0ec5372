//! Hashtable statistics.
//!
//! [`HashStatsState`] is the state block a stats reporter reads; it has its
//! own lock and is never touched under the maintenance lock's protection
//! alone. The same values are mirrored into process-wide metrics for
//! Prometheus exposition.

use metriken::{Counter, Gauge, metric};
use parking_lot::Mutex;

/// Current hash power.
#[metric(
    name = "hash_power_level",
    description = "Current hash power of the primary key index"
)]
pub static HASH_POWER_LEVEL: Gauge = Gauge::new();

/// Bytes held by bucket arrays.
#[metric(
    name = "hash_bytes",
    description = "Bytes held by primary key index bucket arrays"
)]
pub static HASH_BYTES: Gauge = Gauge::new();

/// Whether an expansion is migrating.
#[metric(
    name = "hash_is_expanding",
    description = "1 while the primary key index is migrating to a larger table"
)]
pub static HASH_IS_EXPANDING: Gauge = Gauge::new();

/// Expansions started.
#[metric(
    name = "hash_expansions",
    description = "Hashtable expansions started"
)]
pub static HASH_EXPANSIONS: Counter = Counter::new();

/// Expansions that failed to allocate.
#[metric(
    name = "hash_expansion_failures",
    description = "Hashtable expansions abandoned because allocation failed"
)]
pub static HASH_EXPANSION_FAILURES: Counter = Counter::new();

/// Buckets migrated.
#[metric(
    name = "hash_migrated_buckets",
    description = "Old buckets migrated into the primary array"
)]
pub static HASH_MIGRATED_BUCKETS: Counter = Counter::new();

/// Migration steps deferred on a busy bucket.
#[metric(
    name = "hash_migration_deferrals",
    description = "Migration steps deferred because the bucket lock was busy"
)]
pub static HASH_MIGRATION_DEFERRALS: Counter = Counter::new();

/// Snapshot of hashtable state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashStats {
    /// Current hash power.
    pub hash_power_level: u8,
    /// Bytes held by bucket arrays, including the old array while expanding.
    pub hash_bytes: u64,
    /// Whether an expansion is migrating.
    pub hash_is_expanding: bool,
}

/// Shared stats block, updated by the index under its own lock.
#[derive(Debug, Default)]
pub struct HashStatsState {
    inner: Mutex<HashStats>,
}

impl HashStatsState {
    /// Create an empty stats block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy out the current values.
    pub fn snapshot(&self) -> HashStats {
        *self.inner.lock()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut HashStats)) {
        let stats = {
            let mut stats = self.inner.lock();
            f(&mut stats);
            *stats
        };

        HASH_POWER_LEVEL.set(stats.hash_power_level as i64);
        HASH_BYTES.set(stats.hash_bytes as i64);
        HASH_IS_EXPANDING.set(stats.hash_is_expanding as i64);
    }
}
