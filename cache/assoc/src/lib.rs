//! assoc: the primary key index of the cache server.
//!
//! Maps hashed keys to entry handles using separate chaining over a
//! power-of-two bucket array. When the load factor passes 1.5 the table
//! doubles, and a background maintenance thread migrates the old buckets
//! one at a time while foreground threads keep serving lookups.
//!
//! - **Table**: [`AssocTable`] with `find`, `insert`, `delete` and the
//!   load-factor trigger [`AssocTable::start_expand`]
//! - **Entries**: [`EntryId`] handles resolved through an [`EntryStore`]
//! - **Locking**: callers hold a [`BucketLocks`] lock around every chain
//!   operation; migration takes the same locks without blocking
//! - **Maintenance**: [`Maintenance`] and the [`MaintenanceHandle`] thread
//! - **Iteration**: [`AssocIter`] walks every entry with expansion paused
//!
//! # Architecture
//!
//! ```text
//!        find / insert / delete               start_expand(items)
//!    (caller holds bucket lock)                      |
//!                 |                                  | notify
//!                 v                                  v
//!    +------------------------+        +---------------------------+
//!    |  addressing by cursor  |        |    maintenance thread     |
//!    | old_bucket >= cursor ? |        | swap arrays, then migrate |
//!    +-----------+------------+        | one old bucket at a time  |
//!          old   |   primary           +-------------+-------------+
//!         +------+------+                            |
//!         v             v                            |
//!   +-----------+ +-------------+     relink chain    |
//!   | old array | |   primary   | <-------------------+
//!   |  2^(p-1)  | |    2^p      |   cursor += 1
//!   +-----------+ +-------------+
//! ```
//!
//! # Example
//!
//! ```
//! use assoc::{AssocTable, Config, EntryArena, hash};
//!
//! let table = AssocTable::new(Config::new().with_hash_power(4), EntryArena::with_capacity(8))
//!     .unwrap();
//!
//! let hv = hash(b"foo");
//! let id = table.store().alloc(b"foo", hv).unwrap();
//! {
//!     let _guard = table.lock(hv);
//!     assert!(table.find(b"foo", hv).is_none());
//!     table.insert(id, hv);
//! }
//!
//! let _guard = table.lock(hv);
//! assert_eq!(table.find(b"foo", hv), Some(id));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core types
mod config;
mod entry;
mod error;
mod sync;

// Table
mod buckets;
mod locks;
mod stats;
mod table;

// Resize and iteration
mod iter;
mod maintenance;

// Re-exports
pub use config::{
    BULK_MOVE_ENV, Config, DEFAULT_BULK_MOVE, DEFAULT_HASH_POWER, DEFAULT_LOCK_POWER,
    MAX_HASH_POWER, MAX_LOCK_POWER, MIN_HASH_POWER, bulk_move_from_env, parse_bulk_move,
};
pub use entry::{EntryArena, EntryId, EntryStore, hash};
pub use error::{AssocError, AssocResult};

pub use buckets::{Placement, SLOT_SIZE, hashmask, hashsize};
pub use locks::{BucketLocks, ItemLocks};
pub use stats::{
    HASH_BYTES, HASH_EXPANSION_FAILURES, HASH_EXPANSIONS, HASH_IS_EXPANDING,
    HASH_MIGRATED_BUCKETS, HASH_MIGRATION_DEFERRALS, HASH_POWER_LEVEL, HashStats, HashStatsState,
};
pub use table::AssocTable;

pub use iter::AssocIter;
pub use maintenance::{
    MIGRATION_BACKOFF, Maintenance, MaintenanceHandle, MigrateStatus, NoQuiesce, Quiesce,
    THREAD_NAME,
};
