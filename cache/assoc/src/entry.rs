//! Entry handles and the entry store seam.
//!
//! The index never owns entries. It stores [`EntryId`] handles in bucket
//! slots and reaches the fields it needs (key, stored hash, chain link)
//! through the [`EntryStore`] trait. [`EntryArena`] is a fixed-capacity store
//! suitable for tests, benchmarks and simple embeddings.

use crate::sync::{AtomicU32, Ordering};
use ahash::RandomState;
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use std::num::NonZeroU32;
use std::sync::LazyLock;

/// Handle to an entry in an [`EntryStore`].
///
/// Non-zero so that `Option<EntryId>` packs into a single `u32` slot with
/// `0` meaning empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(NonZeroU32);

impl EntryId {
    /// Create a handle from its raw value. Returns `None` for `0`.
    #[inline]
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// The raw handle value.
    #[inline]
    pub fn as_raw(self) -> u32 {
        self.0.get()
    }

    #[inline]
    pub(crate) fn pack(id: Option<Self>) -> u32 {
        id.map_or(0, Self::as_raw)
    }

    #[inline]
    pub(crate) fn unpack(raw: u32) -> Option<Self> {
        Self::new(raw)
    }
}

/// Access to the entry fields the index depends on.
///
/// Implementations must be thread-safe. The index only calls `next` and
/// `set_next` for entries in a chain whose bucket lock the current thread
/// holds, so the link needs atomicity but no further synchronization.
pub trait EntryStore: Send + Sync {
    /// The precomputed hash of the entry's key.
    fn hash(&self, id: EntryId) -> u32;

    /// Whether the entry's key equals `key` exactly (length and bytes).
    fn key_matches(&self, id: EntryId, key: &[u8]) -> bool;

    /// The next entry in the entry's chain.
    fn next(&self, id: EntryId) -> Option<EntryId>;

    /// Relink the entry.
    fn set_next(&self, id: EntryId, next: Option<EntryId>);
}

static HASHER: LazyLock<RandomState> = LazyLock::new(|| {
    RandomState::with_seeds(
        0xbb8c484891ec6c86,
        0x0522a25ae9c769f9,
        0xeed2797b9571bc75,
        0x4feb29c1fbbd59d0,
    )
});

/// Hash a key to the 32-bit value the index addresses buckets with.
///
/// Seeds are fixed so every thread, and every run, agrees on placement.
#[inline]
pub fn hash(key: &[u8]) -> u32 {
    let h = HASHER.hash_one(key);
    (h ^ (h >> 32)) as u32
}

struct Node {
    hash: AtomicU32,
    next: AtomicU32,
    key: RwLock<Box<[u8]>>,
}

impl Node {
    fn new() -> Self {
        Self {
            hash: AtomicU32::new(0),
            next: AtomicU32::new(0),
            key: RwLock::new(Box::default()),
        }
    }
}

/// Fixed-capacity entry store.
///
/// Handles are recycled through a free list once freed. Freeing an entry
/// that is still linked into the index is a caller bug.
pub struct EntryArena {
    nodes: Box<[Node]>,
    free: Mutex<Vec<u32>>,
}

impl EntryArena {
    /// Create an arena holding up to `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity < u32::MAX as usize,
            "arena capacity must fit in a u32 handle"
        );
        let nodes = (0..capacity)
            .map(|_| Node::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // pop from the back hands out low handles first
        let free = (1..=capacity as u32).rev().collect();

        Self {
            nodes,
            free: Mutex::new(free),
        }
    }

    /// Total number of entries the arena can hold.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Number of allocated entries.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.lock().len()
    }

    /// Whether no entries are allocated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate an unlinked entry. Returns `None` when the arena is full.
    pub fn alloc(&self, key: &[u8], hash: u32) -> Option<EntryId> {
        let raw = self.free.lock().pop()?;
        let id = EntryId::unpack(raw)?;
        let node = self.node(id);
        *node.key.write() = key.into();
        node.hash.store(hash, Ordering::Relaxed);
        node.next.store(0, Ordering::Relaxed);
        Some(id)
    }

    /// Return an entry to the free list.
    pub fn free(&self, id: EntryId) {
        let node = self.node(id);
        *node.key.write() = Box::default();
        node.next.store(0, Ordering::Relaxed);
        self.free.lock().push(id.as_raw());
    }

    /// Borrow the entry's key.
    pub fn key(&self, id: EntryId) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.node(id).key.read(), |key| &**key)
    }

    #[inline]
    fn node(&self, id: EntryId) -> &Node {
        &self.nodes[id.as_raw() as usize - 1]
    }
}

impl EntryStore for EntryArena {
    #[inline]
    fn hash(&self, id: EntryId) -> u32 {
        self.node(id).hash.load(Ordering::Relaxed)
    }

    #[inline]
    fn key_matches(&self, id: EntryId, key: &[u8]) -> bool {
        **self.node(id).key.read() == *key
    }

    #[inline]
    fn next(&self, id: EntryId) -> Option<EntryId> {
        EntryId::unpack(self.node(id).next.load(Ordering::Relaxed))
    }

    #[inline]
    fn set_next(&self, id: EntryId, next: Option<EntryId>) {
        self.node(id)
            .next
            .store(EntryId::pack(next), Ordering::Relaxed);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_packing() {
        assert_eq!(EntryId::new(0), None);
        let id = EntryId::new(7).unwrap();
        assert_eq!(EntryId::pack(Some(id)), 7);
        assert_eq!(EntryId::pack(None), 0);
        assert_eq!(EntryId::unpack(7), Some(id));
        assert_eq!(EntryId::unpack(0), None);
        assert_eq!(std::mem::size_of::<Option<EntryId>>(), 4);
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash(b"k0"), hash(b"k0"));
        assert_ne!(hash(b"k0"), hash(b"k1"));
    }

    #[test]
    fn test_arena_alloc_free() {
        let arena = EntryArena::with_capacity(2);
        assert!(arena.is_empty());

        let a = arena.alloc(b"alpha", 1).unwrap();
        let b = arena.alloc(b"beta", 2).unwrap();
        assert_eq!(arena.len(), 2);
        assert!(arena.alloc(b"gamma", 3).is_none());

        assert_eq!(&*arena.key(a), b"alpha");
        assert_eq!(arena.hash(b), 2);
        assert!(arena.key_matches(a, b"alpha"));
        assert!(!arena.key_matches(a, b"alph"));
        assert!(!arena.key_matches(a, b"alphab"));

        arena.free(a);
        assert_eq!(arena.len(), 1);
        let c = arena.alloc(b"gamma", 3).unwrap();
        assert_eq!(c, a);
        assert_eq!(&*arena.key(c), b"gamma");
    }

    #[test]
    fn test_arena_links() {
        let arena = EntryArena::with_capacity(2);
        let a = arena.alloc(b"a", 0).unwrap();
        let b = arena.alloc(b"b", 0).unwrap();
        assert_eq!(arena.next(a), None);
        arena.set_next(a, Some(b));
        assert_eq!(arena.next(a), Some(b));
        arena.set_next(a, None);
        assert_eq!(arena.next(a), None);
    }
}
