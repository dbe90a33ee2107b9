//! The item/flags contract the rebalance worker relies on, and the trait
//! boundary standing in for the external hash table, LRU, and per-item
//! locking subsystems.
//!
//! The slab allocator itself never constructs items; it only reads and
//! writes the bits named here on chunks handed to it by an [`ItemOwner`].

/// Flags mutated by the slab subsystem on an item's header.
///
/// `CLAIMED_FOR_MOVE` names the bit pattern the source overloads as
/// `ITEM_SLABBED | ITEM_FETCHED` to mean "this chunk has been claimed by an
/// in-flight rebalance and is not on any freelist."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ItemFlags(u8);

impl ItemFlags {
    /// The chunk is on a size class's freelist, unowned by any item.
    pub const SLABBED: ItemFlags = ItemFlags(1 << 0);
    /// The chunk has been claimed by the rebalance worker for relocation.
    pub const FETCHED: ItemFlags = ItemFlags(1 << 1);
    /// The item is linked into the hash table / LRU and is live.
    pub const LINKED: ItemFlags = ItemFlags(1 << 2);
    /// Sentinel meaning "claimed for move, not on any freelist": the union
    /// of `SLABBED` and `FETCHED`, named explicitly per the source's
    /// overloaded-flag design note.
    pub const CLAIMED_FOR_MOVE: ItemFlags = ItemFlags(Self::SLABBED.0 | Self::FETCHED.0);

    /// The empty flag set.
    pub const fn empty() -> Self {
        ItemFlags(0)
    }

    /// Bitwise OR.
    #[must_use]
    pub const fn union(self, other: ItemFlags) -> ItemFlags {
        ItemFlags(self.0 | other.0)
    }

    /// Bitwise AND-NOT (remove `other`'s bits from `self`).
    #[must_use]
    pub const fn remove(self, other: ItemFlags) -> ItemFlags {
        ItemFlags(self.0 & !other.0)
    }

    /// True if `self` contains every bit set in `other`.
    #[must_use]
    pub const fn contains(self, other: ItemFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if `self` shares any bit with `other`.
    #[must_use]
    pub const fn intersects(self, other: ItemFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// True if `self` is exactly `other`.
    #[must_use]
    pub const fn is_exactly(self, other: ItemFlags) -> bool {
        self.0 == other.0
    }
}

/// A stable handle to a chunk address, used wherever the allocator or
/// rebalance worker needs to name a piece of page memory without owning it.
pub type ChunkPtr = *mut u8;

/// Outcome of probing one chunk during a rebalance scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Already claimed by a previous pass; nothing to do.
    AlreadyClaimed,
    /// Found free on the class freelist; unlinked and ready to hand over.
    FromSlab,
    /// Found live and successfully locked with an exclusive refcount;
    /// eligible for rescue.
    FromLru {
        /// The item's hash-table bucket, for use with `do_item_replace`/`do_item_unlink`.
        hv: u64,
    },
    /// Another thread holds a reference or the item lock; retry later.
    Busy,
    /// The item's shard lock could not be acquired; retry later.
    Locked,
}

/// An RAII guard for a held per-item shard lock.
///
/// Wraps an unlock closure so any `ItemOwner` implementation can hand one
/// back without forcing the trait itself to carry an associated type (which
/// would make it impossible to hold as a `dyn ItemOwner`).
pub struct ItemLockGuard(Option<Box<dyn FnOnce() + Send>>);

impl ItemLockGuard {
    /// Wraps `unlock` as a guard; it runs exactly once, on drop.
    pub fn new(unlock: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(unlock)))
    }
}

impl Drop for ItemLockGuard {
    fn drop(&mut self) {
        if let Some(unlock) = self.0.take() {
            unlock();
        }
    }
}

/// The trait boundary standing in for the hash table, LRU, and per-item
/// locking subsystems that own item identity and lifetime outside the slab
/// allocator.
///
/// Implementations must guarantee the lock ordering required by the source:
/// an item lock (`try_lock`) is always acquired *before* the caller
/// re-enters the slab mutex.
pub trait ItemOwner: Send + Sync {
    /// Reads the flags currently stored on the item occupying `chunk`.
    ///
    /// # Safety
    /// `chunk` must point to memory currently owned by a size class (either
    /// on a freelist or handed out by `alloc`).
    unsafe fn flags(&self, chunk: ChunkPtr) -> ItemFlags;

    /// Computes the hash bucket for the item occupying `chunk`. Only called
    /// when `flags(chunk)` contains `LINKED`.
    ///
    /// # Safety
    /// Same requirement as [`ItemOwner::flags`].
    unsafe fn hash_of(&self, chunk: ChunkPtr) -> u64;

    /// Attempts to acquire the per-item shard lock for bucket `hv`, returning
    /// `None` if contended.
    fn try_lock(&self, hv: u64) -> Option<ItemLockGuard>;

    /// Increments the item's refcount while its shard lock is held, and
    /// reports the resulting value.
    ///
    /// # Safety
    /// `chunk` must be live and `_guard` must be the lock for its bucket.
    unsafe fn incr_refcount(&self, chunk: ChunkPtr, _guard: &ItemLockGuard) -> u32;

    /// Decrements the item's refcount while its shard lock is held.
    ///
    /// # Safety
    /// Same requirement as [`ItemOwner::incr_refcount`].
    unsafe fn decr_refcount(&self, chunk: ChunkPtr, _guard: &ItemLockGuard);

    /// Reports whether the item has expired or been flushed and should be
    /// discarded rather than rescued.
    ///
    /// # Safety
    /// Same requirement as [`ItemOwner::flags`].
    unsafe fn is_expired_or_flushed(&self, chunk: ChunkPtr) -> bool;

    /// Computes the total on-chunk size of the item occupying `chunk`
    /// (header + key + value), used to size the rescue allocation.
    ///
    /// # Safety
    /// Same requirement as [`ItemOwner::flags`].
    unsafe fn item_total_size(&self, chunk: ChunkPtr) -> usize;

    /// Copies the live item at `old` into the freshly allocated chunk `new`,
    /// relinks the hash table / LRU to point at `new`, and drops `old`'s
    /// linkage. Called with the slab mutex *not* held.
    ///
    /// # Safety
    /// `old` must be a live item under `hv`'s lock; `new` must be a chunk of
    /// at least `item_total_size(old)` bytes not otherwise referenced.
    unsafe fn replace(&self, old: ChunkPtr, new: ChunkPtr, hv: u64);

    /// Removes the live item at `old` from the hash table / LRU without
    /// relocating it. Called with the slab mutex *not* held.
    ///
    /// # Safety
    /// `old` must be a live item under `hv`'s lock.
    unsafe fn unlink(&self, old: ChunkPtr, hv: u64);

    /// Zeroes the refcount and sets flags to [`ItemFlags::CLAIMED_FOR_MOVE`],
    /// marking `chunk` as claimed by the rebalance worker: neither on a
    /// freelist nor reachable through the hash table / LRU.
    ///
    /// # Safety
    /// The caller must hold exclusive access to `chunk` (just unlinked from
    /// a freelist, or just rescued/unlinked from the hash table).
    unsafe fn mark_claimed_for_move(&self, chunk: ChunkPtr);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn claimed_for_move_is_slabbed_and_fetched() {
        assert!(ItemFlags::CLAIMED_FOR_MOVE.contains(ItemFlags::SLABBED));
        assert!(ItemFlags::CLAIMED_FOR_MOVE.contains(ItemFlags::FETCHED));
        assert!(!ItemFlags::CLAIMED_FOR_MOVE.contains(ItemFlags::LINKED));
    }

    #[test]
    fn union_and_remove_round_trip() {
        let f = ItemFlags::SLABBED.union(ItemFlags::LINKED);
        assert!(f.contains(ItemFlags::SLABBED));
        assert!(f.contains(ItemFlags::LINKED));
        let f = f.remove(ItemFlags::SLABBED);
        assert!(!f.contains(ItemFlags::SLABBED));
        assert!(f.contains(ItemFlags::LINKED));
    }
}
