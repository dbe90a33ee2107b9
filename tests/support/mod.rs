//! A reference `ItemOwner`: an in-memory stand-in for the hash table, LRU,
//! and per-item locking subsystem, used only by this crate's own
//! integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use slabkv::{ChunkPtr, ItemFlags, ItemLockGuard, ItemOwner};

struct ItemRecord {
    flags: ItemFlags,
    refcount: u32,
    hv: u64,
    expired: bool,
    ntotal: usize,
}

/// A minimal `ItemOwner`: item state lives in a side table keyed by chunk
/// address rather than inside the chunk itself, since these tests only
/// exercise coordination, not a real key/value payload format.
pub struct ReferenceItemOwner {
    items: Mutex<HashMap<usize, ItemRecord>>,
    shards: Vec<Arc<AtomicBool>>,
}

impl ReferenceItemOwner {
    /// Builds an owner with no live items.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            shards: (0..16).map(|_| Arc::new(AtomicBool::new(false))).collect(),
        }
    }

    /// Marks `chunk` as holding a live item under hash bucket `hv`, sized
    /// `ntotal` bytes on the chunk.
    pub fn link(&self, chunk: ChunkPtr, hv: u64, ntotal: usize) {
        self.items.lock().unwrap().insert(
            chunk as usize,
            ItemRecord {
                flags: ItemFlags::LINKED,
                refcount: 1,
                hv,
                expired: false,
                ntotal,
            },
        );
    }

    /// Marks a previously linked chunk as expired, so a rescue discards it
    /// instead of relocating it.
    pub fn set_expired(&self, chunk: ChunkPtr) {
        if let Some(rec) = self.items.lock().unwrap().get_mut(&(chunk as usize)) {
            rec.expired = true;
        }
    }

    /// True if `chunk` is currently tracked as a live, linked item.
    pub fn is_linked(&self, chunk: ChunkPtr) -> bool {
        self.items
            .lock()
            .unwrap()
            .get(&(chunk as usize))
            .is_some_and(|rec| rec.flags.contains(ItemFlags::LINKED))
    }

    /// Current address of the item that was originally linked at `chunk`,
    /// if it has since been relocated by a rescue (`replace` updates the
    /// key).
    pub fn contains(&self, chunk: ChunkPtr) -> bool {
        self.items.lock().unwrap().contains_key(&(chunk as usize))
    }

    /// Number of items still tracked as live.
    pub fn live_count(&self) -> usize {
        self.items
            .lock()
            .unwrap()
            .values()
            .filter(|rec| rec.flags.contains(ItemFlags::LINKED))
            .count()
    }
}

impl Default for ReferenceItemOwner {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemOwner for ReferenceItemOwner {
    unsafe fn flags(&self, chunk: ChunkPtr) -> ItemFlags {
        self.items
            .lock()
            .unwrap()
            .get(&(chunk as usize))
            .map_or(ItemFlags::SLABBED, |rec| rec.flags)
    }

    unsafe fn hash_of(&self, chunk: ChunkPtr) -> u64 {
        self.items.lock().unwrap().get(&(chunk as usize)).map_or(0, |rec| rec.hv)
    }

    fn try_lock(&self, hv: u64) -> Option<ItemLockGuard> {
        let shard = Arc::clone(&self.shards[hv as usize % self.shards.len()]);
        if shard
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(ItemLockGuard::new(move || {
                shard.store(false, Ordering::Release);
            }))
        } else {
            None
        }
    }

    unsafe fn incr_refcount(&self, chunk: ChunkPtr, _guard: &ItemLockGuard) -> u32 {
        let mut items = self.items.lock().unwrap();
        let rec = items.get_mut(&(chunk as usize)).expect("incr_refcount on untracked chunk");
        rec.refcount += 1;
        rec.refcount
    }

    unsafe fn decr_refcount(&self, chunk: ChunkPtr, _guard: &ItemLockGuard) {
        if let Some(rec) = self.items.lock().unwrap().get_mut(&(chunk as usize)) {
            rec.refcount = rec.refcount.saturating_sub(1);
        }
    }

    unsafe fn is_expired_or_flushed(&self, chunk: ChunkPtr) -> bool {
        self.items
            .lock()
            .unwrap()
            .get(&(chunk as usize))
            .is_some_and(|rec| rec.expired)
    }

    unsafe fn item_total_size(&self, chunk: ChunkPtr) -> usize {
        self.items.lock().unwrap().get(&(chunk as usize)).map_or(0, |rec| rec.ntotal)
    }

    unsafe fn replace(&self, old: ChunkPtr, new: ChunkPtr, hv: u64) {
        let mut items = self.items.lock().unwrap();
        if let Some(mut rec) = items.remove(&(old as usize)) {
            rec.hv = hv;
            rec.refcount = 0;
            items.insert(new as usize, rec);
        }
    }

    unsafe fn unlink(&self, old: ChunkPtr, _hv: u64) {
        self.items.lock().unwrap().remove(&(old as usize));
    }

    unsafe fn mark_claimed_for_move(&self, chunk: ChunkPtr) {
        self.items.lock().unwrap().remove(&(chunk as usize));
    }
}
