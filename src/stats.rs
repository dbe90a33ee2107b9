//! A statistics snapshot mirroring the textual `stats slabs`/`stats items`
//! surface: per-class chunk accounting plus an opaque pass-through for
//! counters the item layer owns (hits, sets, evictions, ...).

use std::collections::BTreeMap;

use serde::Serialize;

use crate::allocator::SlabAllocator;
use crate::size_class::GLOBAL_PAGE_POOL;

/// Per-size-class statistics, included only for classes owning ≥ 1 page.
#[derive(Debug, Clone, Serialize)]
pub struct ClassStats {
    /// Bytes per chunk.
    pub chunk_size: usize,
    /// Chunks per page.
    pub chunks_per_page: usize,
    /// Pages currently owned by this class.
    pub total_pages: usize,
    /// `total_pages * chunks_per_page`.
    pub total_chunks: usize,
    /// Chunks currently handed out.
    pub used_chunks: usize,
    /// Chunks currently on the freelist.
    pub free_chunks: usize,
    /// Always 0; retained for compatibility with the field of the same name
    /// in the original stats output.
    pub free_chunks_end: usize,
    /// Sum of outstanding `alloc` request sizes for this class.
    pub mem_requested: usize,
}

/// A point-in-time snapshot of allocator and rebalance state, serializable
/// for a stats command handler.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    /// Whole pages currently sitting in the global page pool.
    pub slab_global_page_pool: usize,
    /// Number of size classes with at least one page.
    pub active_slabs: usize,
    /// Running total of bytes ever handed out by the page source.
    pub total_malloced: usize,
    /// Cumulative pages moved by the rebalance worker.
    pub slabs_moved: u64,
    /// Cumulative live items rescued during a page move.
    pub rescues: u64,
    /// Cumulative live items dropped for lack of a rescue chunk.
    pub evictions_nomem: u64,
    /// Cumulative chunks reclaimed from the page being vacated.
    pub inline_reclaim: u64,
    /// Cumulative chunks seen busy or locked across all scan restarts.
    pub busy_items: u64,
    /// Per-class stats, keyed by class id.
    pub classes: BTreeMap<u32, ClassStats>,
    /// Opaque hit/set/delete/incr/decr/cas/touch counters supplied by the
    /// item layer, passed through verbatim.
    pub item_counters: BTreeMap<String, u64>,
}

impl Stats {
    /// Builds a snapshot of `allocator`'s current state, merging in
    /// `item_counters` supplied by the external item layer.
    pub fn snapshot(allocator: &SlabAllocator, item_counters: BTreeMap<String, u64>) -> Self {
        let state = allocator.state.lock().unwrap();

        let mut classes = BTreeMap::new();
        let mut active_slabs = 0;
        for id in 1..=state.table.power_largest {
            let class = &state.table.classes[id as usize];
            if class.pages.is_empty() {
                continue;
            }
            active_slabs += 1;
            classes.insert(
                id,
                ClassStats {
                    chunk_size: class.chunk_size,
                    chunks_per_page: class.per_page,
                    total_pages: class.pages.len(),
                    total_chunks: class.total_chunks(),
                    used_chunks: class.used_count(),
                    free_chunks: class.free_count(),
                    free_chunks_end: 0,
                    mem_requested: class.requested_bytes,
                },
            );
        }

        let slab_global_page_pool = state.table.classes[GLOBAL_PAGE_POOL as usize].pages.len();
        let total_malloced = state.mem_malloced;
        drop(state);

        let rebalance = allocator.rebalance_stats();
        Self {
            slab_global_page_pool,
            active_slabs,
            total_malloced,
            slabs_moved: rebalance.slabs_moved(),
            rescues: rebalance.rescues(),
            evictions_nomem: rebalance.evictions_nomem(),
            inline_reclaim: rebalance.inline_reclaim(),
            busy_items: rebalance.busy_items(),
            classes,
            item_counters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocFlags;
    use crate::config::Config;
    use crate::size_class::POWER_SMALLEST;

    fn alloc_for_test() -> SlabAllocator {
        let cfg = Config::builder()
            .memory_limit(64 * 1024 * 1024)
            .factor(2.0)
            .chunk_size(48)
            .item_size_max(1024 * 1024)
            .build()
            .unwrap();
        SlabAllocator::new(cfg).unwrap()
    }

    #[test]
    fn snapshot_reports_only_classes_with_pages() {
        let alloc = alloc_for_test();
        alloc.alloc(10, POWER_SMALLEST, AllocFlags::NONE).unwrap();
        let snap = Stats::snapshot(&alloc, BTreeMap::new());
        assert_eq!(snap.active_slabs, 1);
        assert!(snap.classes.contains_key(&POWER_SMALLEST));
        assert_eq!(snap.classes[&POWER_SMALLEST].used_chunks, 1);
    }

    #[test]
    fn item_counters_pass_through_unchanged() {
        let alloc = alloc_for_test();
        let mut counters = BTreeMap::new();
        counters.insert("hits".to_string(), 42);
        let snap = Stats::snapshot(&alloc, counters.clone());
        assert_eq!(snap.item_counters, counters);
    }
}
