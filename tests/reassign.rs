//! Rebalance/reassignment scenarios, driven against the bundled reference
//! `ItemOwner`.

mod support;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use slabkv::{AllocFlags, Config, ItemOwner, ReassignError, SlabAllocator, Stats};
use support::ReferenceItemOwner;

fn config() -> Config {
    Config::builder()
        .memory_limit(64 * 1024 * 1024)
        .factor(1.25)
        .chunk_size(48)
        .item_size_max(64 * 1024)
        .slab_reassign(true)
        .slab_bulk_check(4)
        .build()
        .unwrap()
}

fn wait_for_completion(allocator: &SlabAllocator, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if allocator.rebalance_stats().slabs_moved() >= 1 {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn s_reassign_happy_moves_a_page_between_classes() {
    let allocator = Arc::new(SlabAllocator::new(config()).unwrap());
    let src = 3u32;
    let dst = 5u32;

    allocator.new_page(src).unwrap();
    allocator.new_page(src).unwrap();
    allocator.new_page(dst).unwrap();
    let dst_free_before = allocator.available_chunks(dst).free_chunks;
    let dst_per_page = allocator.available_chunks(dst).chunks_per_page;

    let owner: Arc<dyn ItemOwner> = Arc::new(ReferenceItemOwner::new());
    allocator.start_rebalance_worker(Arc::clone(&owner));

    allocator.reassign(src as i32, dst).unwrap();
    assert!(wait_for_completion(&allocator, Duration::from_secs(2)));

    let src_chunks = allocator.available_chunks(src);
    assert_eq!(
        src_chunks.total_chunks / src_chunks.chunks_per_page,
        1,
        "source should be left with exactly one page"
    );
    assert_eq!(
        allocator.available_chunks(dst).free_chunks,
        dst_free_before + dst_per_page,
        "destination's freelist should have grown by one page's worth of chunks"
    );
    assert_eq!(allocator.rebalance_stats().slabs_moved(), 1);

    allocator.stop_rebalance_worker();
}

#[test]
fn s_reassign_busy_item_is_rescued_once_released() {
    let allocator = Arc::new(SlabAllocator::new(config()).unwrap());
    let src = 2u32;
    let dst = 6u32;

    allocator.new_page(src).unwrap();

    let owner = Arc::new(ReferenceItemOwner::new());
    let victim = allocator.alloc(16, src, AllocFlags::NONE).unwrap();
    owner.link(victim, 0xABCD, 16);

    // A second page satisfies reassign's "source must have a spare page"
    // precondition without disturbing which page is `pages[0]` — the
    // rebalance worker always scans that one, and it must be the one
    // holding `victim`.
    allocator.new_page(src).unwrap();

    let hold_owner = Arc::clone(&owner);
    let holder = thread::spawn(move || {
        // Hold the item lock briefly so the scan sees it as busy/locked at
        // least once before it becomes available for rescue.
        let guard = hold_owner.try_lock(0xABCD).unwrap();
        thread::sleep(Duration::from_millis(20));
        drop(guard);
    });

    let dyn_owner: Arc<dyn ItemOwner> = owner.clone();
    allocator.start_rebalance_worker(dyn_owner);
    allocator.reassign(src as i32, dst).unwrap();

    holder.join().unwrap();
    assert!(wait_for_completion(&allocator, Duration::from_secs(2)));

    assert_eq!(allocator.rebalance_stats().rescues(), 1);
    assert!(allocator.rebalance_stats().busy_items() > 0, "the locked item should have been seen busy at least once");
    assert!(owner.live_count() == 1, "the rescued item should still be tracked as live");
    assert!(!owner.contains(victim), "the rescued item should have moved off its original chunk");

    allocator.stop_rebalance_worker();
}

#[test]
fn s_reassign_to_pool_leaves_the_page_unsplit() {
    let allocator = Arc::new(SlabAllocator::new(config()).unwrap());
    let src = 4u32;

    allocator.new_page(src).unwrap();
    allocator.new_page(src).unwrap();

    let owner: Arc<dyn ItemOwner> = Arc::new(ReferenceItemOwner::new());
    allocator.start_rebalance_worker(Arc::clone(&owner));

    allocator.reassign(src as i32, 0).unwrap();
    assert!(wait_for_completion(&allocator, Duration::from_secs(2)));

    let src_chunks = allocator.available_chunks(src);
    assert_eq!(src_chunks.total_chunks / src_chunks.chunks_per_page, 1);

    let snapshot = Stats::snapshot(&allocator, std::collections::BTreeMap::new());
    assert_eq!(snapshot.slab_global_page_pool, 1, "vacated page should land in the pool, unsplit");

    allocator.stop_rebalance_worker();
}

#[test]
fn s_auto_pick_selects_the_only_class_with_a_spare_page() {
    let allocator = Arc::new(SlabAllocator::new(config()).unwrap());
    allocator.new_page(1).unwrap();
    allocator.new_page(1).unwrap();
    allocator.new_page(8).unwrap();

    let owner: Arc<dyn ItemOwner> = Arc::new(ReferenceItemOwner::new());
    allocator.start_rebalance_worker(Arc::clone(&owner));

    allocator.reassign(-1, 8).unwrap();
    assert!(wait_for_completion(&allocator, Duration::from_secs(2)));
    assert_eq!(allocator.rebalance_stats().slabs_moved(), 1);

    allocator.stop_rebalance_worker();
}

#[test]
fn reassign_same_class_rejected_without_touching_worker() {
    let allocator = SlabAllocator::new(config()).unwrap();
    let err = allocator.reassign(3, 3).unwrap_err();
    assert_eq!(err, ReassignError::SrcDstSame(3));
}

#[test]
fn reassign_with_single_page_has_no_spare() {
    let allocator = SlabAllocator::new(config()).unwrap();
    allocator.new_page(1).unwrap();
    let err = allocator.reassign(1, 2).unwrap_err();
    assert_eq!(err, ReassignError::NoSpare(1));
}
