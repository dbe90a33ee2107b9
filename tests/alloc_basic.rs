//! Chunk allocator scenarios: basic alloc/free, page growth, and the
//! memory limit.

mod support;

use slabkv::{AllocError, AllocFlags, Config, SlabAllocator};

fn class_one_config() -> Config {
    Config::builder()
        .memory_limit(64 * 1024 * 1024)
        .factor(2.0)
        .chunk_size(48)
        .item_size_max(1024 * 1024)
        .build()
        .unwrap()
}

#[test]
fn s_alloc_basic_lifo_round_trip() {
    let allocator = SlabAllocator::new(class_one_config()).unwrap();
    let class = 1;

    let p1 = allocator.alloc(10, class, AllocFlags::NONE).unwrap();
    allocator.free(p1, 10, class);
    let p2 = allocator.alloc(10, class, AllocFlags::NONE).unwrap();

    assert_eq!(p1, p2, "freeing then reallocating should hand back the same chunk");
}

#[test]
fn s_grow_pages_exhausting_one_page_allocates_a_second() {
    let allocator = SlabAllocator::new(class_one_config()).unwrap();
    let class = 1;
    let per_page = allocator.available_chunks(class).chunks_per_page;

    for _ in 0..=per_page {
        allocator.alloc(10, class, AllocFlags::NONE).unwrap();
    }

    let chunks = allocator.available_chunks(class);
    assert_eq!(chunks.total_chunks, 2 * per_page);
}

#[test]
fn s_limit_second_page_fails_once_memory_cap_is_reached() {
    let cfg = Config::builder()
        .memory_limit(2 * 1024 * 1024)
        .factor(2.0)
        .chunk_size(48)
        .item_size_max(1024 * 1024)
        .build()
        .unwrap();
    let allocator = SlabAllocator::new(cfg).unwrap();

    allocator.new_page(1).unwrap();
    allocator.new_page(2).unwrap();

    let err = allocator.new_page(1).unwrap_err();
    assert_eq!(err, AllocError::OutOfMemory(1));
    assert!(allocator.available_chunks(1).limit_reached);
}
