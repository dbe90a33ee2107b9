//! A single contiguous region, bump-allocated one page at a time.
//!
//! Used when `Config::prealloc` is set: the entire memory budget is mapped
//! once at startup, and `new_page` draws from it instead of making a fresh
//! OS mapping per page.

use super::syscall;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A bump allocator over one large upfront memory mapping.
pub struct PreallocArena {
    start: *mut u8,
    size: usize,
    page_size: usize,
    cursor: AtomicUsize,
}

impl PreallocArena {
    /// Maps a region of `size` bytes (rounded up to a whole number of
    /// `page_size`-byte pages) and prepares it for bump allocation.
    pub fn new(size: usize, page_size: usize) -> Option<Self> {
        let pages = size.div_ceil(page_size);
        let rounded = pages * page_size;
        unsafe {
            let ptr = syscall::allocate_region(rounded)?;
            Some(Self {
                start: ptr,
                size: rounded,
                page_size,
                cursor: AtomicUsize::new(0),
            })
        }
    }

    /// Claims the next page-sized slice, or `None` if the arena is exhausted.
    pub fn alloc_page(&self) -> Option<*mut u8> {
        let offset = self
            .cursor
            .fetch_add(self.page_size, Ordering::SeqCst);
        if offset + self.page_size > self.size {
            return None;
        }
        // SAFETY: offset + page_size <= size, which was checked above and is
        // within the single mapping returned by `allocate_region`.
        unsafe { Some(self.start.add(offset)) }
    }

    /// Total capacity of the arena, in bytes.
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Bytes claimed so far (may exceed `capacity` transiently under racing
    /// `fetch_add`s that overshoot before failing; never actually handed out).
    pub fn used(&self) -> usize {
        self.cursor.load(Ordering::SeqCst).min(self.size)
    }
}

// SAFETY: the arena only ever hands out disjoint, page-aligned slices of a
// single mapping via an atomic cursor; no two calls can alias.
unsafe impl Send for PreallocArena {}
unsafe impl Sync for PreallocArena {}

impl Drop for PreallocArena {
    fn drop(&mut self) {
        unsafe {
            syscall::free_region(self.start, self.size);
        }
    }
}
