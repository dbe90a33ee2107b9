//! Page-sized buffer sources: either the host allocator (one OS mapping per
//! page) or a single preallocated contiguous region, bump-allocated.

mod prealloc;
mod syscall;

pub use prealloc::PreallocArena;

use std::sync::atomic::{AtomicUsize, Ordering};

/// Supplies page-sized, page-aligned buffers to the chunk allocator.
///
/// Implementations are not required to zero the returned buffer; `new_page`
/// zeroes it itself before splitting it into chunks.
pub trait PageSource: Send + Sync {
    /// Returns a buffer of exactly `page_size` bytes, or `None` if the
    /// source is exhausted.
    fn acquire_page(&self, page_size: usize) -> Option<*mut u8>;

    /// Running total of bytes this source has ever handed out.
    fn total_allocated(&self) -> usize;
}

/// Maps one fresh anonymous page per call via the host OS (`mmap` on Unix,
/// `VirtualAlloc` on Windows).
#[derive(Default)]
pub struct SystemPageSource {
    total_allocated: AtomicUsize,
}

impl SystemPageSource {
    /// Creates a page source with its counter seeded to `initial`, used by
    /// the `T_MEMD_INITIAL_MALLOC` test hook.
    pub fn with_initial(initial: usize) -> Self {
        Self {
            total_allocated: AtomicUsize::new(initial),
        }
    }
}

impl PageSource for SystemPageSource {
    fn acquire_page(&self, page_size: usize) -> Option<*mut u8> {
        // SAFETY: delegates to the platform mapping call; the returned
        // pointer, if any, owns exactly `page_size` bytes until freed.
        let ptr = unsafe { syscall::allocate_region(page_size) }?;
        self.total_allocated.fetch_add(page_size, Ordering::SeqCst);
        Some(ptr)
    }

    fn total_allocated(&self) -> usize {
        self.total_allocated.load(Ordering::SeqCst)
    }
}

/// Bump-allocates pages from a single preallocated contiguous region.
pub struct PreallocPageSource {
    arena: PreallocArena,
    total_allocated: AtomicUsize,
}

impl PreallocPageSource {
    /// Maps `memory_limit` bytes (rounded up to whole `page_size` pages)
    /// upfront.
    pub fn new(memory_limit: usize, page_size: usize, initial: usize) -> Option<Self> {
        Some(Self {
            arena: PreallocArena::new(memory_limit, page_size)?,
            total_allocated: AtomicUsize::new(initial),
        })
    }
}

impl PageSource for PreallocPageSource {
    fn acquire_page(&self, page_size: usize) -> Option<*mut u8> {
        let ptr = self.arena.alloc_page()?;
        self.total_allocated.fetch_add(page_size, Ordering::SeqCst);
        Some(ptr)
    }

    fn total_allocated(&self) -> usize {
        self.total_allocated.load(Ordering::SeqCst)
    }
}
