//! The chunk allocator: `alloc`/`free`/`adjust_requested`/`available_chunks`
//! and page growth, all serialized by a single mutex.

use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::AllocError;
use crate::page_source::{PageSource, PreallocPageSource, SystemPageSource};
use crate::rebalance::{RebalanceSlot, RebalanceStats};
use crate::size_class::{SizeClassTable, GLOBAL_PAGE_POOL, POWER_SMALLEST};

/// Flags accepted by [`SlabAllocator::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocFlags(u8);

impl AllocFlags {
    /// Default behavior: grow the class with a new page if the freelist is empty.
    pub const NONE: AllocFlags = AllocFlags(0);
    /// Never call `new_page`; fail instead. Used by the rebalance worker's
    /// rescue path, which must not recurse into page growth.
    pub const NO_NEWPAGE: AllocFlags = AllocFlags(1);

    fn has_no_newpage(self) -> bool {
        self.0 & Self::NO_NEWPAGE.0 != 0
    }
}

/// Snapshot of `available_chunks`: free/total chunk counts plus whether the
/// memory limit has ever been hit.
#[derive(Debug, Clone, Copy)]
pub struct AvailableChunks {
    /// Chunks currently on the class's freelist.
    pub free_chunks: usize,
    /// Total chunks the class could ever hold given its current pages.
    pub total_chunks: usize,
    /// Chunks per page for this class.
    pub chunks_per_page: usize,
    /// Whether the memory limit has ever been reached.
    pub limit_reached: bool,
}

/// State guarded by the single slab mutex: the size-class table, the
/// running memory counters, and the in-flight rebalance slot.
pub(crate) struct SlabState {
    pub table: SizeClassTable,
    pub mem_limit: usize,
    pub mem_malloced: usize,
    pub mem_limit_reached: bool,
    pub rebalance: RebalanceSlot,
}

/// The slab-based chunk allocator.
///
/// All mutating operations take the single internal mutex, matching the
/// source's single `slabs_lock`. A separate, dedicated lock and condition
/// variable coordinate the background rebalance worker (see
/// [`crate::rebalance`]).
pub struct SlabAllocator {
    pub(crate) state: Mutex<SlabState>,
    pub(crate) page_source: Box<dyn PageSource>,
    pub(crate) config: Config,
    pub(crate) running: AtomicBool,

    /// Mirrors the source's `slabs_rebalance_lock`: held by the rebalance
    /// worker for the duration of an active job, released only while
    /// parked on `rebalance_cond`. `reassign()` try-locks it to detect "a
    /// rebalance is already running" and to serialize concurrent callers.
    pub(crate) rebalance_lock: Mutex<()>,
    pub(crate) rebalance_cond: Condvar,
    pub(crate) rebalance_stats: RebalanceStats,
    pub(crate) rebalance_worker: Mutex<Option<JoinHandle<()>>>,

    /// Rotating hint for `reassign(-1, dst)`'s auto-pick, avoiding the
    /// source's `rand()` call for the same purpose.
    pub(crate) reassign_cursor: AtomicU32,
}

impl SlabAllocator {
    /// Builds a new allocator from `config`, selecting a preallocated arena
    /// or the host allocator as the page source per `config.prealloc`.
    pub fn new(config: Config) -> Result<Self, crate::error::ConfigError> {
        let table = SizeClassTable::new(
            config.chunk_size + ITEM_HEADER_SIZE,
            config.factor,
            config.item_size_max,
        );

        let page_source: Box<dyn PageSource> = if config.prealloc {
            Box::new(
                PreallocPageSource::new(
                    config.memory_limit,
                    config.item_size_max,
                    config.initial_malloc,
                )
                .ok_or(crate::error::ConfigError::PreallocFailure {
                    requested: config.memory_limit,
                })?,
            )
        } else {
            Box::new(SystemPageSource::with_initial(config.initial_malloc))
        };

        let mem_limit = config.memory_limit;
        let allocator = Self {
            state: Mutex::new(SlabState {
                table,
                mem_limit,
                mem_malloced: config.initial_malloc,
                mem_limit_reached: false,
                rebalance: RebalanceSlot::idle(),
            }),
            page_source,
            config,
            running: AtomicBool::new(true),
            rebalance_lock: Mutex::new(()),
            rebalance_cond: Condvar::new(),
            rebalance_stats: RebalanceStats::default(),
            rebalance_worker: Mutex::new(None),
            reassign_cursor: AtomicU32::new(0),
        };

        if allocator.config.prealloc {
            allocator.preallocate()?;
        }

        Ok(allocator)
    }

    /// Preallocates one page per real size class, aborting the whole
    /// construction on the first failure (the source exits the process;
    /// this crate instead fails construction).
    fn preallocate(&self) -> Result<(), crate::error::ConfigError> {
        let power_largest = self.state.lock().unwrap().table.power_largest;
        for id in POWER_SMALLEST..=power_largest {
            self.new_page(id).map_err(|_| crate::error::ConfigError::PreallocFailure {
                requested: self.config.memory_limit,
            })?;
        }
        Ok(())
    }

    /// Allocates one chunk for size class `id`.
    pub fn alloc(&self, size: usize, id: u32, flags: AllocFlags) -> Result<*mut u8, AllocError> {
        let mut state = self.state.lock().unwrap();
        self.do_alloc(&mut state, size, id, flags)
    }

    pub(crate) fn do_alloc(
        &self,
        state: &mut SlabState,
        size: usize,
        id: u32,
        flags: AllocFlags,
    ) -> Result<*mut u8, AllocError> {
        if !state.table.is_valid_class(id) {
            return Err(AllocError::InvalidClass(id));
        }

        if state.table.classes[id as usize].free_count() == 0 && !flags.has_no_newpage() {
            drop(self.new_page_locked(state, id));
        }

        let class = &mut state.table.classes[id as usize];
        if class.free_count() == 0 {
            return Err(AllocError::OutOfMemory(id));
        }

        // SAFETY: the chunk just popped was pushed by a prior `free` on a
        // chunk of this class's size, so it is at least `chunk_size` bytes
        // and not referenced elsewhere.
        let chunk = unsafe { class.freelist.pop() }.expect("freelist non-empty checked above");
        class.requested_bytes += size;
        debug!(class = id, size, "allocated chunk");
        Ok(chunk)
    }

    /// Returns `ptr` (a chunk of class `id`, originally requested with
    /// `size` bytes) to the class freelist.
    pub fn free(&self, ptr: *mut u8, size: usize, id: u32) {
        let mut state = self.state.lock().unwrap();
        self.do_free(&mut state, ptr, size, id);
    }

    pub(crate) fn do_free(&self, state: &mut SlabState, ptr: *mut u8, size: usize, id: u32) {
        debug_assert!(state.table.is_valid_class(id), "free with invalid class {id}");
        let class = &mut state.table.classes[id as usize];
        // SAFETY: `ptr` was previously handed out by `alloc`/`new_page` for
        // this class and is not concurrently accessed elsewhere (caller
        // holds the only reference).
        unsafe { class.freelist.push(ptr) };
        class.requested_bytes = class.requested_bytes.saturating_sub(size);
    }

    /// Adjusts `requested_bytes` for class `id` by `new - old`, used when a
    /// record is updated in place without reallocating its chunk.
    pub fn adjust_requested(&self, id: u32, old: usize, new: usize) {
        let mut state = self.state.lock().unwrap();
        let class = &mut state.table.classes[id as usize];
        class.requested_bytes = (class.requested_bytes + new).saturating_sub(old);
    }

    /// Reports free/total chunk counts for class `id`.
    pub fn available_chunks(&self, id: u32) -> AvailableChunks {
        let state = self.state.lock().unwrap();
        let class = &state.table.classes[id as usize];
        AvailableChunks {
            free_chunks: class.free_count(),
            total_chunks: class.total_chunks(),
            chunks_per_page: class.per_page,
            limit_reached: state.mem_limit_reached,
        }
    }

    /// Grows class `id` by one page: pulls from the global pool if
    /// available, otherwise asks the page source, zeroes the page, and
    /// splits it into the class's freelist.
    pub fn new_page(&self, id: u32) -> Result<(), AllocError> {
        let mut state = self.state.lock().unwrap();
        self.new_page_locked(&mut state, id)
    }

    pub(crate) fn new_page_locked(&self, state: &mut SlabState, id: u32) -> Result<(), AllocError> {
        // The page source only ever hands out whole, `item_size_max`-sized
        // pages, regardless of `slab_reassign`; that flag still matters
        // conceptually (any page can move to any class), it just has no
        // further effect here since pages are never trimmed to begin with.
        let page_size = self.config.item_size_max;
        let len = page_size;

        let global_empty = state.table.classes[GLOBAL_PAGE_POOL as usize].pages.is_empty();
        let class_has_pages = !state.table.classes[id as usize].pages.is_empty();
        if id > GLOBAL_PAGE_POOL
            && state.mem_limit != 0
            && state.mem_malloced + len > state.mem_limit
            && class_has_pages
            && global_empty
        {
            state.mem_limit_reached = true;
            warn!(class = id, "memory limit reached, cannot grow");
            return Err(AllocError::OutOfMemory(id));
        }

        let page = if let Some(p) = state.table.classes[GLOBAL_PAGE_POOL as usize].pages.pop() {
            p
        } else {
            self.page_source
                .acquire_page(page_size)
                .ok_or(AllocError::OutOfMemory(id))?
        };

        // SAFETY: `page` is exactly `page_size` bytes, freshly acquired (or
        // taken whole from the pool, never split), and not aliased.
        unsafe { std::ptr::write_bytes(page, 0, page_size) };

        let (chunk_size, per_page) = {
            let class = &state.table.classes[id as usize];
            (class.chunk_size, class.per_page)
        };
        for i in 0..per_page {
            // SAFETY: each stride stays within the zeroed `page_size` buffer.
            let chunk = unsafe { page.add(i * chunk_size) };
            self.do_free(state, chunk, 0, id);
        }

        state.table.classes[id as usize].pages.push(page);
        state.mem_malloced += len;
        debug!(class = id, pages = state.table.classes[id as usize].pages.len(), "grew page");
        Ok(())
    }

    /// The allocator's configuration, for inspection.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Approximate size of the external item header the source embeds ahead of
/// the configured `chunk_size` payload; kept as a fixed constant since the
/// item layout itself is out of scope here.
const ITEM_HEADER_SIZE: usize = 48;

// SAFETY: all mutable state lives behind `state`'s mutex or atomics; raw
// page pointers are never dereferenced without holding it.
unsafe impl Send for SlabAllocator {}
unsafe impl Sync for SlabAllocator {}
