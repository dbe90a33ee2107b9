//! The rebalance coordinator and worker: the S0/S1/S2/S3 state machine that
//! moves a page from one size class to another while items on it are still
//! potentially live.
//!
//! [`SlabAllocator::reassign`] is the non-blocking entry point; the actual
//! work happens on a dedicated worker thread started by
//! [`SlabAllocator::start_rebalance_worker`], which parks on a condition
//! variable between jobs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, TryLockError};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::allocator::{AllocFlags, SlabAllocator, SlabState};
use crate::cache_padded::CachePadded;
use crate::error::ReassignError;
use crate::item::{ChunkPtr, ItemFlags, ItemLockGuard, ItemOwner, ScanOutcome};
use crate::size_class::{GLOBAL_PAGE_POOL, POWER_SMALLEST};

/// In-flight rebalance state, guarded by the slab mutex alongside the
/// size-class table (mirrors the source's global `slab_rebal` struct).
pub(crate) struct RebalanceSlot {
    /// 0 = idle, 1 = start requested, 2 = scan in progress.
    pub signal: u8,
    pub src_id: u32,
    pub dst_id: u32,
    pub page_start: Option<ChunkPtr>,
    pub page_end: Option<ChunkPtr>,
    pub cursor: Option<ChunkPtr>,
    pub done: bool,
    pub busy_items: u64,
    pub rescues: u64,
    pub evictions_nomem: u64,
    pub inline_reclaim: u64,
}

impl RebalanceSlot {
    pub fn idle() -> Self {
        Self {
            signal: 0,
            src_id: 0,
            dst_id: 0,
            page_start: None,
            page_end: None,
            cursor: None,
            done: false,
            busy_items: 0,
            rescues: 0,
            evictions_nomem: 0,
            inline_reclaim: 0,
        }
    }
}

/// Cumulative counters published at the end of each completed rebalance job.
#[derive(Default)]
pub struct RebalanceStats {
    slabs_moved: CachePadded<AtomicU64>,
    rescues: CachePadded<AtomicU64>,
    evictions_nomem: CachePadded<AtomicU64>,
    inline_reclaim: CachePadded<AtomicU64>,
    busy_items: CachePadded<AtomicU64>,
}

impl RebalanceStats {
    /// Total number of pages successfully moved between classes.
    pub fn slabs_moved(&self) -> u64 {
        self.slabs_moved.load(Ordering::Relaxed)
    }

    /// Total number of live items relocated to survive a page move.
    pub fn rescues(&self) -> u64 {
        self.rescues.load(Ordering::Relaxed)
    }

    /// Total number of live items dropped for lack of a rescue chunk.
    pub fn evictions_nomem(&self) -> u64 {
        self.evictions_nomem.load(Ordering::Relaxed)
    }

    /// Total number of chunks reclaimed from the very page being vacated
    /// while looking for a rescue target.
    pub fn inline_reclaim(&self) -> u64 {
        self.inline_reclaim.load(Ordering::Relaxed)
    }

    /// Total number of chunks seen busy or locked across all scan restarts,
    /// cumulative across every completed rebalance job.
    pub fn busy_items(&self) -> u64 {
        self.busy_items.load(Ordering::Relaxed)
    }
}

/// An acquired `rebalancer_pause()`; the worker cannot start or continue a
/// job until this is dropped (or [`RebalancerPauseGuard::resume`] is called).
pub struct RebalancerPauseGuard<'a>(std::sync::MutexGuard<'a, ()>);

impl RebalancerPauseGuard<'_> {
    /// Releases the pause. Equivalent to dropping the guard.
    pub fn resume(self) {}
}

impl SlabAllocator {
    /// Requests that `src` donate one page to `dst` (or to the global page
    /// pool, if `dst == 0`). `src == -1` asks the allocator to pick any
    /// class with a spare page via a rotating cursor.
    ///
    /// Non-blocking: returns as soon as the request is either validated and
    /// handed to the worker, or rejected.
    pub fn reassign(&self, src: i32, dst: u32) -> Result<(), ReassignError> {
        let _held = match self.rebalance_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(ReassignError::Running),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let mut state = self.state.lock().unwrap();

        let resolved_src = if src < 0 {
            self.pick_any_class(&state, dst)?
        } else {
            src as u32
        };

        let dst_valid = dst == GLOBAL_PAGE_POOL || state.table.is_valid_class(dst);
        if !state.table.is_valid_class(resolved_src) || !dst_valid {
            return Err(ReassignError::BadClass {
                src,
                dst: dst as i32,
            });
        }
        if resolved_src == dst {
            return Err(ReassignError::SrcDstSame(resolved_src));
        }
        if state.table.classes[resolved_src as usize].pages.len() < 2 {
            return Err(ReassignError::NoSpare(resolved_src));
        }

        state.rebalance.src_id = resolved_src;
        state.rebalance.dst_id = dst;
        state.rebalance.signal = 1;
        drop(state);
        self.rebalance_cond.notify_one();
        Ok(())
    }

    /// Acquires the rebalance lock so an external operator can freeze the
    /// mover between jobs. The worker will not start or resume a job while
    /// the returned guard is held.
    pub fn rebalancer_pause(&self) -> RebalancerPauseGuard<'_> {
        RebalancerPauseGuard(
            self.rebalance_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    /// Cumulative rebalance statistics.
    pub fn rebalance_stats(&self) -> &RebalanceStats {
        &self.rebalance_stats
    }

    /// Picks the smallest-indexed class (from a rotating start point) with
    /// more than one page, other than `dst`. Used by `reassign(-1, dst)`.
    fn pick_any_class(&self, state: &SlabState, dst: u32) -> Result<u32, ReassignError> {
        let n = state.table.power_largest;
        if n == 0 {
            return Err(ReassignError::NoSpare(0));
        }
        let start = self.reassign_cursor.fetch_add(1, Ordering::Relaxed) % n;
        for offset in 0..n {
            let id = POWER_SMALLEST + (start + offset) % n;
            if id != dst && state.table.classes[id as usize].pages.len() > 1 {
                return Ok(id);
            }
        }
        Err(ReassignError::NoSpare(0))
    }

    /// Spawns the background rebalance worker, bound to `owner` for the
    /// lifetime of the thread. Only one worker may be active at a time.
    pub fn start_rebalance_worker(self: &Arc<Self>, owner: Arc<dyn ItemOwner>) {
        let allocator = Arc::clone(self);
        let handle = thread::spawn(move || allocator.rebalance_worker_loop(&*owner));
        *self.rebalance_worker.lock().unwrap() = Some(handle);
    }

    /// Signals the worker to stop after its current job (if any) and joins
    /// it. Idempotent.
    pub fn stop_rebalance_worker(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.rebalance_cond.notify_all();
        if let Some(handle) = self.rebalance_worker.lock().unwrap().take() {
            handle.join().ok();
        }
    }

    fn rebalance_worker_loop(&self, owner: &dyn ItemOwner) {
        let mut held = self.rebalance_lock.lock().unwrap();
        while self.running.load(Ordering::SeqCst) {
            let signal = self.state.lock().unwrap().rebalance.signal;
            match signal {
                0 => {
                    held = self.rebalance_cond.wait(held).unwrap();
                }
                1 => self.rebalance_start(),
                2 => {
                    if self.rebalance_tick(owner) {
                        thread::sleep(Duration::from_micros(50));
                    }
                }
                other => unreachable!("unknown rebalance signal {other}"),
            }
        }
    }

    /// S1: validates the requested move and publishes the scan window, or
    /// aborts back to idle if the state is no longer valid.
    fn rebalance_start(&self) {
        let mut state = self.state.lock().unwrap();
        let src_id = state.rebalance.src_id;
        let dst_id = state.rebalance.dst_id;

        let valid = state.table.is_valid_class(src_id)
            && (dst_id == GLOBAL_PAGE_POOL || state.table.is_valid_class(dst_id))
            && state.table.classes[src_id as usize].pages.len() >= 2;

        if !valid {
            warn!(src = src_id, dst = dst_id, "rebalance start aborted, state no longer valid");
            state.rebalance = RebalanceSlot::idle();
            return;
        }

        let (chunk_size, per_page) = {
            let class = &state.table.classes[src_id as usize];
            (class.chunk_size, class.per_page)
        };
        let page_start = state.table.classes[src_id as usize].pages[0];
        // SAFETY: `page_start` is a page this class owns, exactly
        // `chunk_size * per_page` bytes long.
        let page_end = unsafe { page_start.add(chunk_size * per_page) };

        state.rebalance.page_start = Some(page_start);
        state.rebalance.page_end = Some(page_end);
        state.rebalance.cursor = Some(page_start);
        state.rebalance.done = false;
        state.rebalance.busy_items = 0;
        state.rebalance.rescues = 0;
        state.rebalance.evictions_nomem = 0;
        state.rebalance.inline_reclaim = 0;
        state.rebalance.signal = 2;
        info!(src = src_id, dst = dst_id, "rebalance scan started");
    }

    /// S2: processes up to `slab_bulk_check` chunks. Returns whether the
    /// caller should back off 50us before the next tick (a busy/locked
    /// chunk was seen and the scan isn't finished).
    fn rebalance_tick(&self, owner: &dyn ItemOwner) -> bool {
        let bulk = self.config.slab_bulk_check.max(1);
        let mut busy_this_tick = false;
        for _ in 0..bulk {
            let (reached_end, was_busy) = self.scan_one_chunk(owner);
            busy_this_tick |= was_busy;
            if reached_end && self.maybe_finish_pass() {
                return false;
            }
            if reached_end {
                // Pass restarted from page_start due to busy items; stop
                // this tick's chunk budget here rather than overshoot into
                // the next pass.
                break;
            }
        }
        busy_this_tick
    }

    /// Classifies and handles the chunk at the scan cursor, then advances
    /// it. Returns `(reached_page_end, was_busy_or_locked)`.
    fn scan_one_chunk(&self, owner: &dyn ItemOwner) -> (bool, bool) {
        let mut state = self.state.lock().unwrap();
        let src_id = state.rebalance.src_id;
        let chunk = state.rebalance.cursor.expect("scan active");
        let page_end = state.rebalance.page_end.expect("scan active");
        let chunk_size = state.table.classes[src_id as usize].chunk_size;

        // SAFETY: `chunk` lies within [page_start, page_end) of a page
        // currently owned by `src_id`, published by `rebalance_start`.
        let (outcome, guard) = unsafe { self.classify(&mut state, owner, chunk, src_id) };

        let busy = matches!(outcome, ScanOutcome::Busy | ScanOutcome::Locked);

        if let ScanOutcome::FromLru { hv } = outcome {
            drop(state);
            self.rescue_item(owner, chunk, src_id, hv, guard.expect("FromLru carries its item lock"));
            state = self.state.lock().unwrap();
        }

        if busy {
            state.rebalance.busy_items += 1;
        }

        // SAFETY: `chunk + chunk_size` stays within the page or lands
        // exactly on `page_end`, both valid pointer values for this region.
        let next = unsafe { chunk.add(chunk_size) };
        let reached_end = next >= page_end;
        state.rebalance.cursor = Some(next);
        (reached_end, busy)
    }

    /// Classifies the chunk per the scan table: already claimed, free on
    /// the class freelist, live and lockable, or busy/locked.
    ///
    /// # Safety
    /// `chunk` must point to memory within a page currently owned by
    /// `src_id`.
    unsafe fn classify(
        &self,
        state: &mut SlabState,
        owner: &dyn ItemOwner,
        chunk: ChunkPtr,
        src_id: u32,
    ) -> (ScanOutcome, Option<ItemLockGuard>) {
        let flags = owner.flags(chunk);

        if flags.is_exactly(ItemFlags::CLAIMED_FOR_MOVE) {
            return (ScanOutcome::AlreadyClaimed, None);
        }

        if flags.contains(ItemFlags::SLABBED) {
            state.table.classes[src_id as usize].freelist.remove(chunk);
            owner.mark_claimed_for_move(chunk);
            return (ScanOutcome::FromSlab, None);
        }

        if flags.contains(ItemFlags::LINKED) {
            let hv = owner.hash_of(chunk);
            let guard = match owner.try_lock(hv) {
                Some(guard) => guard,
                None => return (ScanOutcome::Locked, None),
            };
            let refcount = owner.incr_refcount(chunk, &guard);
            let still_linked = owner.flags(chunk).contains(ItemFlags::LINKED);
            if refcount == 2 && still_linked {
                // Keep the item lock held across the pending rescue: the
                // caller drops the slab mutex and runs `rescue_item` with
                // only this guard held, matching the required lock order.
                return (ScanOutcome::FromLru { hv }, Some(guard));
            }
            owner.decr_refcount(chunk, &guard);
            return (ScanOutcome::Busy, None);
        }

        (ScanOutcome::Busy, None)
    }

    /// Relocates or discards the live item at `old`, running with the slab
    /// mutex dropped and `guard` (the item lock for `hv`) held.
    fn rescue_item(&self, owner: &dyn ItemOwner, old: ChunkPtr, src_id: u32, hv: u64, guard: ItemLockGuard) {
        // SAFETY: `old` is live under `hv`'s lock, held by `guard`.
        let (expired, ntotal) = unsafe { (owner.is_expired_or_flushed(old), owner.item_total_size(old)) };

        let new_chunk = if expired {
            None
        } else {
            self.rebalance_alloc(owner, src_id, ntotal)
        };

        let rescued = if let Some(new_chunk) = new_chunk {
            // SAFETY: `new_chunk` is at least `ntotal` bytes, freshly
            // allocated and not otherwise referenced; `old` is live under
            // `hv`'s lock.
            unsafe { owner.replace(old, new_chunk, hv) };
            true
        } else {
            // SAFETY: `old` is live under `hv`'s lock.
            unsafe { owner.unlink(old, hv) };
            false
        };

        // SAFETY: `old` is live under `hv`'s lock, held by `guard`, matching
        // the earlier `incr_refcount` in `classify`.
        unsafe { owner.decr_refcount(old, &guard) };
        drop(guard);

        let mut state = self.state.lock().unwrap();
        // SAFETY: `old` is no longer referenced by the hash table / LRU
        // (just relocated or unlinked above) and exclusively owned here.
        unsafe { owner.mark_claimed_for_move(old) };
        let class = &mut state.table.classes[src_id as usize];
        class.requested_bytes = class.requested_bytes.saturating_sub(ntotal);
        if rescued {
            state.rebalance.rescues += 1;
        } else {
            warn!(class = src_id, "rebalance rescue failed for lack of memory");
            state.rebalance.evictions_nomem += 1;
        }
    }

    /// A constrained `alloc(src_id, NO_NEWPAGE)` for rescue targets: any
    /// chunk drawn from the page currently being vacated is unusable, so it
    /// is marked claimed and the search continues.
    fn rebalance_alloc(&self, owner: &dyn ItemOwner, src_id: u32, ntotal: usize) -> Option<ChunkPtr> {
        let mut state = self.state.lock().unwrap();
        let page_start = state.rebalance.page_start?;
        let page_end = state.rebalance.page_end?;
        loop {
            let chunk = self
                .do_alloc(&mut state, ntotal, src_id, AllocFlags::NO_NEWPAGE)
                .ok()?;
            if chunk >= page_start && chunk < page_end {
                // SAFETY: `chunk` was just popped from the freelist by
                // `do_alloc`, exclusively owned here.
                unsafe { owner.mark_claimed_for_move(chunk) };
                state.rebalance.inline_reclaim += 1;
                continue;
            }
            return Some(chunk);
        }
    }

    /// Called when the scan cursor reaches `page_end`. Restarts the pass if
    /// any chunk was busy/locked, otherwise runs Finish. Returns whether
    /// Finish ran (job complete).
    fn maybe_finish_pass(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.rebalance.busy_items > 0 {
            self.rebalance_stats
                .busy_items
                .fetch_add(state.rebalance.busy_items, Ordering::Relaxed);
            state.rebalance.cursor = state.rebalance.page_start;
            state.rebalance.busy_items = 0;
            false
        } else {
            state.rebalance.done = true;
            drop(state);
            self.rebalance_finish();
            true
        }
    }

    /// S3: transfers the vacated page to `dst_id`, publishes cumulative
    /// stats, and returns the slot to idle.
    fn rebalance_finish(&self) {
        let mut state = self.state.lock().unwrap();
        let src_id = state.rebalance.src_id;
        let dst_id = state.rebalance.dst_id;
        let page_start = state.rebalance.page_start.expect("finish requires an active scan");

        state.table.classes[src_id as usize].pages.remove(0);

        if dst_id == GLOBAL_PAGE_POOL {
            state.table.classes[GLOBAL_PAGE_POOL as usize].pages.push(page_start);
        } else {
            let page_size = self.config.item_size_max;
            // SAFETY: `page_start` is a whole page no longer referenced by
            // `src_id` (just removed above) and not yet visible to `dst_id`.
            unsafe { std::ptr::write_bytes(page_start, 0, page_size) };
            let (chunk_size, per_page) = {
                let class = &state.table.classes[dst_id as usize];
                (class.chunk_size, class.per_page)
            };
            for i in 0..per_page {
                // SAFETY: each stride stays within the zeroed page.
                let chunk = unsafe { page_start.add(i * chunk_size) };
                self.do_free(&mut state, chunk, 0, dst_id);
            }
            state.table.classes[dst_id as usize].pages.push(page_start);
        }

        self.rebalance_stats.slabs_moved.fetch_add(1, Ordering::Relaxed);
        self.rebalance_stats
            .rescues
            .fetch_add(state.rebalance.rescues, Ordering::Relaxed);
        self.rebalance_stats
            .evictions_nomem
            .fetch_add(state.rebalance.evictions_nomem, Ordering::Relaxed);
        self.rebalance_stats
            .inline_reclaim
            .fetch_add(state.rebalance.inline_reclaim, Ordering::Relaxed);

        info!(src = src_id, dst = dst_id, "rebalance finished");
        state.rebalance = RebalanceSlot::idle();
    }
}
