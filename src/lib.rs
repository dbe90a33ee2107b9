//! # `slabkv` — a slab-based memory manager for an in-memory key/value cache
//!
//! Carves a fixed memory budget into fixed-size pages, subdivides each page
//! into equally sized chunks belonging to a *size class*, and hands chunks
//! out as backing storage for variable-sized records. A background worker
//! can reassign a page from one size class to another — evicting or
//! relocating any live items it holds — while foreground allocation
//! continues uninterrupted.
//!
//! The hash table, LRU, and per-item locking that give chunks meaning as
//! cache entries live outside this crate; embedders implement the
//! [`ItemOwner`] trait to let the rebalance worker cooperate with them.
//!
//! ## Example
//!
//! ```rust
//! use slabkv::{AllocFlags, Config, SlabAllocator};
//!
//! let config = Config::builder()
//!     .memory_limit(64 * 1024 * 1024)
//!     .factor(1.25)
//!     .chunk_size(48)
//!     .item_size_max(1024 * 1024)
//!     .build()
//!     .unwrap();
//! let allocator = SlabAllocator::new(config).unwrap();
//!
//! let class = 3;
//! let chunk = allocator.alloc(64, class, AllocFlags::NONE).unwrap();
//! allocator.free(chunk, 64, class);
//! ```

#![warn(missing_docs, clippy::all)]
#![allow(clippy::module_name_repetitions)]

mod allocator;
mod cache_padded;
pub mod config;
pub mod error;
pub mod item;
pub mod page_source;
mod rebalance;
mod size_class;
pub mod stats;

mod freelist;

pub use allocator::{AllocFlags, AvailableChunks, SlabAllocator};
pub use config::{Config, ConfigBuilder};
pub use error::{AllocError, ConfigError, ReassignError};
pub use item::{ChunkPtr, ItemFlags, ItemLockGuard, ItemOwner, ScanOutcome};
pub use page_source::{PageSource, PreallocArena, PreallocPageSource, SystemPageSource};
pub use rebalance::{RebalanceStats, RebalancerPauseGuard};
pub use size_class::{GLOBAL_PAGE_POOL, POWER_SMALLEST};
pub use stats::{ClassStats, Stats};
