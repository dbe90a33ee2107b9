//! Allocator configuration: the tunables named in the external interfaces,
//! with environment-variable overrides read once at build time.

use crate::error::ConfigError;

/// Byte alignment required of every chunk size.
pub const CHUNK_ALIGN_BYTES: usize = 8;

/// Practical ceiling on `item_size_max` (and therefore page size).
pub const ITEM_SIZE_MAX_CEILING: usize = 128 * 1024 * 1024;

/// Configuration for a [`crate::allocator::SlabAllocator`].
///
/// Construct via [`Config::builder`]; validation happens in
/// [`ConfigBuilder::build`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Hard cap on allocator-issued memory, in bytes.
    pub memory_limit: usize,
    /// Chunk-size growth ratio between successive size classes.
    pub factor: f64,
    /// Base payload size added to the item header for size class 1.
    pub chunk_size: usize,
    /// Page size and largest chunk size.
    pub item_size_max: usize,
    /// If set, reserve one contiguous block of `memory_limit` bytes at startup.
    pub prealloc: bool,
    /// Enables the rebalance worker; also forces full-page allocation.
    pub slab_reassign: bool,
    /// Surfaced only via stats; an external automove policy thread reads this.
    pub slab_automove: i32,
    /// Seeds the allocator's running "bytes malloced" counter, for tests.
    /// Overridden by the `T_MEMD_INITIAL_MALLOC` environment variable.
    pub initial_malloc: usize,
    /// Number of chunks the rebalance worker scans per pass.
    /// Overridden by the `MEMCACHED_SLAB_BULK_CHECK` environment variable.
    pub slab_bulk_check: usize,
}

impl Config {
    /// Starts building a [`Config`] from the given required fields.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for [`Config`]; applies defaults and environment overrides, then
/// validates on [`ConfigBuilder::build`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    memory_limit: usize,
    factor: f64,
    chunk_size: usize,
    item_size_max: usize,
    prealloc: bool,
    slab_reassign: bool,
    slab_automove: i32,
    initial_malloc: Option<usize>,
    slab_bulk_check: Option<usize>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024,
            factor: 1.25,
            chunk_size: 48,
            item_size_max: 1024 * 1024,
            prealloc: false,
            slab_reassign: false,
            slab_automove: 0,
            initial_malloc: None,
            slab_bulk_check: None,
        }
    }
}

impl ConfigBuilder {
    /// Sets the hard memory cap.
    #[must_use]
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Sets the chunk-size growth ratio.
    #[must_use]
    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Sets the base chunk payload size for class 1.
    #[must_use]
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Sets the page size / largest chunk size.
    #[must_use]
    pub fn item_size_max(mut self, bytes: usize) -> Self {
        self.item_size_max = bytes;
        self
    }

    /// Enables or disables upfront contiguous preallocation.
    #[must_use]
    pub fn prealloc(mut self, enabled: bool) -> Self {
        self.prealloc = enabled;
        self
    }

    /// Enables or disables the rebalance worker and full-page allocation.
    #[must_use]
    pub fn slab_reassign(mut self, enabled: bool) -> Self {
        self.slab_reassign = enabled;
        self
    }

    /// Sets the automove policy level (surfaced only via stats).
    #[must_use]
    pub fn slab_automove(mut self, level: i32) -> Self {
        self.slab_automove = level;
        self
    }

    /// Overrides the per-scan rebalance chunk count (test hook).
    #[must_use]
    pub fn slab_bulk_check(mut self, count: usize) -> Self {
        self.slab_bulk_check = Some(count);
        self
    }

    /// Validates the accumulated settings, applies environment overrides,
    /// and produces a [`Config`].
    pub fn build(self) -> Result<Config, ConfigError> {
        if !(self.factor > 1.0) {
            return Err(ConfigError::InvalidFactor(self.factor.to_string()));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize);
        }
        if self.item_size_max == 0
            || self.item_size_max % CHUNK_ALIGN_BYTES != 0
            || self.item_size_max > ITEM_SIZE_MAX_CEILING
        {
            return Err(ConfigError::InvalidItemSizeMax {
                got: self.item_size_max,
                align: CHUNK_ALIGN_BYTES,
                max: ITEM_SIZE_MAX_CEILING,
            });
        }

        let initial_malloc = self.initial_malloc.or_else(|| {
            std::env::var("T_MEMD_INITIAL_MALLOC")
                .ok()
                .and_then(|v| v.parse().ok())
        });
        let slab_bulk_check = self.slab_bulk_check.or_else(|| {
            std::env::var("MEMCACHED_SLAB_BULK_CHECK")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n: &usize| n != 0)
        });

        Ok(Config {
            memory_limit: self.memory_limit,
            factor: self.factor,
            chunk_size: self.chunk_size,
            item_size_max: self.item_size_max,
            prealloc: self.prealloc,
            slab_reassign: self.slab_reassign,
            slab_automove: self.slab_automove,
            initial_malloc: initial_malloc.unwrap_or(0),
            slab_bulk_check: slab_bulk_check.unwrap_or(1),
        })
    }
}
