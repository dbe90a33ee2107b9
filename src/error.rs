//! Error types for the slab allocator and rebalance coordinator.

use std::fmt;

/// Errors returned by the chunk allocator (`alloc`, `free`, `new_page`).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AllocError {
    /// The requested size class id is outside `[1, power_largest]`.
    InvalidClass(u32),

    /// A new page could not be obtained: the memory limit was reached and
    /// neither the class nor the global pool had spare pages.
    OutOfMemory(u32),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidClass(id) => write!(f, "invalid size class id {id}"),
            Self::OutOfMemory(id) => write!(f, "out of memory acquiring a new page for class {id}"),
        }
    }
}

impl std::error::Error for AllocError {}

/// Result of a `reassign` request, mirroring the source's `reassign_result_type`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ReassignError {
    /// A rebalance is already in progress.
    Running,

    /// `src` and `dst` named the same class.
    SrcDstSame(u32),

    /// `src` or `dst` named a class outside the valid range.
    BadClass {
        /// The requested source class id.
        src: i32,
        /// The requested destination class id.
        dst: i32,
    },

    /// The source class has fewer than two pages; donating one would leave
    /// it unable to satisfy its existing items.
    NoSpare(u32),
}

impl fmt::Display for ReassignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "a rebalance is already running"),
            Self::SrcDstSame(id) => write!(f, "source and destination class are the same ({id})"),
            Self::BadClass { src, dst } => {
                write!(f, "invalid source or destination class (src={src}, dst={dst})")
            }
            Self::NoSpare(id) => write!(f, "source class {id} has no spare page to donate"),
        }
    }
}

impl std::error::Error for ReassignError {}

/// Errors raised while building or validating a [`crate::config::Config`].
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ConfigError {
    /// `factor` must be strictly greater than 1.0.
    InvalidFactor(String),

    /// `item_size_max` must be a positive multiple of the alignment and
    /// within the practical page-size ceiling.
    InvalidItemSizeMax {
        /// The offending value.
        got: usize,
        /// The required alignment.
        align: usize,
        /// The practical ceiling (128 MiB).
        max: usize,
    },

    /// `chunk_size` (the base payload size) must be nonzero.
    InvalidChunkSize,

    /// Preallocating the single contiguous memory region failed at startup.
    /// The source treats this as fatal and aborts the process; this crate
    /// instead returns it as a normal error so a library caller can decide.
    PreallocFailure {
        /// The number of bytes that were requested.
        requested: usize,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFactor(got) => write!(f, "growth factor must be > 1.0, got {got}"),
            Self::InvalidItemSizeMax { got, align, max } => {
                write!(f, "item_size_max must be a multiple of {align} and <= {max}, got {got}")
            }
            Self::InvalidChunkSize => write!(f, "chunk_size must be > 0"),
            Self::PreallocFailure { requested } => {
                write!(f, "failed to preallocate {requested} bytes for the slab arena")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
