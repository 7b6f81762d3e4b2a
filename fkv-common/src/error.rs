//! # Error Types
//!
//! Shared error enum and result alias for the FlashKV crates.
//!
//! Recoverable failures (I/O, configuration, oversized items) are expressed
//! as `FkvError`. Corruption-class failures (slab magic mismatch, sid out of
//! range, queue accounting gone wrong) are programming errors and are
//! expressed with assertions that terminate the process instead.

use thiserror::Error;

/// Result alias used across the workspace.
pub type FkvResult<T> = Result<T, FkvError>;

/// Errors surfaced by the cache core.
#[derive(Debug, Error)]
pub enum FkvError {
    /// Arena or table allocation failed at init.
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    /// A positional read or write against the block device failed or came
    /// up short.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration rejected at init time.
    #[error("bad configuration: {0}")]
    BadConfig(String),

    /// Key longer than the on-slab length field can describe.
    #[error("key of {len} bytes exceeds the {max} byte limit")]
    KeyTooLong { len: usize, max: usize },

    /// Item larger than the largest configured slab class.
    #[error("item of {size} bytes does not fit any slab class")]
    ItemTooLarge { size: usize },

    /// The item index is exhausted and no full disk slab remains to evict.
    #[error("item index exhausted and no disk slab is evictable")]
    IndexFull,
}
