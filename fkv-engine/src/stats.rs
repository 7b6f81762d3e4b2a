//! # Statistics Snapshots
//!
//! Read-only counter snapshots exposed to the command layer. Plain structs,
//! captured at a point in time; no atomics are needed because the core is
//! single-threaded.

use serde::Serialize;

/// Per-tier slab gauges.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TierStats {
    pub nslab: u32,
    pub nfree: u32,
    pub nfull: u32,
    /// Partial and hot slabs; always zero for the disk tier.
    pub npartial: u32,
}

/// Item index gauges.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IndexStats {
    /// Total entries in the arena.
    pub nalloc: u64,
    /// Entries on the free pool.
    pub nfree: u64,
    /// Entries installed in buckets.
    pub nused: u64,
}

/// Per-class counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ClassStats {
    pub cid: u8,
    pub size: u32,
    pub nitem: u32,
    pub nmslab: u32,
    pub ndslab: u32,
    pub nevict: u64,
    pub nused_item: u64,
}

/// Full snapshot of one cache instance.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Disk slabs evicted since init.
    pub nevict: u64,
    /// Memory slabs drained to disk since init.
    pub nflush: u64,
    pub index: IndexStats,
    pub mem: TierStats,
    pub disk: TierStats,
    pub classes: Vec<ClassStats>,
}
