//! # Cache Configuration
//!
//! Declarative configuration for a cache instance: index sizing, slab
//! geometry, the slab-class size profile, and the shard of the SSD this
//! instance owns.
//!
//! ## Usage
//!
//! - `CacheConfig::default()` gives production-shaped defaults (1 MiB slabs,
//!   a 1.25-factor size profile); point `ssd_device` at a raw device or a
//!   preallocated file before use.
//! - `CacheConfig::from_json_file` loads the same structure from JSON.
//! - `validate()` runs every check that does not require opening the device;
//!   device-relative checks (shard count vs. device size) happen at engine
//!   init.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FkvError, FkvResult};

/// Sector granularity the raw device is addressed in. Slab size and all
/// disk reads are aligned to this.
pub const SECTOR_SIZE: usize = 512;

/// Highest number of slab classes a profile may declare (cids are u8 with
/// one invalid sentinel reserved).
pub const SLABCLASS_MAX_IDS: usize = 255;

/// Configuration for one cache instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Index table has `2^hash_power` buckets.
    pub hash_power: u8,
    /// Bytes reserved for the item index entry arena.
    pub max_index_memory: usize,
    /// Target size of the memory slab tier in bytes.
    pub max_slab_memory: usize,
    /// Slab granularity in bytes; must be a multiple of [`SECTOR_SIZE`].
    pub slab_size: usize,
    /// Ascending item sizes, one per slab class, indexed by cid.
    pub profile: Vec<u32>,
    /// Path to the raw block device (or a preallocated file).
    pub ssd_device: PathBuf,
    /// Total number of server instances sharing the device.
    pub server_n: u32,
    /// This instance's shard id in `[0, server_n)`.
    pub server_id: u32,
    /// Reported in stats output only; informational.
    pub chunk_size: usize,
    /// Open the device with O_DIRECT. Disable to run against a regular
    /// file on filesystems that reject direct I/O.
    pub direct_io: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let slab_size = 1024 * 1024;
        CacheConfig {
            hash_power: 20,
            max_index_memory: 64 * 1024 * 1024,
            max_slab_memory: 64 * 1024 * 1024,
            slab_size,
            profile: profile_from_factor(88, 1.25, (slab_size / 8) as u32),
            ssd_device: PathBuf::new(),
            server_n: 1,
            server_id: 0,
            chunk_size: 88,
            direct_io: true,
        }
    }
}

impl CacheConfig {
    /// Loads a configuration from a JSON file. Missing fields fall back to
    /// the defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> FkvResult<Self> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|err| FkvError::BadConfig(format!("config parse failed: {err}")))
    }

    /// Checks every constraint that can be verified without the device.
    pub fn validate(&self) -> FkvResult<()> {
        if self.ssd_device.as_os_str().is_empty() {
            return Err(FkvError::BadConfig("ssd device must be specified".into()));
        }
        if self.hash_power == 0 || self.hash_power > 32 {
            return Err(FkvError::BadConfig(format!(
                "hash_power {} outside 1..=32",
                self.hash_power
            )));
        }
        if self.slab_size == 0 || self.slab_size % SECTOR_SIZE != 0 {
            return Err(FkvError::BadConfig(format!(
                "slab_size {} is not a positive multiple of {SECTOR_SIZE}",
                self.slab_size
            )));
        }
        if self.profile.is_empty() {
            return Err(FkvError::BadConfig("slab profile is empty".into()));
        }
        if self.profile.len() > SLABCLASS_MAX_IDS {
            return Err(FkvError::BadConfig(format!(
                "slab profile declares {} classes, limit is {SLABCLASS_MAX_IDS}",
                self.profile.len()
            )));
        }
        if !self.profile.windows(2).all(|pair| pair[0] < pair[1]) {
            return Err(FkvError::BadConfig(
                "slab profile sizes must be strictly ascending".into(),
            ));
        }
        if self.server_n == 0 {
            return Err(FkvError::BadConfig("server_n must be at least 1".into()));
        }
        if self.server_id >= self.server_n {
            return Err(FkvError::BadConfig(format!(
                "server_id {} outside 0..{}",
                self.server_id, self.server_n
            )));
        }
        if self.max_index_memory == 0 {
            return Err(FkvError::BadConfig("max_index_memory must be non-zero".into()));
        }
        Ok(())
    }
}

/// Builds an ascending slab-class profile by growing `min_size` by `factor`
/// until `max_size`. The final class is clamped to exactly `max_size` so the
/// largest storable item is predictable.
pub fn profile_from_factor(min_size: u32, factor: f64, max_size: u32) -> Vec<u32> {
    assert!(min_size > 0 && factor > 1.0 && max_size >= min_size);

    let mut profile = Vec::new();
    let mut size = min_size;
    while size < max_size && profile.len() < SLABCLASS_MAX_IDS - 1 {
        profile.push(size);
        // Round to 8 bytes so item starts stay aligned.
        let next = ((size as f64 * factor) as u32 + 7) & !7;
        size = next.max(size + 8);
    }
    profile.push(max_size);
    profile
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> CacheConfig {
        CacheConfig {
            ssd_device: PathBuf::from("/tmp/fkv-test-device"),
            ..CacheConfig::default()
        }
    }

    #[test]
    fn default_profile_is_ascending() {
        let config = valid();
        assert!(config.profile.windows(2).all(|pair| pair[0] < pair[1]));
        config.validate().unwrap();
    }

    #[test]
    fn rejects_missing_device() {
        let config = CacheConfig::default();
        assert!(matches!(config.validate(), Err(FkvError::BadConfig(_))));
    }

    #[test]
    fn rejects_unaligned_slab_size() {
        let config = CacheConfig {
            slab_size: 4096 + 13,
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_descending_profile() {
        let config = CacheConfig {
            profile: vec![128, 64],
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_shard_id_out_of_range() {
        let config = CacheConfig {
            server_n: 2,
            server_id: 2,
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn factor_profile_ends_at_max() {
        let profile = profile_from_factor(88, 1.25, 8192);
        assert_eq!(*profile.last().unwrap(), 8192);
        assert!(profile.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
