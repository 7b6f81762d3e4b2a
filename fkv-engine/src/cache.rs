//! # Cache Facade
//!
//! Byte-level set/get/delete surface over the index and the slab pool,
//! the contract the command layer programs against. Keys are digested
//! here; everything below works on digests only.
//!
//! Overwrites are treated as hot writes: a key that already exists is
//! removed and its replacement is allocated from the class's dedicated
//! hot slab, which keeps churned keys from fragmenting the general
//! partial slabs.
//!
//! Expiry is lazy. An expired entry found on any access is removed through
//! the same path as an explicit delete (hole push, counter settle) and
//! reported as absent.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use fkv_common::{CacheConfig, Clock, Digest, FkvError, FkvResult, SystemClock};

use crate::index::{IndexEntry, ItemIndex};
use crate::item::{write_item, ItemHeader, MAX_KEY_LEN};
use crate::pool::SlabPool;
use crate::stats::{CacheStats, IndexStats};

/// Result of a compare-and-swap store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// Value stored; the token matched.
    Stored,
    /// Key exists with a different token; nothing stored.
    Exists,
    /// Key is absent or expired; nothing stored.
    NotFound,
}

/// One cache instance: item index, slab pool, clock, and the cas counter.
pub struct SlabCache {
    index: ItemIndex,
    pool: SlabPool,
    clock: Arc<dyn Clock>,
    next_cas: u64,
}

impl SlabCache {
    /// Opens the device and builds a cache instance on the system clock.
    pub fn new(config: &CacheConfig) -> FkvResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// As [`SlabCache::new`] with an injected clock.
    pub fn with_clock(config: &CacheConfig, clock: Arc<dyn Clock>) -> FkvResult<Self> {
        config.validate()?;
        let device = crate::device::SlabDevice::open(config)?;
        let pool = SlabPool::new(config, device)?;
        let index = ItemIndex::new(config.hash_power, config.max_index_memory)?;
        debug!(
            hash_power = config.hash_power,
            chunk_size = config.chunk_size,
            server_id = config.server_id,
            server_n = config.server_n,
            "cache initialized"
        );

        Ok(SlabCache {
            index,
            pool,
            clock,
            next_cas: 0,
        })
    }

    /// Stores a key/value pair. `expiry` is absolute seconds since epoch;
    /// 0 never expires. Returns the cas token assigned to the item.
    pub fn set(&mut self, key: &[u8], value: &[u8], expiry: u32) -> FkvResult<u64> {
        let cas = self.bump_cas();
        self.store(key, value, expiry, cas)?;
        Ok(cas)
    }

    /// Looks up a key and returns its value.
    pub fn get(&mut self, key: &[u8]) -> FkvResult<Option<Bytes>> {
        Ok(self.get_entry(key)?.map(|(value, _)| value))
    }

    /// Looks up a key and returns its value together with the cas token.
    pub fn gets(&mut self, key: &[u8]) -> FkvResult<Option<(Bytes, u64)>> {
        self.get_entry(key)
    }

    /// Compare-and-swap store: succeeds only while the stored token still
    /// equals `token`.
    pub fn cas(
        &mut self,
        key: &[u8],
        value: &[u8],
        expiry: u32,
        token: u64,
    ) -> FkvResult<CasOutcome> {
        let digest = Digest::of_key(key);
        let hash = digest.fingerprint();

        let Some(entry) = self.live_entry(hash, &digest) else {
            return Ok(CasOutcome::NotFound);
        };
        if entry.cas != token {
            return Ok(CasOutcome::Exists);
        }

        let cas = self.bump_cas();
        self.store(key, value, expiry, cas)?;
        Ok(CasOutcome::Stored)
    }

    /// Deletes a key. Returns whether a live entry was removed; expired
    /// entries are reaped but reported as absent.
    pub fn delete(&mut self, key: &[u8]) -> FkvResult<bool> {
        let digest = Digest::of_key(key);
        let hash = digest.fingerprint();

        let Some(entry) = self.index.lookup(hash, &digest) else {
            return Ok(false);
        };
        let live = !self.expired(&entry);
        self.index.remove(hash, &digest);
        self.pool.reclaim_slot(entry.sid, entry.offset);
        Ok(live)
    }

    /// Point-in-time counter snapshot.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            nevict: self.pool.nevict(),
            nflush: self.pool.nflush(),
            index: IndexStats {
                nalloc: self.index.nalloc(),
                nfree: self.index.nfree(),
                nused: self.index.nused(),
            },
            mem: self.pool.mem_stats(),
            disk: self.pool.disk_stats(),
            classes: self.pool.class_stats(),
        }
    }

    fn bump_cas(&mut self) -> u64 {
        self.next_cas += 1;
        self.next_cas
    }

    fn expired(&self, entry: &IndexEntry) -> bool {
        entry.expiry != 0 && entry.expiry < self.clock.now_secs()
    }

    /// Lookup that reaps an expired entry on the way, exactly like a
    /// delete would.
    fn live_entry(&mut self, hash: u32, digest: &Digest) -> Option<IndexEntry> {
        let entry = self.index.lookup(hash, digest)?;
        if self.expired(&entry) {
            trace!(sid = entry.sid, "expired entry reaped on access");
            self.index.remove(hash, digest);
            self.pool.reclaim_slot(entry.sid, entry.offset);
            return None;
        }
        Some(entry)
    }

    fn get_entry(&mut self, key: &[u8]) -> FkvResult<Option<(Bytes, u64)>> {
        let digest = Digest::of_key(key);
        let hash = digest.fingerprint();

        let Some(entry) = self.live_entry(hash, &digest) else {
            return Ok(None);
        };

        let view = self.pool.read_item(entry.sid, entry.offset)?;
        debug_assert_eq!(&view.header.digest, &digest, "index and item digest diverged");
        let value = Bytes::copy_from_slice(view.value);
        Ok(Some((value, entry.cas)))
    }

    fn store(&mut self, key: &[u8], value: &[u8], expiry: u32, cas: u64) -> FkvResult<()> {
        if key.len() > MAX_KEY_LEN {
            return Err(FkvError::KeyTooLong {
                len: key.len(),
                max: MAX_KEY_LEN,
            });
        }
        let total = ItemHeader::total_size(key.len(), value.len());
        let cid = self
            .pool
            .cid_for_size(total)
            .ok_or(FkvError::ItemTooLarge { size: total })?;

        let digest = Digest::of_key(key);
        let hash = digest.fingerprint();

        // An overwrite removes the old entry up front (the index insert
        // precondition) and routes the new copy to the class's hot slab.
        let is_hot = match self.index.remove(hash, &digest) {
            Some(old) => {
                self.pool.reclaim_slot(old.sid, old.offset);
                true
            }
            None => false,
        };

        let slot = self.pool.get_item(cid, is_hot, &mut self.index)?;
        let header = ItemHeader {
            sid: slot.sid,
            offset: slot.offset,
            cid,
            nkey: key.len() as u8,
            ndata: value.len() as u32,
            expiry,
            cas,
            digest,
        };
        write_item(self.pool.item_slot_mut(slot, total), &header, key, value);

        self.index
            .insert(hash, &digest, slot.sid, slot.offset, expiry, cas);
        self.pool.account_insert(slot.sid);
        trace!(sid = slot.sid, offset = slot.offset, is_hot, "item stored");
        Ok(())
    }
}

/// Cloneable handle that serializes callers onto one cache instance. The
/// core stays single-threaded; the mutex only admits one operation at a
/// time.
#[derive(Clone)]
pub struct SharedCache {
    inner: Arc<Mutex<SlabCache>>,
}

impl SharedCache {
    pub fn new(cache: SlabCache) -> Self {
        SharedCache {
            inner: Arc::new(Mutex::new(cache)),
        }
    }

    pub fn set(&self, key: &[u8], value: &[u8], expiry: u32) -> FkvResult<u64> {
        self.inner.lock().set(key, value, expiry)
    }

    pub fn get(&self, key: &[u8]) -> FkvResult<Option<Bytes>> {
        self.inner.lock().get(key)
    }

    pub fn gets(&self, key: &[u8]) -> FkvResult<Option<(Bytes, u64)>> {
        self.inner.lock().gets(key)
    }

    pub fn cas(&self, key: &[u8], value: &[u8], expiry: u32, token: u64) -> FkvResult<CasOutcome> {
        self.inner.lock().cas(key, value, expiry, token)
    }

    pub fn delete(&self, key: &[u8]) -> FkvResult<bool> {
        self.inner.lock().delete(key)
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config(file: &tempfile::NamedTempFile) -> CacheConfig {
        file.as_file().set_len(4 * 4096).unwrap();
        CacheConfig {
            hash_power: 8,
            max_index_memory: 64 * 1024,
            max_slab_memory: 2 * 4096,
            slab_size: 4096,
            profile: vec![64, 128, 256],
            ssd_device: PathBuf::from(file.path()),
            direct_io: false,
            ..CacheConfig::default()
        }
    }

    fn cache() -> (tempfile::NamedTempFile, SlabCache) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let cache = SlabCache::new(&config(&file)).unwrap();
        (file, cache)
    }

    #[test]
    fn set_get_round_trip() {
        let (_file, mut cache) = cache();
        cache.set(b"alpha", b"value", 0).unwrap();
        let value = cache.get(b"alpha").unwrap().unwrap();
        assert_eq!(&*value, b"value");
        assert!(cache.get(b"missing").unwrap().is_none());
    }

    #[test]
    fn delete_removes_key() {
        let (_file, mut cache) = cache();
        cache.set(b"alpha", b"value", 0).unwrap();
        assert!(cache.delete(b"alpha").unwrap());
        assert!(cache.get(b"alpha").unwrap().is_none());
        assert!(!cache.delete(b"alpha").unwrap());
    }

    #[test]
    fn overwrite_returns_latest_value() {
        let (_file, mut cache) = cache();
        cache.set(b"alpha", b"one", 0).unwrap();
        cache.set(b"alpha", b"two", 0).unwrap();
        let value = cache.get(b"alpha").unwrap().unwrap();
        assert_eq!(&*value, b"two");
        // One live item, not two.
        let used: u64 = cache.stats().classes.iter().map(|c| c.nused_item).sum();
        assert_eq!(used, 1);
    }

    #[test]
    fn overwrite_allocates_from_the_hot_slab() {
        let (_file, mut cache) = cache();
        cache.set(b"alpha", b"one", 0).unwrap();
        assert!(cache.stats().classes[0].nmslab == 1);

        // The overwrite routes to a hot slab, which is a second memory
        // slab of the same class.
        cache.set(b"alpha", b"two", 0).unwrap();
        assert_eq!(cache.stats().classes[0].nmslab, 2);
        assert_eq!(cache.stats().mem.npartial, 2);
    }

    #[test]
    fn cas_enforces_the_token() {
        let (_file, mut cache) = cache();
        cache.set(b"alpha", b"one", 0).unwrap();
        let (_, token) = cache.gets(b"alpha").unwrap().unwrap();

        assert_eq!(
            cache.cas(b"alpha", b"two", 0, token + 1).unwrap(),
            CasOutcome::Exists
        );
        assert_eq!(
            cache.cas(b"alpha", b"two", 0, token).unwrap(),
            CasOutcome::Stored
        );
        assert_eq!(&*cache.get(b"alpha").unwrap().unwrap(), b"two");

        assert_eq!(
            cache.cas(b"missing", b"x", 0, 1).unwrap(),
            CasOutcome::NotFound
        );
    }

    #[test]
    fn values_pick_the_smallest_fitting_class() {
        let (_file, mut cache) = cache();
        cache.set(b"small", b"x", 0).unwrap();
        cache.set(b"large", &[7u8; 150], 0).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.classes[0].nused_item, 1);
        assert_eq!(stats.classes[2].nused_item, 1);
        assert_eq!(&*cache.get(b"large").unwrap().unwrap(), &[7u8; 150][..]);
    }

    #[test]
    fn oversized_item_is_rejected() {
        let (_file, mut cache) = cache();
        let err = cache.set(b"huge", &[0u8; 4096], 0).unwrap_err();
        assert!(matches!(err, FkvError::ItemTooLarge { .. }));

        let err = cache.set(&[0u8; 300], b"v", 0).unwrap_err();
        assert!(matches!(err, FkvError::KeyTooLong { .. }));
    }

    #[test]
    fn expired_entry_reads_as_absent_and_frees_its_slot() {
        let clock = Arc::new(fkv_common::ManualClock::new(1_000));
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut cache = SlabCache::with_clock(&config(&file), clock.clone()).unwrap();

        cache.set(b"alpha", b"value", 1_001).unwrap();
        assert!(cache.get(b"alpha").unwrap().is_some());
        let free_before = cache.stats().index.nfree;

        clock.advance(2);
        assert!(cache.get(b"alpha").unwrap().is_none());
        assert_eq!(cache.stats().index.nfree, free_before + 1);
        assert_eq!(cache.stats().classes[0].nused_item, 0);
    }

    #[test]
    fn shared_handle_round_trips() {
        let (_file, cache) = cache();
        let shared = SharedCache::new(cache);
        let other = shared.clone();

        shared.set(b"alpha", b"value", 0).unwrap();
        assert_eq!(&*other.get(b"alpha").unwrap().unwrap(), b"value");
        assert!(other.delete(b"alpha").unwrap());
    }
}
