//! # Item Index
//!
//! Maps a 20-byte key digest to the physical location of its item, `(sid,
//! data-relative offset)`, plus expiry and cas. Entries live in one arena
//! reserved at init; all links are arena indexes, never pointers, so the
//! structure stays packed and safe.
//!
//! ## Structure Overview
//!
//! ```text
//! ItemIndex
//!   ├── table: Vec<Bucket>            2^hash_power buckets
//!   │     └── Bucket { head, queries }  singly linked entry chain
//!   ├── entries: Vec<ItemX>           fixed arena, capacity from config
//!   └── free_head                     free pool threaded through `next`
//! ```
//!
//! ## HotRing chains
//!
//! Each bucket is an intrusive singly linked chain with a per-bucket query
//! counter. Every `HR_QUERY_THRESHOLD`-th successful non-head lookup
//! promotes the matched entry to the chain head, so a bucket's hottest
//! digest migrates to the front without per-hit reordering. New entries are
//! inserted at position 1 (directly behind the head) and only become the
//! head through repeated access.

use fkv_common::{Digest, FkvError, FkvResult};
use tracing::trace;

use crate::NONE;

/// Successful non-head lookups in one bucket before the match is promoted
/// to chain head.
pub const HR_QUERY_THRESHOLD: u8 = 5;

/// One index entry. `next` threads both the bucket chain and the free
/// pool; a free entry's payload is stale and never read.
#[derive(Clone, Copy)]
struct ItemX {
    digest: [u8; 20],
    sid: u32,
    offset: u32,
    expiry: u32,
    cas: u64,
    next: u32,
}

impl ItemX {
    const fn vacant() -> ItemX {
        ItemX {
            digest: [0; 20],
            sid: 0,
            offset: 0,
            expiry: 0,
            cas: 0,
            next: NONE,
        }
    }
}

/// Chain head plus the HotRing reposition counter.
struct Bucket {
    head: u32,
    queries: u8,
}

/// Payload of an index entry, returned to callers by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub sid: u32,
    pub offset: u32,
    pub expiry: u32,
    pub cas: u64,
}

/// Digest-to-location index with HotRing bucket chains.
pub struct ItemIndex {
    table: Vec<Bucket>,
    mask: u32,
    entries: Vec<ItemX>,
    free_head: u32,
    nfree: u64,
    nused: u64,
}

impl ItemIndex {
    /// Builds the bucket table and the entry arena. Arena capacity is
    /// `max_index_memory / sizeof(entry)`.
    pub fn new(hash_power: u8, max_index_memory: usize) -> FkvResult<Self> {
        assert!(hash_power >= 1 && hash_power <= 32);

        let nbucket = 1usize << hash_power;
        let nentry = max_index_memory / std::mem::size_of::<ItemX>();
        if nentry == 0 || nentry as u64 >= NONE as u64 {
            return Err(FkvError::OutOfMemory("item index arena"));
        }

        let mut table = Vec::with_capacity(nbucket);
        table.resize_with(nbucket, || Bucket {
            head: NONE,
            queries: 0,
        });

        // Thread the whole arena onto the free pool, matching init order:
        // entry 0 ends up at the head.
        let mut entries = vec![ItemX::vacant(); nentry];
        for (i, entry) in entries.iter_mut().enumerate() {
            entry.next = if i + 1 < nentry { i as u32 + 1 } else { NONE };
        }

        Ok(ItemIndex {
            table,
            mask: (nbucket - 1) as u32,
            entries,
            free_head: 0,
            nfree: nentry as u64,
            nused: 0,
        })
    }

    /// Total entries in the arena.
    pub fn nalloc(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Entries currently on the free pool.
    pub fn nfree(&self) -> u64 {
        self.nfree
    }

    /// Entries currently installed in buckets.
    pub fn nused(&self) -> u64 {
        self.nused
    }

    /// True when an insert would find no free entry. The allocator must
    /// evict before letting an insert proceed in this state.
    pub fn pool_is_empty(&self) -> bool {
        self.free_head == NONE
    }

    #[inline]
    fn bucket_of(&self, hash: u32) -> usize {
        (hash & self.mask) as usize
    }

    /// Looks up a digest. A match on a non-head entry bumps the bucket's
    /// query counter; the counter reaching [`HR_QUERY_THRESHOLD`] promotes
    /// that entry to the chain head and resets the counter. Head matches
    /// and misses leave the counter untouched.
    pub fn lookup(&mut self, hash: u32, digest: &Digest) -> Option<IndexEntry> {
        let slot = self.bucket_of(hash);
        let head = self.table[slot].head;
        if head == NONE {
            return None;
        }

        if &self.entries[head as usize].digest == digest.as_bytes() {
            return Some(self.payload(head));
        }

        let promote = self.table[slot].queries == HR_QUERY_THRESHOLD - 1;
        let mut pred = head;
        let mut cur = self.entries[head as usize].next;
        while cur != NONE {
            if &self.entries[cur as usize].digest == digest.as_bytes() {
                if promote {
                    // Re-head the match, keeping the rest of the chain
                    // intact: predecessor adopts the match's successor.
                    self.entries[pred as usize].next = self.entries[cur as usize].next;
                    self.entries[cur as usize].next = head;
                    self.table[slot].head = cur;
                    self.table[slot].queries = 0;
                    trace!(hash, "hotring promoted entry to bucket head");
                } else {
                    self.table[slot].queries += 1;
                }
                return Some(self.payload(cur));
            }
            pred = cur;
            cur = self.entries[cur as usize].next;
        }

        None
    }

    /// Installs a new entry at chain position 1. The caller must have
    /// verified the digest is absent; a duplicate insert corrupts lookups.
    pub fn insert(
        &mut self,
        hash: u32,
        digest: &Digest,
        sid: u32,
        offset: u32,
        expiry: u32,
        cas: u64,
    ) {
        assert!(!self.pool_is_empty(), "item index pool exhausted");
        debug_assert!(
            !self.contains(hash, digest),
            "digest inserted twice without an intervening remove"
        );

        let idx = self.free_head;
        let entry = &mut self.entries[idx as usize];
        self.free_head = entry.next;
        self.nfree -= 1;

        entry.digest = *digest.as_bytes();
        entry.sid = sid;
        entry.offset = offset;
        entry.expiry = expiry;
        entry.cas = cas;

        let slot = self.bucket_of(hash);
        let head = self.table[slot].head;
        if head == NONE {
            self.entries[idx as usize].next = NONE;
            self.table[slot].head = idx;
        } else {
            self.entries[idx as usize].next = self.entries[head as usize].next;
            self.entries[head as usize].next = idx;
        }
        self.nused += 1;
        trace!(hash, sid, offset, "index entry installed");
    }

    /// Removes the entry for a digest and returns its payload so the
    /// caller can settle slab-side accounting (hole push, item counters).
    pub fn remove(&mut self, hash: u32, digest: &Digest) -> Option<IndexEntry> {
        let slot = self.bucket_of(hash);

        let mut pred = NONE;
        let mut cur = self.table[slot].head;
        while cur != NONE {
            if &self.entries[cur as usize].digest == digest.as_bytes() {
                let next = self.entries[cur as usize].next;
                if pred == NONE {
                    self.table[slot].head = next;
                } else {
                    self.entries[pred as usize].next = next;
                }

                let payload = self.payload(cur);
                self.entries[cur as usize].next = self.free_head;
                self.free_head = cur;
                self.nfree += 1;
                self.nused -= 1;
                trace!(hash, sid = payload.sid, "index entry removed");
                return Some(payload);
            }
            pred = cur;
            cur = self.entries[cur as usize].next;
        }

        None
    }

    /// Chain membership test with no HotRing side effects.
    fn contains(&self, hash: u32, digest: &Digest) -> bool {
        let mut cur = self.table[self.bucket_of(hash)].head;
        while cur != NONE {
            if &self.entries[cur as usize].digest == digest.as_bytes() {
                return true;
            }
            cur = self.entries[cur as usize].next;
        }
        false
    }

    fn payload(&self, idx: u32) -> IndexEntry {
        let entry = &self.entries[idx as usize];
        IndexEntry {
            sid: entry.sid,
            offset: entry.offset,
            expiry: entry.expiry,
            cas: entry.cas,
        }
    }

    /// Chain order of a bucket, head first. Test-only introspection.
    #[cfg(test)]
    fn chain(&self, hash: u32) -> Vec<IndexEntry> {
        let mut order = Vec::new();
        let mut cur = self.table[self.bucket_of(hash)].head;
        while cur != NONE {
            order.push(self.payload(cur));
            cur = self.entries[cur as usize].next;
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: u32 = 0x0000_0001;

    /// Digest whose fingerprint equals `HASH` and whose tail encodes `tag`.
    fn colliding(tag: u8) -> Digest {
        let mut bytes = [0u8; 20];
        bytes[0] = 1;
        bytes[19] = tag;
        Digest::from_bytes(bytes)
    }

    fn index() -> ItemIndex {
        ItemIndex::new(4, 4096).unwrap()
    }

    fn sids(index: &ItemIndex, hash: u32) -> Vec<u32> {
        index.chain(hash).iter().map(|entry| entry.sid).collect()
    }

    #[test]
    fn insert_lookup_remove() {
        let mut idx = index();
        let digest = colliding(1);

        assert!(idx.lookup(HASH, &digest).is_none());
        idx.insert(HASH, &digest, 3, 128, 0, 9);

        let entry = idx.lookup(HASH, &digest).unwrap();
        assert_eq!(entry.sid, 3);
        assert_eq!(entry.offset, 128);
        assert_eq!(entry.cas, 9);

        let removed = idx.remove(HASH, &digest).unwrap();
        assert_eq!(removed, entry);
        assert!(idx.lookup(HASH, &digest).is_none());
        assert!(idx.remove(HASH, &digest).is_none());
    }

    #[test]
    fn free_pool_round_trips() {
        let mut idx = index();
        let total = idx.nfree();

        idx.insert(HASH, &colliding(1), 1, 0, 0, 0);
        assert_eq!(idx.nfree(), total - 1);
        assert_eq!(idx.nused(), 1);

        idx.remove(HASH, &colliding(1)).unwrap();
        assert_eq!(idx.nfree(), total);
        assert_eq!(idx.nused(), 0);
    }

    #[test]
    fn insert_links_at_position_one() {
        let mut idx = index();
        // Insert D1, D2, D3: D1 stays head, later entries slot in behind
        // it, giving D1 -> D3 -> D2.
        idx.insert(HASH, &colliding(1), 1, 0, 0, 0);
        idx.insert(HASH, &colliding(2), 2, 0, 0, 0);
        idx.insert(HASH, &colliding(3), 3, 0, 0, 0);

        assert_eq!(sids(&idx, HASH), vec![1, 3, 2]);
    }

    #[test]
    fn hotring_promotes_on_fifth_non_head_hit() {
        let mut idx = index();
        idx.insert(HASH, &colliding(1), 1, 0, 0, 0);
        idx.insert(HASH, &colliding(2), 2, 0, 0, 0);
        idx.insert(HASH, &colliding(3), 3, 0, 0, 0);
        // Chain: D1 -> D3 -> D2.

        for _ in 0..4 {
            idx.lookup(HASH, &colliding(2)).unwrap();
            assert_eq!(sids(&idx, HASH), vec![1, 3, 2], "no move before threshold");
        }

        // Fifth non-head hit: D2 becomes head, old head follows, D3 keeps
        // its link from the preserved chain.
        idx.lookup(HASH, &colliding(2)).unwrap();
        assert_eq!(sids(&idx, HASH), vec![2, 1, 3]);

        // Counter reset: four more non-head hits still do not move D3.
        for _ in 0..4 {
            idx.lookup(HASH, &colliding(3)).unwrap();
        }
        assert_eq!(sids(&idx, HASH), vec![2, 1, 3]);
        idx.lookup(HASH, &colliding(3)).unwrap();
        assert_eq!(sids(&idx, HASH), vec![3, 2, 1]);
    }

    #[test]
    fn head_hits_do_not_advance_the_counter() {
        let mut idx = index();
        idx.insert(HASH, &colliding(1), 1, 0, 0, 0);
        idx.insert(HASH, &colliding(2), 2, 0, 0, 0);

        for _ in 0..16 {
            idx.lookup(HASH, &colliding(1)).unwrap();
        }
        assert_eq!(sids(&idx, HASH), vec![1, 2]);

        // The counter is still pristine: four non-head hits stay put.
        for _ in 0..4 {
            idx.lookup(HASH, &colliding(2)).unwrap();
        }
        assert_eq!(sids(&idx, HASH), vec![1, 2]);
    }

    #[test]
    fn misses_do_not_advance_the_counter() {
        let mut idx = index();
        idx.insert(HASH, &colliding(1), 1, 0, 0, 0);
        idx.insert(HASH, &colliding(2), 2, 0, 0, 0);

        for _ in 0..16 {
            assert!(idx.lookup(HASH, &colliding(9)).is_none());
        }
        for _ in 0..4 {
            idx.lookup(HASH, &colliding(2)).unwrap();
        }
        assert_eq!(sids(&idx, HASH), vec![1, 2], "misses counted nothing");
    }

    #[test]
    fn remove_of_middle_entry_keeps_chain() {
        let mut idx = index();
        idx.insert(HASH, &colliding(1), 1, 0, 0, 0);
        idx.insert(HASH, &colliding(2), 2, 0, 0, 0);
        idx.insert(HASH, &colliding(3), 3, 0, 0, 0);
        // Chain: D1 -> D3 -> D2.

        idx.remove(HASH, &colliding(3)).unwrap();
        assert_eq!(sids(&idx, HASH), vec![1, 2]);

        idx.remove(HASH, &colliding(1)).unwrap();
        assert_eq!(sids(&idx, HASH), vec![2]);
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        // Room for exactly three entries.
        let mut idx = ItemIndex::new(4, 3 * std::mem::size_of::<ItemX>()).unwrap();
        assert_eq!(idx.nalloc(), 3);

        for tag in 0..3 {
            assert!(!idx.pool_is_empty());
            idx.insert(HASH, &colliding(tag), tag as u32, 0, 0, 0);
        }
        assert!(idx.pool_is_empty());

        idx.remove(HASH, &colliding(1)).unwrap();
        assert!(!idx.pool_is_empty());
    }
}
