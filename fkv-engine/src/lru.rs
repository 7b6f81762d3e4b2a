//! # Write-Sensitive LRU
//!
//! One list per tier, ranking full slabs by write recency: a slab is
//! touched exactly once, at the moment it fills (memory tier) or lands on
//! disk after a drain (disk tier). Reads never touch the list, and neither
//! does hole reuse; on flash the read latency is uniform, so victim choice
//! only protects recent writes.
//!
//! Links are intrusive sid indexes inside `SlabInfo`, separate from the
//! queue links, because a full slab is on its tier's full queue and its
//! tier's LRU list at the same time.

use crate::slab::SlabInfo;
use crate::NONE;

/// Doubly linked LRU over slabinfos, least-recently-written at the head.
#[derive(Debug)]
pub struct LruList {
    head: u32,
    tail: u32,
    len: u32,
}

impl Default for LruList {
    fn default() -> Self {
        LruList {
            head: NONE,
            tail: NONE,
            len: 0,
        }
    }
}

impl LruList {
    pub fn new() -> LruList {
        LruList::default()
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Least-recently-written sid, without removing it.
    pub fn head(&self) -> Option<u32> {
        (self.head != NONE).then_some(self.head)
    }

    fn linked(&self, table: &[SlabInfo], sid: u32) -> bool {
        let info = &table[sid as usize];
        info.lru_prev != NONE || info.lru_next != NONE || self.head == sid
    }

    /// Marks a slab most-recently-written by moving it to the tail,
    /// linking it first if needed.
    pub fn touch(&mut self, table: &mut [SlabInfo], sid: u32) {
        if self.tail == sid {
            return;
        }
        if self.linked(table, sid) {
            self.unlink(table, sid);
        }
        self.push_tail(table, sid);
    }

    /// Removes and returns the least-recently-written slab.
    pub fn pop_head(&mut self, table: &mut [SlabInfo]) -> Option<u32> {
        let sid = self.head()?;
        self.unlink(table, sid);
        Some(sid)
    }

    /// Detaches a slab if it is on the list; no-op otherwise.
    pub fn remove(&mut self, table: &mut [SlabInfo], sid: u32) {
        if self.linked(table, sid) {
            self.unlink(table, sid);
        }
    }

    fn push_tail(&mut self, table: &mut [SlabInfo], sid: u32) {
        let old_tail = self.tail;
        let info = &mut table[sid as usize];
        info.lru_prev = old_tail;
        info.lru_next = NONE;
        if old_tail == NONE {
            self.head = sid;
        } else {
            table[old_tail as usize].lru_next = sid;
        }
        self.tail = sid;
        self.len += 1;
    }

    fn unlink(&mut self, table: &mut [SlabInfo], sid: u32) {
        let (prev, next) = {
            let info = &table[sid as usize];
            (info.lru_prev, info.lru_next)
        };

        if prev == NONE {
            self.head = next;
        } else {
            table[prev as usize].lru_next = next;
        }
        if next == NONE {
            self.tail = prev;
        } else {
            table[next as usize].lru_prev = prev;
        }

        let info = &mut table[sid as usize];
        info.lru_prev = NONE;
        info.lru_next = NONE;
        self.len -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(n: u32) -> Vec<SlabInfo> {
        (0..n).map(|sid| SlabInfo::new(sid, sid, true)).collect()
    }

    fn order(lru: &LruList, table: &[SlabInfo]) -> Vec<u32> {
        let mut sids = Vec::new();
        let mut cur = lru.head;
        while cur != NONE {
            sids.push(cur);
            cur = table[cur as usize].lru_next;
        }
        sids
    }

    #[test]
    fn touch_appends_in_fill_order() {
        let mut table = table(3);
        let mut lru = LruList::new();

        for sid in 0..3 {
            lru.touch(&mut table, sid);
        }
        assert_eq!(order(&lru, &table), vec![0, 1, 2]);
        assert_eq!(lru.head(), Some(0));
    }

    #[test]
    fn touch_of_linked_slab_moves_to_tail() {
        let mut table = table(3);
        let mut lru = LruList::new();
        for sid in 0..3 {
            lru.touch(&mut table, sid);
        }

        lru.touch(&mut table, 0);
        assert_eq!(order(&lru, &table), vec![1, 2, 0]);

        // Touching the tail is a no-op.
        lru.touch(&mut table, 0);
        assert_eq!(order(&lru, &table), vec![1, 2, 0]);
    }

    #[test]
    fn pop_head_returns_least_recent() {
        let mut table = table(3);
        let mut lru = LruList::new();
        for sid in 0..3 {
            lru.touch(&mut table, sid);
        }

        assert_eq!(lru.pop_head(&mut table), Some(0));
        assert_eq!(lru.pop_head(&mut table), Some(1));
        assert_eq!(lru.len(), 1);
    }

    #[test]
    fn remove_is_noop_when_unlinked() {
        let mut table = table(2);
        let mut lru = LruList::new();

        lru.remove(&mut table, 1);
        assert!(lru.is_empty());

        lru.touch(&mut table, 0);
        lru.remove(&mut table, 0);
        assert!(lru.is_empty());
        assert_eq!(order(&lru, &table), Vec::<u32>::new());
    }
}
