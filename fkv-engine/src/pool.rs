//! # Slab Pool
//!
//! Owner of every memory page and disk sector in the cache: the memory
//! slab arena, the slab table, the per-tier free/full queues, the two
//! write-sensitive LRUs, and the device handle. The allocator, the
//! memory-to-disk drain, and the disk eviction path all live here.
//!
//! ## Slab lifecycle
//!
//! ```text
//!   free-mem --(adopt partial or hot)--> partial-mem --(nalloc==nitem)--> full-mem
//!       ^                                                                   |
//!       |                                                                   | (drain swap)
//!       +---------------- free-mem (as swap peer) <----- full-disk <--------+
//!                                                       |         ^
//!                                                       | (evict) | (drain)
//!                                                       v         |
//!                                                   free-disk ----+
//! ```
//!
//! The drain protocol's address swap is the load-bearing trick: a drained
//! slab keeps its `sid` while `(tier, addr)` migrate to the disk slot, so
//! every index entry keeps resolving with no rewrite. Everything
//! index-facing is keyed on `sid`, never on `addr`.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::slice;

use fkv_common::{CacheConfig, FkvError, FkvResult, SECTOR_SIZE};
use tracing::{debug, trace};

use crate::class::ClassTable;
use crate::device::{round_down, round_up, SlabDevice};
use crate::index::ItemIndex;
use crate::item::{ItemHeader, ItemView};
use crate::lru::LruList;
use crate::slab::{read_slab_header, write_slab_header, SlabInfo, SlabQueue, SLAB_HDR_SIZE, SLAB_MAGIC};
use crate::stats::{ClassStats, TierStats};

/// Victim selection consults the write-sensitive LRUs; the full queues are
/// the fallback order.
const USE_LRU: bool = true;

/// Alignment of the slab arena and scratch buffers. O_DIRECT requires the
/// I/O source and destination buffers to be sector-aligned; one page
/// covers every sector size in practice.
const BUF_ALIGN: usize = 4096;

/// Heap buffer with explicit alignment, for O_DIRECT I/O sources.
struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuf {
    fn zeroed(len: usize, align: usize) -> FkvResult<AlignedBuf> {
        assert!(len > 0 && align.is_power_of_two());
        let layout = Layout::from_size_align(len, align)
            .map_err(|_| FkvError::OutOfMemory("buffer layout"))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(FkvError::OutOfMemory("aligned buffer"))?;
        Ok(AlignedBuf { ptr, layout })
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr covers layout.size() initialized bytes for the
        // buffer's whole lifetime.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    #[inline]
    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as as_slice, and &mut self guarantees uniqueness.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated with this exact layout in zeroed().
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// SAFETY: AlignedBuf is an owning buffer; the raw pointer is not shared.
unsafe impl Send for AlignedBuf {}

/// A free item slot handed out by the allocator: owning slab plus the
/// data-relative byte offset of the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemSlot {
    pub sid: u32,
    pub offset: u32,
}

/// The slab allocator and drain/evict engine.
pub struct SlabPool {
    slab_size: usize,
    classes: ClassTable,
    stable: Vec<SlabInfo>,
    nmslab: u32,
    ndslab: u32,

    free_mem: SlabQueue,
    full_mem: SlabQueue,
    free_disk: SlabQueue,
    full_disk: SlabQueue,
    lru_mem: LruList,
    lru_disk: LruList,

    device: SlabDevice,
    arena: AlignedBuf,
    evict_buf: AlignedBuf,
    read_buf: AlignedBuf,

    nevict: u64,
    nflush: u64,
}

impl SlabPool {
    /// Builds the class table, slab table, memory arena, and scratch
    /// buffers. Memory sids come first (`[0, nmslab)`), disk sids after.
    pub fn new(config: &CacheConfig, device: SlabDevice) -> FkvResult<Self> {
        let slab_size = config.slab_size;
        let data_size = slab_size - SLAB_HDR_SIZE;
        let classes = ClassTable::new(&config.profile, data_size)?;

        // Every class must be able to hold at least one memory slab.
        let nmslab = (config.max_slab_memory / slab_size).max(classes.len()) as u32;
        let ndslab = device.nslab();

        let mut stable = Vec::with_capacity((nmslab + ndslab) as usize);
        for sid in 0..nmslab {
            stable.push(SlabInfo::new(sid, sid, true));
        }
        for slot in 0..ndslab {
            stable.push(SlabInfo::new(nmslab + slot, slot, false));
        }

        let mut free_mem = SlabQueue::new();
        let full_mem = SlabQueue::new();
        let mut free_disk = SlabQueue::new();
        let full_disk = SlabQueue::new();
        for sid in 0..nmslab {
            free_mem.push_tail(&mut stable, sid);
        }
        for slot in 0..ndslab {
            free_disk.push_tail(&mut stable, nmslab + slot);
        }

        let arena = AlignedBuf::zeroed(nmslab as usize * slab_size, BUF_ALIGN)?;
        let evict_buf = AlignedBuf::zeroed(slab_size, BUF_ALIGN)?;
        let read_buf = AlignedBuf::zeroed(slab_size, BUF_ALIGN)?;

        debug!(nmslab, ndslab, slab_size, "slab pool initialized");

        Ok(SlabPool {
            slab_size,
            classes,
            stable,
            nmslab,
            ndslab,
            free_mem,
            full_mem,
            free_disk,
            full_disk,
            lru_mem: LruList::new(),
            lru_disk: LruList::new(),
            device,
            arena,
            evict_buf,
            read_buf,
            nevict: 0,
            nflush: 0,
        })
    }

    /// Smallest class able to hold an item of `size` bytes.
    pub fn cid_for_size(&self, size: usize) -> Option<u8> {
        self.classes.cid_for_size(size)
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    pub fn nmslab(&self) -> u32 {
        self.nmslab
    }

    pub fn ndslab(&self) -> u32 {
        self.ndslab
    }

    pub fn nevict(&self) -> u64 {
        self.nevict
    }

    pub fn nflush(&self) -> u64 {
        self.nflush
    }

    pub fn mem_stats(&self) -> TierStats {
        let nfree = self.free_mem.len();
        let nfull = self.full_mem.len();
        TierStats {
            nslab: self.nmslab,
            nfree,
            nfull,
            // Partial and hot slabs are whatever is neither free nor full.
            npartial: self.nmslab - nfree - nfull,
        }
    }

    pub fn disk_stats(&self) -> TierStats {
        TierStats {
            nslab: self.ndslab,
            nfree: self.free_disk.len(),
            nfull: self.full_disk.len(),
            npartial: 0,
        }
    }

    pub fn class_stats(&self) -> Vec<ClassStats> {
        self.classes
            .iter()
            .enumerate()
            .map(|(cid, class)| ClassStats {
                cid: cid as u8,
                size: class.size,
                nitem: class.nitem,
                nmslab: class.nmslab,
                ndslab: class.ndslab,
                nevict: class.nevict,
                nused_item: class.nused_item,
            })
            .collect()
    }

    /// Returns a free item slot of the given class, running drains and
    /// evictions as needed. `is_hot` routes the request to the class's
    /// dedicated hot slab instead of the general partial queue.
    pub fn get_item(
        &mut self,
        cid: u8,
        is_hot: bool,
        index: &mut ItemIndex,
    ) -> FkvResult<ItemSlot> {
        assert!((cid as usize) < self.classes.len(), "cid out of range");

        // The insert that follows must find a free index entry; evict disk
        // slabs until the pool has one.
        while index.pool_is_empty() {
            self.evict(index)?;
        }

        loop {
            if is_hot {
                if self.classes.get(cid).hot.is_none() {
                    match self.free_mem.pop_head(&mut self.stable) {
                        Some(sid) => {
                            self.adopt_free_slab(sid, cid);
                            self.classes.get_mut(cid).hot = Some(sid);
                            trace!(sid, cid, "hot slab installed");
                        }
                        None => {
                            self.drain(index)?;
                            continue;
                        }
                    }
                }
                let sid = self.classes.get(cid).hot.expect("hot slab installed");
                return Ok(self.take_slot(cid, sid, true));
            }

            if let Some(sid) = self.classes.get(cid).partial.head() {
                return Ok(self.take_slot(cid, sid, false));
            }

            match self.free_mem.pop_head(&mut self.stable) {
                Some(sid) => {
                    self.adopt_free_slab(sid, cid);
                    let class = self.classes.get_mut(cid);
                    class.partial.push_head(&mut self.stable, sid);
                    return Ok(self.take_slot(cid, sid, false));
                }
                None => self.drain(index)?,
            }
        }
    }

    /// Initializes a just-popped free memory slab for a class: resets fill
    /// state and stamps the slab header into the arena.
    fn adopt_free_slab(&mut self, sid: u32, cid: u8) {
        let addr = {
            let info = &mut self.stable[sid as usize];
            debug_assert!(info.mem);
            info.cid = cid;
            info.nalloc = 0;
            info.holes.clear();
            info.addr
        };
        self.classes.get_mut(cid).nmslab += 1;

        let base = addr as usize * self.slab_size;
        write_slab_header(&mut self.arena.as_mut_slice()[base..base + SLAB_HDR_SIZE], sid, cid);
    }

    /// Takes one slot out of a chosen partial or hot slab, preferring
    /// holes over fresh slots, and handles the partial-to-full transition.
    fn take_slot(&mut self, cid: u8, sid: u32, is_hot: bool) -> ItemSlot {
        let (size, nitem) = {
            let class = self.classes.get(cid);
            (class.size, class.nitem)
        };

        let info = &mut self.stable[sid as usize];
        debug_assert!(info.mem && info.cid == cid);
        debug_assert!(info.nalloc < nitem);

        let idx = match info.holes.pop() {
            Some(hole) => {
                trace!(sid, hole, "hole slot refilled");
                u32::from(hole)
            }
            None => info.nalloc,
        };
        info.nalloc += 1;
        let filled = info.nalloc == nitem;

        if filled {
            if is_hot {
                self.classes.get_mut(cid).hot = None;
            } else {
                let class = self.classes.get_mut(cid);
                class.partial.unlink(&mut self.stable, sid);
            }
            self.full_mem.push_tail(&mut self.stable, sid);
            if USE_LRU {
                self.lru_mem.touch(&mut self.stable, sid);
            }
            debug!(sid, cid, "memory slab filled");
        }

        ItemSlot {
            sid,
            offset: idx * size,
        }
    }

    /// Moves the least-recently-written full memory slab to a free disk
    /// slot and swaps the two slabinfos' tier addresses. Queue and tier
    /// state only move after the write succeeds.
    fn drain(&mut self, index: &mut ItemIndex) -> FkvResult<()> {
        if self.free_disk.is_empty() {
            self.evict(index)?;
            debug_assert!(!self.free_disk.is_empty());
        }

        let msid = if USE_LRU && !self.lru_mem.is_empty() {
            self.lru_mem.head().expect("non-empty lru")
        } else {
            match self.full_mem.head() {
                Some(sid) => sid,
                None => return Err(FkvError::OutOfMemory("no full memory slab to drain")),
            }
        };
        let dsid = self.free_disk.head().expect("free disk slab");

        let m_addr = self.stable[msid as usize].addr;
        let d_addr = self.stable[dsid as usize].addr;
        debug_assert!(self.stable[msid as usize].mem);
        debug_assert!(!self.stable[dsid as usize].mem);

        {
            let base = m_addr as usize * self.slab_size;
            let bytes = &self.arena.as_slice()[base..base + self.slab_size];
            self.device.write_slab(d_addr, bytes)?;
        }

        self.full_mem.unlink(&mut self.stable, msid);
        self.lru_mem.remove(&mut self.stable, msid);
        let popped = self.free_disk.pop_head(&mut self.stable);
        debug_assert_eq!(popped, Some(dsid));

        // Address swap: sid and cid stay put, so index entries pointing at
        // the drained slab now transparently resolve to disk reads.
        self.stable[msid as usize].addr = d_addr;
        self.stable[msid as usize].mem = false;
        self.stable[dsid as usize].addr = m_addr;
        self.stable[dsid as usize].mem = true;

        let cid = self.stable[msid as usize].cid;
        let class = self.classes.get_mut(cid);
        class.nmslab -= 1;
        class.ndslab += 1;

        self.free_mem.push_tail(&mut self.stable, dsid);
        self.full_disk.push_tail(&mut self.stable, msid);
        if USE_LRU {
            self.lru_disk.touch(&mut self.stable, msid);
        }
        self.nflush += 1;
        debug!(sid = msid, mem_addr = m_addr, disk_addr = d_addr, "slab drained to disk");
        Ok(())
    }

    /// Discards the least-recently-written full disk slab, removing its
    /// live index entries, and returns its slot to the free disk queue.
    fn evict(&mut self, index: &mut ItemIndex) -> FkvResult<()> {
        let sid = if USE_LRU && !self.lru_disk.is_empty() {
            self.lru_disk.head().expect("non-empty lru")
        } else {
            match self.full_disk.head() {
                Some(sid) => sid,
                None => return Err(FkvError::IndexFull),
            }
        };

        let (addr, cid) = {
            let info = &self.stable[sid as usize];
            debug_assert!(!info.mem);
            (info.addr, info.cid)
        };

        self.device.read_slab(addr, self.evict_buf.as_mut_slice())?;

        let (magic, header_sid, header_cid) = read_slab_header(self.evict_buf.as_slice());
        assert_eq!(magic, SLAB_MAGIC, "evicted slab has a corrupt header");
        assert_eq!(header_sid, sid, "slab header sid does not match slab table");
        assert_eq!(header_cid, cid, "slab header cid does not match slab table");

        let (size, nitem) = {
            let class = self.classes.get(cid);
            (class.size as usize, class.nitem)
        };

        let mut removed = 0u32;
        for idx in 0..nitem as usize {
            let start = SLAB_HDR_SIZE + idx * size;
            let header = ItemHeader::read_from(&self.evict_buf.as_slice()[start..start + size]);
            // Slots with no item magic are stale holes or never-written
            // tail slots; skip them without touching the index.
            let Some(header) = header else { continue };

            let hash = header.digest.fingerprint();
            let offset = (idx * size) as u32;
            // The digest may have been deleted and reinserted into another
            // slab since these bytes were written; only drop the entry
            // that still points at this exact slot.
            let live = index
                .lookup(hash, &header.digest)
                .map_or(false, |entry| entry.sid == sid && entry.offset == offset);
            if live {
                index.remove(hash, &header.digest);
                self.reclaim_slot(sid, offset);
                removed += 1;
            }
        }

        self.full_disk.unlink(&mut self.stable, sid);
        self.lru_disk.remove(&mut self.stable, sid);
        self.free_disk.push_tail(&mut self.stable, sid);

        self.nevict += 1;
        let class = self.classes.get_mut(cid);
        class.nevict += 1;
        class.ndslab -= 1;
        debug!(sid, cid, removed, "disk slab evicted");
        Ok(())
    }

    /// Reads one item's bytes into the read buffer, from the arena when
    /// the owning slab is memory-resident or via a sector-aligned device
    /// read otherwise, and returns a view into the buffer. The borrow
    /// keeps the buffer stable until the caller is done with it.
    pub fn read_item(&mut self, sid: u32, offset: u32) -> FkvResult<ItemView<'_>> {
        let (mem, addr, cid) = {
            let info = &self.stable[sid as usize];
            (info.mem, info.addr, info.cid)
        };
        let size = self.classes.get(cid).size as usize;
        let in_slab = SLAB_HDR_SIZE + offset as usize;
        assert!(in_slab + size <= self.slab_size, "item offset outside slab");

        let delta = if mem {
            let base = addr as usize * self.slab_size + in_slab;
            let arena = self.arena.as_slice();
            self.read_buf.as_mut_slice()[..size].copy_from_slice(&arena[base..base + size]);
            0
        } else {
            let byte_off = self.device.slab_offset(addr) + in_slab as u64;
            let aligned_off = round_down(byte_off, SECTOR_SIZE as u64);
            let delta = (byte_off - aligned_off) as usize;
            let span = round_up((size + delta) as u64, SECTOR_SIZE as u64) as usize;
            self.device
                .read_aligned(aligned_off, &mut self.read_buf.as_mut_slice()[..span])?;
            delta
        };

        let record = &self.read_buf.as_slice()[delta..delta + size];
        let view = ItemView::parse(record);
        assert_eq!(view.header.cid, cid, "item cid does not match slab class");
        assert_eq!(view.header.sid, sid, "item sid does not match slab table");
        Ok(view)
    }

    /// Mutable slot bytes for writing a freshly allocated item. Only
    /// memory-resident slabs accept writes.
    pub fn item_slot_mut(&mut self, slot: ItemSlot, len: usize) -> &mut [u8] {
        let info = &self.stable[slot.sid as usize];
        assert!(info.mem, "item writes target memory slabs");
        let size = self.classes.get(info.cid).size as usize;
        assert!(len <= size, "item does not fit its class slot");

        let base = info.addr as usize * self.slab_size + SLAB_HDR_SIZE + slot.offset as usize;
        &mut self.arena.as_mut_slice()[base..base + len]
    }

    /// Settles slab-side accounting after an index entry was removed:
    /// memory-resident slabs get the slot pushed onto the hole list, both
    /// tiers lose one used item.
    pub fn reclaim_slot(&mut self, sid: u32, offset: u32) {
        let cid = self.stable[sid as usize].cid;
        let size = self.classes.get(cid).size;

        let info = &mut self.stable[sid as usize];
        if info.mem {
            let idx = offset / size;
            debug_assert!(u64::from(idx) < u64::from(self.classes.get(cid).nitem));
            info.holes.push(idx as u16);
            debug_assert!(info.nalloc > 0);
            info.nalloc -= 1;
            trace!(sid, idx, "hole pushed");
        }

        let class = self.classes.get_mut(cid);
        class.nused_item = class.nused_item.saturating_sub(1);
    }

    /// Counts a freshly inserted item against its owning class.
    pub fn account_insert(&mut self, sid: u32) {
        let cid = self.stable[sid as usize].cid;
        self.classes.get_mut(cid).nused_item += 1;
    }
}
