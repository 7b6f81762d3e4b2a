//! # Slab Class Table
//!
//! Static partition of the item-size axis, built once from the configured
//! profile. Each class knows its item size, how many items fit in one
//! slab's data area, and owns the allocation state for its size range: a
//! queue of partial memory slabs and an optional dedicated hot slab.

use fkv_common::{FkvError, FkvResult};
use tracing::debug;

use crate::item::ITEM_HDR_SIZE;
use crate::slab::SlabQueue;

/// One slab class.
#[derive(Debug)]
pub struct SlabClass {
    /// Item size in bytes (const).
    pub size: u32,
    /// Items per slab (const).
    pub nitem: u32,
    /// Unusable trailing bytes per slab (const).
    pub slack: u32,
    /// Partial memory slabs of this class.
    pub partial: SlabQueue,
    /// Dedicated partial slab for hot writes, when one is active.
    pub hot: Option<u32>,
    /// Memory slabs adopted by this class.
    pub nmslab: u32,
    /// Disk slabs holding this class's items.
    pub ndslab: u32,
    /// Disk slabs of this class evicted so far.
    pub nevict: u64,
    /// Live items of this class across both tiers.
    pub nused_item: u64,
}

/// Slab classes indexed by cid.
#[derive(Debug)]
pub struct ClassTable {
    classes: Vec<SlabClass>,
}

impl ClassTable {
    /// Builds the table from an ascending profile. `data_size` is the
    /// per-slab byte budget after the slab header.
    pub fn new(profile: &[u32], data_size: usize) -> FkvResult<Self> {
        debug_assert!(profile.windows(2).all(|pair| pair[0] < pair[1]));

        let mut classes = Vec::with_capacity(profile.len());
        for &size in profile {
            if (size as usize) < ITEM_HDR_SIZE {
                return Err(FkvError::BadConfig(format!(
                    "class size {size} cannot hold a {ITEM_HDR_SIZE} byte item header"
                )));
            }
            if size as usize > data_size {
                return Err(FkvError::BadConfig(format!(
                    "class size {size} exceeds slab data size {data_size}"
                )));
            }
            let nitem = (data_size / size as usize) as u32;
            let slack = (data_size - nitem as usize * size as usize) as u32;
            debug!(cid = classes.len(), size, nitem, slack, "slab class");
            classes.push(SlabClass {
                size,
                nitem,
                slack,
                partial: SlabQueue::new(),
                hot: None,
                nmslab: 0,
                ndslab: 0,
                nevict: 0,
                nused_item: 0,
            });
        }

        Ok(ClassTable { classes })
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Smallest class whose item size can hold `size` bytes, or `None`
    /// when the item is larger than every class.
    pub fn cid_for_size(&self, size: usize) -> Option<u8> {
        debug_assert!(size > 0);
        let cid = self.classes.partition_point(|class| (class.size as usize) < size);
        (cid < self.classes.len()).then(|| cid as u8)
    }

    #[inline]
    pub fn get(&self, cid: u8) -> &SlabClass {
        &self.classes[cid as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, cid: u8) -> &mut SlabClass {
        &mut self.classes[cid as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &SlabClass> {
        self.classes.iter()
    }
}
