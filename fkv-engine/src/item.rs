//! # On-Slab Item Layout
//!
//! Items are stored back-to-back inside a slab at the owning class's size
//! stride and round-trip through the disk tier as raw bytes, so the layout
//! is explicit little-endian serialization rather than an in-memory struct
//! cast. Only `magic`, `cid`, and `sid` are validated when an item is read
//! back; the rest is trusted under the slab's header.
//!
//! ```text
//! Item record (ITEM_HDR_SIZE = 52 bytes, then key, then value):
//! +---------+-------+----------+-----+------+-------+---------+----------+-------+------------+
//! | magic:4 | sid:4 | offset:4 | cid | nkey | pad:2 | ndata:4 | expiry:4 | cas:8 | digest:20  |
//! +---------+-------+----------+-----+------+-------+---------+----------+-------+------------+
//! ```

use fkv_common::{Digest, DIGEST_LEN};

/// Magic stamped on every live item record.
pub const ITEM_MAGIC: u32 = 0xFEED_FACE;

/// Fixed prefix of every item record, before key and value bytes.
pub const ITEM_HDR_SIZE: usize = 52;

/// Longest key the `nkey` length byte can describe.
pub const MAX_KEY_LEN: usize = u8::MAX as usize;

/// Decoded item record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemHeader {
    /// Owning slab id.
    pub sid: u32,
    /// Data-relative byte offset of this record inside its slab.
    pub offset: u32,
    /// Owning slab class id.
    pub cid: u8,
    /// Key length in bytes.
    pub nkey: u8,
    /// Value length in bytes.
    pub ndata: u32,
    /// Expiry in seconds since epoch; 0 never expires.
    pub expiry: u32,
    /// Compare-and-swap token assigned at store time.
    pub cas: u64,
    /// Digest of the key.
    pub digest: Digest,
}

impl ItemHeader {
    /// Total record size for a key/value pair of the given lengths.
    #[inline]
    pub const fn total_size(nkey: usize, ndata: usize) -> usize {
        ITEM_HDR_SIZE + nkey + ndata
    }

    /// Serializes the header (including magic) into the front of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        assert!(buf.len() >= ITEM_HDR_SIZE);

        buf[0..4].copy_from_slice(&ITEM_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.sid.to_le_bytes());
        buf[8..12].copy_from_slice(&self.offset.to_le_bytes());
        buf[12] = self.cid;
        buf[13] = self.nkey;
        buf[14..16].fill(0);
        buf[16..20].copy_from_slice(&self.ndata.to_le_bytes());
        buf[20..24].copy_from_slice(&self.expiry.to_le_bytes());
        buf[24..32].copy_from_slice(&self.cas.to_le_bytes());
        buf[32..52].copy_from_slice(self.digest.as_bytes());
    }

    /// Decodes a header from the front of `buf`, or `None` when the magic
    /// does not match (stale hole bytes, never-written slots).
    pub fn read_from(buf: &[u8]) -> Option<ItemHeader> {
        if buf.len() < ITEM_HDR_SIZE {
            return None;
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes"));
        if magic != ITEM_MAGIC {
            return None;
        }

        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&buf[32..52]);

        Some(ItemHeader {
            sid: u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes")),
            offset: u32::from_le_bytes(buf[8..12].try_into().expect("4 bytes")),
            cid: buf[12],
            nkey: buf[13],
            ndata: u32::from_le_bytes(buf[16..20].try_into().expect("4 bytes")),
            expiry: u32::from_le_bytes(buf[20..24].try_into().expect("4 bytes")),
            cas: u64::from_le_bytes(buf[24..32].try_into().expect("8 bytes")),
            digest: Digest::from_bytes(digest),
        })
    }
}

/// Writes a complete item record (header, key, value) into a slot.
pub fn write_item(slot: &mut [u8], header: &ItemHeader, key: &[u8], value: &[u8]) {
    debug_assert_eq!(key.len(), header.nkey as usize);
    debug_assert_eq!(value.len(), header.ndata as usize);
    assert!(slot.len() >= ItemHeader::total_size(key.len(), value.len()));

    header.write_to(slot);
    let key_end = ITEM_HDR_SIZE + key.len();
    slot[ITEM_HDR_SIZE..key_end].copy_from_slice(key);
    slot[key_end..key_end + value.len()].copy_from_slice(value);
}

/// Borrowed view of a decoded item record.
#[derive(Debug)]
pub struct ItemView<'a> {
    pub header: ItemHeader,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl<'a> ItemView<'a> {
    /// Splits a record slice into header, key, and value views.
    ///
    /// Panics when the record is malformed; callers only parse bytes that
    /// passed the slab-level validation in the read path.
    pub fn parse(record: &'a [u8]) -> ItemView<'a> {
        let header = ItemHeader::read_from(record).expect("valid item record");
        let key_end = ITEM_HDR_SIZE + header.nkey as usize;
        let value_end = key_end + header.ndata as usize;
        assert!(value_end <= record.len());

        ItemView {
            header,
            key: &record[ITEM_HDR_SIZE..key_end],
            value: &record[key_end..value_end],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> ItemHeader {
        ItemHeader {
            sid: 7,
            offset: 256,
            cid: 2,
            nkey: 5,
            ndata: 11,
            expiry: 1234,
            cas: 42,
            digest: Digest::of_key(b"alpha"),
        }
    }

    #[test]
    fn round_trips_through_bytes() {
        let mut slot = vec![0u8; 128];
        write_item(&mut slot, &header(), b"alpha", b"hello world");

        let view = ItemView::parse(&slot);
        assert_eq!(view.header, header());
        assert_eq!(view.key, b"alpha");
        assert_eq!(view.value, b"hello world");
    }

    #[test]
    fn bad_magic_reads_as_none() {
        let mut slot = vec![0u8; 128];
        write_item(&mut slot, &header(), b"alpha", b"hello world");
        slot[0] ^= 0xFF;
        assert!(ItemHeader::read_from(&slot).is_none());
    }

    #[test]
    fn zeroed_slot_reads_as_none() {
        assert!(ItemHeader::read_from(&[0u8; ITEM_HDR_SIZE]).is_none());
    }
}
