//! # Key Digest
//!
//! Keys are identified everywhere inside the core by their 20-byte SHA-1
//! digest; the raw key bytes only appear in the on-slab item record. The
//! index additionally derives a 32-bit fingerprint from the digest to pick
//! a hash bucket.

use std::fmt;

use sha1::{Digest as _, Sha1};

/// Length of a key digest in bytes.
pub const DIGEST_LEN: usize = 20;

/// 20-byte SHA-1 digest of a user key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Digests a raw key.
    pub fn of_key(key: &[u8]) -> Self {
        let hash = Sha1::digest(key);
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&hash);
        Digest(bytes)
    }

    /// Wraps an already-computed digest.
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Digest(bytes)
    }

    /// Returns the raw digest bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// 32-bit fingerprint used for bucket selection: the first four digest
    /// bytes, little-endian. SHA-1 output is uniform, so any fixed window
    /// works.
    #[inline]
    pub fn fingerprint(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}
