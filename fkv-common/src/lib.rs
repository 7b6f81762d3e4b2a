// fkv-common - shared foundation for the FlashKV crates: errors,
// configuration, key digests, and the seconds clock.

pub mod clock;
pub mod config;
pub mod digest;
pub mod error;

// Re-export for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{profile_from_factor, CacheConfig, SECTOR_SIZE, SLABCLASS_MAX_IDS};
pub use digest::{Digest, DIGEST_LEN};
pub use error::{FkvError, FkvResult};
