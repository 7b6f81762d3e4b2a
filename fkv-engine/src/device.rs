//! # Slab Device
//!
//! Positional byte interface over the raw block device (or a preallocated
//! file). The device is carved into slab-sized chunks, evenly partitioned
//! across `server_n` instances; this instance only ever touches its own
//! window. Writes are whole slabs at slab-aligned offsets; point reads are
//! sector-aligned (O_DIRECT).

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;

use fkv_common::{CacheConfig, FkvError, FkvResult, SECTOR_SIZE};
use tracing::{debug, error};

/// Rounds `value` down to a multiple of `align` (a power of two).
#[inline]
pub fn round_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Rounds `value` up to a multiple of `align` (a power of two).
#[inline]
pub fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Handle to this instance's shard of the block device.
pub struct SlabDevice {
    file: File,
    slab_size: usize,
    /// First byte this instance owns.
    start: u64,
    /// One past the last byte this instance owns.
    end: u64,
    /// Slab slots inside the window.
    nslab: u32,
}

impl SlabDevice {
    /// Opens the device, sizes it, and derives this instance's window:
    /// `ndslab = (device_size / slab_size) / server_n` slots starting at
    /// slot `server_id * ndslab`.
    pub fn open(config: &CacheConfig) -> FkvResult<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        #[cfg(target_os = "linux")]
        if config.direct_io {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_DIRECT);
        }

        let mut file = options.open(&config.ssd_device)?;

        // seek(End) sizes both block devices and regular files.
        let size = file.seek(SeekFrom::End(0))?;
        let slab_size = config.slab_size as u64;
        let ndchunk = size / slab_size;
        if u64::from(config.server_n) > ndchunk {
            return Err(FkvError::BadConfig(format!(
                "device has {ndchunk} slab chunks, fewer than server_n {}",
                config.server_n
            )));
        }

        let nslab = ndchunk / u64::from(config.server_n);
        let start = u64::from(config.server_id) * nslab * slab_size;
        let end = (u64::from(config.server_id) + 1) * nslab * slab_size;
        debug!(
            device = %config.ssd_device.display(),
            size,
            nslab,
            start,
            "slab device opened"
        );

        Ok(SlabDevice {
            file,
            slab_size: config.slab_size,
            start,
            end,
            nslab: nslab as u32,
        })
    }

    /// Slab slots in this instance's window.
    pub fn nslab(&self) -> u32 {
        self.nslab
    }

    /// Absolute byte offset of a slab slot.
    #[inline]
    pub fn slab_offset(&self, addr: u32) -> u64 {
        let off = self.start + u64::from(addr) * self.slab_size as u64;
        assert!(off < self.end, "slab addr {addr} outside device window");
        off
    }

    /// Writes one whole slab to a slot. Short writes surface as errors.
    pub fn write_slab(&self, addr: u32, buf: &[u8]) -> FkvResult<()> {
        assert_eq!(buf.len(), self.slab_size);
        let off = self.slab_offset(addr);
        self.file
            .write_all_at(buf, off)
            .inspect_err(|err| error!(addr, off, %err, "slab write failed"))?;
        Ok(())
    }

    /// Reads one whole slab from a slot.
    pub fn read_slab(&self, addr: u32, buf: &mut [u8]) -> FkvResult<()> {
        assert_eq!(buf.len(), self.slab_size);
        let off = self.slab_offset(addr);
        self.file
            .read_exact_at(buf, off)
            .inspect_err(|err| error!(addr, off, %err, "slab read failed"))?;
        Ok(())
    }

    /// Sector-aligned positional read inside the window, for point reads
    /// of single items.
    pub fn read_aligned(&self, off: u64, buf: &mut [u8]) -> FkvResult<()> {
        assert_eq!(off % SECTOR_SIZE as u64, 0);
        assert_eq!(buf.len() % SECTOR_SIZE, 0);
        assert!(off >= self.start && off + buf.len() as u64 <= self.end);
        self.file
            .read_exact_at(buf, off)
            .inspect_err(|err| error!(off, %err, "item read failed"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file_backed(slabs: u64, slab_size: usize) -> (tempfile::NamedTempFile, CacheConfig) {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file()
            .set_len(slabs * slab_size as u64)
            .unwrap();
        let config = CacheConfig {
            slab_size,
            ssd_device: PathBuf::from(file.path()),
            direct_io: false,
            ..CacheConfig::default()
        };
        (file, config)
    }

    #[test]
    fn rounding_helpers() {
        assert_eq!(round_down(1000, 512), 512);
        assert_eq!(round_up(1000, 512), 1024);
        assert_eq!(round_down(1024, 512), 1024);
        assert_eq!(round_up(1024, 512), 1024);
    }

    #[test]
    fn sizes_the_shard_window() {
        let (_file, config) = file_backed(4, 4096);
        let device = SlabDevice::open(&config).unwrap();
        assert_eq!(device.nslab(), 4);
        assert_eq!(device.slab_offset(0), 0);
        assert_eq!(device.slab_offset(3), 3 * 4096);
    }

    #[test]
    fn shard_two_of_two_starts_midway() {
        let (_file, mut config) = file_backed(4, 4096);
        config.server_n = 2;
        config.server_id = 1;
        let device = SlabDevice::open(&config).unwrap();
        assert_eq!(device.nslab(), 2);
        assert_eq!(device.slab_offset(0), 2 * 4096);
    }

    #[test]
    fn rejects_device_smaller_than_shard_count() {
        let (_file, mut config) = file_backed(1, 4096);
        config.server_n = 2;
        assert!(matches!(
            SlabDevice::open(&config),
            Err(FkvError::BadConfig(_))
        ));
    }

    #[test]
    fn slab_round_trip() {
        let (_file, config) = file_backed(2, 4096);
        let device = SlabDevice::open(&config).unwrap();

        let out: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        device.write_slab(1, &out).unwrap();

        let mut back = vec![0u8; 4096];
        device.read_slab(1, &mut back).unwrap();
        assert_eq!(back, out);
    }
}
