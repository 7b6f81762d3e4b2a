//! # Cache Benchmark Harness
//!
//! Repeatable benchmark driver for the slab cache: deterministic PRNG
//! workload, pre-built keys and values, and a file-backed device so the
//! full write-drain-read path is exercised without real hardware.
//!
//! Usage: `bench_cache [keys] [ops] [key_size] [value_size] [config.json]`

use std::env;
use std::fs::OpenOptions;
use std::hint::black_box;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use fkv_common::CacheConfig;
use fkv_engine::SlabCache;

const DEFAULT_KEY_COUNT: usize = 1 << 14;
const DEFAULT_OP_COUNT: usize = 200_000;
const DEFAULT_KEY_SIZE: usize = 16;
const DEFAULT_VALUE_SIZE: usize = 128;

/// Disk slabs backing the scratch device file.
const BENCH_DISK_SLABS: u64 = 128;

struct BenchConfig {
    key_count: usize,
    key_mask: usize,
    op_count: usize,
    key_size: usize,
    value_size: usize,
    config_path: Option<PathBuf>,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        let requested_keys = parse_usize(args.next(), DEFAULT_KEY_COUNT);
        let op_count = parse_usize(args.next(), DEFAULT_OP_COUNT);
        let key_size = parse_usize(args.next(), DEFAULT_KEY_SIZE);
        let value_size = parse_usize(args.next(), DEFAULT_VALUE_SIZE);
        let config_path = args.next().map(PathBuf::from);

        let key_count = requested_keys.max(1).next_power_of_two();

        BenchConfig {
            key_count,
            key_mask: key_count - 1,
            op_count,
            key_size,
            value_size,
            config_path,
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

/// Tiny deterministic PRNG so runs are comparable without an external
/// dependency.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    #[inline]
    fn next_index(&mut self, mask: usize) -> usize {
        (self.next_u64() as usize) & mask
    }
}

fn build_buffers(count: usize, size: usize, seed: u64) -> Vec<Vec<u8>> {
    let mut buffers = Vec::with_capacity(count);
    for i in 0..count {
        let mut buffer = vec![0u8; size];
        let bytes = (seed ^ (i as u64)).to_le_bytes();
        let copy_len = buffer.len().min(bytes.len());
        buffer[..copy_len].copy_from_slice(&bytes[..copy_len]);
        buffers.push(buffer);
    }
    buffers
}

fn report(label: &str, ops: usize, elapsed: std::time::Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let micros_per_op = (secs * 1e6) / (ops as f64);
    println!("{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {micros_per_op:.2} us/op)");
}

/// Scratch device file removed when the run ends.
struct ScratchDevice {
    path: PathBuf,
}

impl ScratchDevice {
    fn create(slab_size: usize) -> anyhow::Result<Self> {
        let path = env::temp_dir().join(format!("fkv-bench-{}.dev", std::process::id()));
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("create scratch device {}", path.display()))?;
        file.set_len(BENCH_DISK_SLABS * slab_size as u64)?;
        Ok(ScratchDevice { path })
    }
}

impl Drop for ScratchDevice {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(err) = run() {
        eprintln!("bench_cache failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let bench = BenchConfig::from_args();

    let mut config = match &bench.config_path {
        Some(path) => CacheConfig::from_json_file(path)?,
        None => CacheConfig {
            hash_power: 16,
            max_index_memory: 16 * 1024 * 1024,
            max_slab_memory: 16 * 1024 * 1024,
            slab_size: 1024 * 1024,
            direct_io: false,
            ..CacheConfig::default()
        },
    };

    let scratch;
    if config.ssd_device.as_os_str().is_empty() {
        scratch = ScratchDevice::create(config.slab_size)?;
        config.ssd_device = scratch.path.clone();
    }

    let mut cache = SlabCache::new(&config).context("cache init")?;

    let keys = build_buffers(bench.key_count, bench.key_size, 0xA5A5_A5A5_A5A5_A5A5);
    let values = build_buffers(bench.key_count, bench.value_size, 0x5A5A_5A5A_5A5A_5A5A);

    println!(
        "keys={}, ops={}, key_size={}, value_size={}",
        bench.key_count, bench.op_count, bench.key_size, bench.value_size
    );

    let start = Instant::now();
    for idx in 0..bench.key_count {
        cache.set(&keys[idx], &values[idx], 0)?;
    }
    report("LOAD", bench.key_count, start.elapsed());

    let mut rng = XorShift64::new(0x1234_5678_9ABC_DEF0);
    let start = Instant::now();
    for _ in 0..bench.op_count {
        let idx = rng.next_index(bench.key_mask);
        let value = cache.get(&keys[idx])?;
        black_box(value);
    }
    report("GET", bench.op_count, start.elapsed());

    let mut rng = XorShift64::new(0x0FED_CBA9_8765_4321);
    let start = Instant::now();
    for _ in 0..bench.op_count {
        let idx = rng.next_index(bench.key_mask);
        cache.set(&keys[idx], &values[idx], 0)?;
    }
    report("SET", bench.op_count, start.elapsed());

    let stats = cache.stats();
    println!(
        "flushes={}, evictions={}, mem slabs {}/{} full, disk slabs {}/{} full",
        stats.nflush,
        stats.nevict,
        stats.mem.nfull,
        stats.mem.nslab,
        stats.disk.nfull,
        stats.disk.nslab
    );

    Ok(())
}
