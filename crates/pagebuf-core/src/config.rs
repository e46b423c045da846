//! Buffer cache tunables.
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`PagebufParams::from_env`)
//! 3. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use pagebuf_core::PagebufParams;
//! use std::time::Duration;
//!
//! let params = PagebufParams::from_env()
//!     .flush_interval(Duration::from_millis(200))
//!     .hash_bits(10);
//! params.validate()?;
//! ```

use crate::env::{env_get, env_get_bool, env_get_ms};
use crate::error::{PbError, Result};
use std::time::Duration;

/// Library defaults.
pub mod defaults {
    pub const FLUSH_INTERVAL_MS: u64 = 1000;
    pub const AGE_BUFFER_MS: u64 = 15_000;
    pub const HASH_BITS: u32 = 8;
    pub const RESERVE_SIZE: usize = 64;
    pub const RESERVE_SEGMENTS: usize = 32;
    pub const RESERVE_RETRY_MS: u64 = 10;
    pub const LOG_WORKERS: usize = 1;
    pub const DATA_WORKERS: usize = 1;
    pub const ALLOC_RETRY_LIMIT: u32 = 500;
    pub const ALLOC_RETRY_DELAY_MS: u64 = 10;
    pub const ALLOC_RETRY_WARN: u32 = 100;
    pub const VMAP_PURGE: usize = 64;
    pub const STATS: bool = false;
}

/// Inclusive bounds of one tunable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamRange {
    pub name: &'static str,
    pub min: u64,
    pub max: u64,
}

impl ParamRange {
    const fn new(name: &'static str, min: u64, max: u64) -> Self {
        Self { name, min, max }
    }

    #[inline]
    pub fn contains(&self, v: u64) -> bool {
        v >= self.min && v <= self.max
    }
}

pub const FLUSH_INTERVAL_RANGE: ParamRange =
    ParamRange::new("flush_interval must be 1ms..=1h", 1, 3_600_000);
pub const AGE_BUFFER_RANGE: ParamRange =
    ParamRange::new("age_buffer must be 0..=2h", 0, 7_200_000);
pub const HASH_BITS_RANGE: ParamRange = ParamRange::new("hash_bits must be 1..=16", 1, 16);
pub const RESERVE_SIZE_RANGE: ParamRange =
    ParamRange::new("reserve_size must be 1..=4096", 1, 4096);
pub const RESERVE_SEGMENTS_RANGE: ParamRange =
    ParamRange::new("reserve_segments must be 1..=1024", 1, 1024);
pub const RESERVE_RETRY_RANGE: ParamRange =
    ParamRange::new("reserve_retry must be 1ms..=1s", 1, 1000);
pub const WORKERS_RANGE: ParamRange =
    ParamRange::new("completion workers per class must be 1..=64", 1, 64);
pub const ALLOC_RETRY_LIMIT_RANGE: ParamRange =
    ParamRange::new("alloc_retry_limit must be 1..=100000", 1, 100_000);
pub const ALLOC_RETRY_DELAY_RANGE: ParamRange =
    ParamRange::new("alloc_retry_delay must be 1ms..=1s", 1, 1000);
pub const ALLOC_RETRY_WARN_RANGE: ParamRange =
    ParamRange::new("alloc_retry_warn must be 1..=100000", 1, 100_000);
pub const VMAP_PURGE_RANGE: ParamRange =
    ParamRange::new("vmap_purge_threshold must be 1..=65536", 1, 65_536);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagebufParams {
    /// Write-back daemon wake-up period.
    pub flush_interval: Duration,
    /// Age at which a delayed-write buffer becomes due.
    pub age_buffer: Duration,
    /// log2 of the number of index buckets.
    pub hash_bits: u32,
    /// Descriptors pre-allocated in the reserved pool.
    pub reserve_size: usize,
    /// Segment capacity of each reserved descriptor.
    pub reserve_segments: usize,
    /// Wait between reserved-pool retries.
    pub reserve_retry: Duration,
    /// Completion workers for metadata/log I/O.
    pub log_workers: usize,
    /// Completion workers for `DATA_IO` buffers.
    pub data_workers: usize,
    /// Page allocation retries before `NoMemory`.
    pub alloc_retry_limit: u32,
    pub alloc_retry_delay: Duration,
    /// Warn once every this many page allocation retries.
    pub alloc_retry_warn: u32,
    /// Pending unmaps that trigger a purge.
    pub vmap_purge_threshold: usize,
    /// Collect statistics counters.
    pub stats: bool,
}

impl Default for PagebufParams {
    fn default() -> Self {
        Self::from_env()
    }
}

impl PagebufParams {
    /// Library defaults, no environment.
    pub fn new() -> Self {
        Self {
            flush_interval: Duration::from_millis(defaults::FLUSH_INTERVAL_MS),
            age_buffer: Duration::from_millis(defaults::AGE_BUFFER_MS),
            hash_bits: defaults::HASH_BITS,
            reserve_size: defaults::RESERVE_SIZE,
            reserve_segments: defaults::RESERVE_SEGMENTS,
            reserve_retry: Duration::from_millis(defaults::RESERVE_RETRY_MS),
            log_workers: defaults::LOG_WORKERS,
            data_workers: defaults::DATA_WORKERS,
            alloc_retry_limit: defaults::ALLOC_RETRY_LIMIT,
            alloc_retry_delay: Duration::from_millis(defaults::ALLOC_RETRY_DELAY_MS),
            alloc_retry_warn: defaults::ALLOC_RETRY_WARN,
            vmap_purge_threshold: defaults::VMAP_PURGE,
            stats: defaults::STATS,
        }
    }

    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `PB_FLUSH_INTERVAL_MS` - daemon period
    /// - `PB_AGE_BUFFER_MS` - delayed-write age
    /// - `PB_HASH_BITS` - log2 bucket count
    /// - `PB_RESERVE_SIZE` - reserved descriptors
    /// - `PB_RESERVE_SEGMENTS` - segments per reserved descriptor
    /// - `PB_RESERVE_RETRY_MS` - reserved pool wait
    /// - `PB_LOG_WORKERS` / `PB_DATA_WORKERS` - completion workers per class
    /// - `PB_ALLOC_RETRY_LIMIT` / `PB_ALLOC_RETRY_DELAY_MS` / `PB_ALLOC_RETRY_WARN`
    /// - `PB_VMAP_PURGE` - batched unmap threshold
    /// - `PB_STATS` - enable counters (0/1)
    pub fn from_env() -> Self {
        let d = Self::new();
        Self {
            flush_interval: env_get_ms("PB_FLUSH_INTERVAL_MS", d.flush_interval),
            age_buffer: env_get_ms("PB_AGE_BUFFER_MS", d.age_buffer),
            hash_bits: env_get("PB_HASH_BITS", d.hash_bits),
            reserve_size: env_get("PB_RESERVE_SIZE", d.reserve_size),
            reserve_segments: env_get("PB_RESERVE_SEGMENTS", d.reserve_segments),
            reserve_retry: env_get_ms("PB_RESERVE_RETRY_MS", d.reserve_retry),
            log_workers: env_get("PB_LOG_WORKERS", d.log_workers),
            data_workers: env_get("PB_DATA_WORKERS", d.data_workers),
            alloc_retry_limit: env_get("PB_ALLOC_RETRY_LIMIT", d.alloc_retry_limit),
            alloc_retry_delay: env_get_ms("PB_ALLOC_RETRY_DELAY_MS", d.alloc_retry_delay),
            alloc_retry_warn: env_get("PB_ALLOC_RETRY_WARN", d.alloc_retry_warn),
            vmap_purge_threshold: env_get("PB_VMAP_PURGE", d.vmap_purge_threshold),
            stats: env_get_bool("PB_STATS", d.stats),
        }
    }

    // Builder methods

    pub fn flush_interval(mut self, d: Duration) -> Self {
        self.flush_interval = d;
        self
    }

    pub fn age_buffer(mut self, d: Duration) -> Self {
        self.age_buffer = d;
        self
    }

    pub fn hash_bits(mut self, bits: u32) -> Self {
        self.hash_bits = bits;
        self
    }

    pub fn reserve_size(mut self, n: usize) -> Self {
        self.reserve_size = n;
        self
    }

    pub fn reserve_segments(mut self, n: usize) -> Self {
        self.reserve_segments = n;
        self
    }

    pub fn reserve_retry(mut self, d: Duration) -> Self {
        self.reserve_retry = d;
        self
    }

    pub fn log_workers(mut self, n: usize) -> Self {
        self.log_workers = n;
        self
    }

    pub fn data_workers(mut self, n: usize) -> Self {
        self.data_workers = n;
        self
    }

    pub fn alloc_retry_limit(mut self, n: u32) -> Self {
        self.alloc_retry_limit = n;
        self
    }

    pub fn alloc_retry_delay(mut self, d: Duration) -> Self {
        self.alloc_retry_delay = d;
        self
    }

    pub fn alloc_retry_warn(mut self, n: u32) -> Self {
        self.alloc_retry_warn = n;
        self
    }

    pub fn vmap_purge_threshold(mut self, n: usize) -> Self {
        self.vmap_purge_threshold = n;
        self
    }

    pub fn stats(mut self, enable: bool) -> Self {
        self.stats = enable;
        self
    }

    /// Check every tunable against its range.
    pub fn validate(&self) -> Result<()> {
        let checks: [(ParamRange, u64); 12] = [
            (FLUSH_INTERVAL_RANGE, self.flush_interval.as_millis() as u64),
            (AGE_BUFFER_RANGE, self.age_buffer.as_millis() as u64),
            (HASH_BITS_RANGE, self.hash_bits as u64),
            (RESERVE_SIZE_RANGE, self.reserve_size as u64),
            (RESERVE_SEGMENTS_RANGE, self.reserve_segments as u64),
            (RESERVE_RETRY_RANGE, self.reserve_retry.as_millis() as u64),
            (WORKERS_RANGE, self.log_workers as u64),
            (WORKERS_RANGE, self.data_workers as u64),
            (ALLOC_RETRY_LIMIT_RANGE, self.alloc_retry_limit as u64),
            (ALLOC_RETRY_DELAY_RANGE, self.alloc_retry_delay.as_millis() as u64),
            (ALLOC_RETRY_WARN_RANGE, self.alloc_retry_warn as u64),
            (VMAP_PURGE_RANGE, self.vmap_purge_threshold as u64),
        ];
        for (range, value) in checks {
            if !range.contains(value) {
                return Err(PbError::Config(range.name));
            }
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("pagebuf configuration:");
        eprintln!("  flush_interval:         {:?}", self.flush_interval);
        eprintln!("  age_buffer:             {:?}", self.age_buffer);
        eprintln!("  hash_bits:              {}", self.hash_bits);
        eprintln!("  reserve_size:           {}", self.reserve_size);
        eprintln!("  reserve_segments:       {}", self.reserve_segments);
        eprintln!("  reserve_retry:          {:?}", self.reserve_retry);
        eprintln!("  log_workers:            {}", self.log_workers);
        eprintln!("  data_workers:           {}", self.data_workers);
        eprintln!("  alloc_retry_limit:      {}", self.alloc_retry_limit);
        eprintln!("  alloc_retry_delay:      {:?}", self.alloc_retry_delay);
        eprintln!("  alloc_retry_warn:       {}", self.alloc_retry_warn);
        eprintln!("  vmap_purge_threshold:   {}", self.vmap_purge_threshold);
        eprintln!("  stats:                  {}", self.stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let p = PagebufParams::new();
        assert_eq!(p.flush_interval, Duration::from_secs(1));
        assert_eq!(p.age_buffer, Duration::from_secs(15));
        assert_eq!(p.hash_bits, 8);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let p = PagebufParams::new()
            .hash_bits(4)
            .reserve_size(2)
            .age_buffer(Duration::ZERO)
            .stats(true);
        assert_eq!(p.hash_bits, 4);
        assert_eq!(p.reserve_size, 2);
        assert!(p.stats);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let p = PagebufParams::new().hash_bits(0);
        assert_eq!(p.validate(), Err(PbError::Config(HASH_BITS_RANGE.name)));

        let p = PagebufParams::new().log_workers(0);
        assert!(p.validate().is_err());

        let p = PagebufParams::new().alloc_retry_limit(1_000_000);
        assert!(p.validate().is_err());

        let p = PagebufParams::new().flush_interval(Duration::ZERO);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_from_env_override() {
        std::env::set_var("PB_RESERVE_SEGMENTS", "7");
        let p = PagebufParams::from_env();
        assert_eq!(p.reserve_segments, 7);
        std::env::remove_var("PB_RESERVE_SEGMENTS");
    }
}
