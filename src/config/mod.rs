//! # graphstore Configuration Module
//!
//! Centralizes compile-time constants and the runtime GC tuning knobs.
//! Interdependent constants live together in [`constants`] with their
//! relationships documented and enforced through compile-time assertions.
//!
//! Runtime tunables are carried by [`GcConfig`], which is handed to the
//! engine at construction time and copied into each channel.

pub mod constants;
pub use constants::*;

use std::time::Duration;

use eyre::{ensure, Result};

/// Runtime tuning knobs for the garbage collector and entity cache.
#[derive(Debug, Clone, Copy)]
pub struct GcConfig {
    /// Number of independent storage channels. Must be a power of two
    /// because oid routing uses the low oid bits as a channel mask.
    pub channel_count: u32,
    /// Type id of the persisted root type. Root-oid candidates are
    /// collected from this type's entities at sweep time.
    pub root_type_id: u64,
    /// Oids pulled from the mark queue per batch.
    pub mark_batch_length: usize,
    /// Bounded wait for new mark work before rechecking completion.
    pub mark_wait: Duration,
    /// Total cached bytes above which eviction candidates are cleared.
    pub cache_threshold: u64,
    /// Idle time after which a cached payload may be cleared regardless
    /// of total cache size.
    pub cache_max_idle_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            channel_count: 1,
            root_type_id: 1,
            mark_batch_length: MARK_BATCH_LENGTH,
            mark_wait: Duration::from_millis(DEFAULT_MARK_WAIT_MS),
            cache_threshold: DEFAULT_CACHE_THRESHOLD,
            cache_max_idle_ms: DEFAULT_CACHE_MAX_IDLE_MS,
        }
    }
}

impl GcConfig {
    /// Configuration optimized for interactive workloads: small mark
    /// batches and short waits keep GC pauses negligible.
    pub fn low_latency() -> Self {
        Self {
            mark_batch_length: 64,
            mark_wait: Duration::from_millis(10),
            ..Self::default()
        }
    }

    /// Configuration optimized for bulk housekeeping: large batches,
    /// patient waits.
    pub fn high_throughput() -> Self {
        Self {
            mark_batch_length: 2048,
            mark_wait: Duration::from_millis(500),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.channel_count >= 1 && self.channel_count <= MAX_CHANNEL_COUNT,
            "channel count {} out of range [1; {}]",
            self.channel_count,
            MAX_CHANNEL_COUNT
        );
        ensure!(
            self.channel_count.is_power_of_two(),
            "channel count {} must be a power of two (oid routing uses a bit mask)",
            self.channel_count
        );
        ensure!(self.mark_batch_length >= 1, "mark batch length must be at least 1");
        ensure!(self.root_type_id != 0, "root type id must be non-zero");
        Ok(())
    }

    /// Bit mask selecting the owning channel from an oid's low bits.
    pub fn channel_mask(&self) -> u64 {
        (self.channel_count - 1) as u64
    }

    /// Number of low oid bits consumed by channel routing.
    pub fn channel_shift(&self) -> u32 {
        self.channel_count.trailing_zeros()
    }
}
