//! # graphstore Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! ENTITY_HEADER_SIZE (24 bytes)
//!       │
//!       └─> MIN_ENTITY_LENGTH (no record can be shorter than its header)
//!
//! MARK_BATCH_LENGTH (500 oids)
//!       │
//!       ├─> Per-channel mark buffer allocation (one u64 per slot)
//!       │
//!       └─> MARK_FLUSH_LENGTH (must be <=)
//!             Reference discoveries are buffered per target channel and
//!             flushed batch-wise. Keeping the flush batch no larger than
//!             the mark batch bounds the latency until a blocked channel
//!             receives new work.
//!
//! MAX_CHANNEL_COUNT (power of two)
//!       │
//!       └─> Channel routing uses `oid & (channel_count - 1)`, so every
//!           valid channel count must be a power of two.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `MARK_BATCH_LENGTH >= 1` (the starvation guard processes at least one
//!    oid per mark call, so the batch buffer must hold at least one)
//! 2. `MARK_FLUSH_LENGTH <= MARK_BATCH_LENGTH` (bounded wakeup latency)
//! 3. `MAX_CHANNEL_COUNT.is_power_of_two()` (routing mask correctness)

/// Size of the fixed entity record header in bytes:
/// `[length: u64][type_id: u64][object_id: u64]`, all little-endian.
pub const ENTITY_HEADER_SIZE: usize = 24;

/// Minimum valid value of an entity record's `length` field.
/// A record is its header plus an optional payload.
pub const MIN_ENTITY_LENGTH: u64 = ENTITY_HEADER_SIZE as u64;

/// Number of oids a channel pulls from its mark queue per batch.
/// Larger batches amortize monitor lock traffic; smaller batches react
/// faster to the time budget.
pub const MARK_BATCH_LENGTH: usize = 500;

/// Number of buffered reference discoveries per target channel before the
/// reference marker flushes them through the monitor.
pub const MARK_FLUSH_LENGTH: usize = 64;

/// Default bounded wait (milliseconds) for new mark-queue work before a
/// blocked channel rechecks completion and its time budget.
pub const DEFAULT_MARK_WAIT_MS: u64 = 100;

/// Maximum supported channel count. Routing uses the low oid bits, so this
/// must be a power of two.
pub const MAX_CHANNEL_COUNT: u32 = 64;

/// Default byte threshold above which the cache evaluator starts clearing
/// cached entity payloads (8MB).
pub const DEFAULT_CACHE_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Default idle time (milliseconds) after which a cached payload becomes a
/// clearing candidate regardless of total cache size.
pub const DEFAULT_CACHE_MAX_IDLE_MS: u64 = 86_400_000;

const _: () = assert!(MARK_BATCH_LENGTH >= 1, "starvation guard needs room for one oid");

const _: () = assert!(
    MARK_FLUSH_LENGTH <= MARK_BATCH_LENGTH,
    "MARK_FLUSH_LENGTH must not exceed MARK_BATCH_LENGTH"
);

const _: () = assert!(MAX_CHANNEL_COUNT.is_power_of_two(), "channel routing mask requires a power of two");
