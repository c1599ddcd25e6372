//! # Garbage Collection Coordination
//!
//! Cross-channel machinery for the incremental mark-and-sweep collector:
//!
//! - [`MarkQueue`]: per-channel shared oid queue with bounded timed waits
//! - [`MarkMonitor`]: the global phase machine and pending-count arbiter
//! - [`ReferenceMarker`]: per-channel batching of reference discoveries
//!
//! The channel-local half of the collector (incremental mark loop, sweep
//! pass, cache eviction loop) lives in [`crate::cache`].

mod marker;
mod monitor;
mod queue;

pub use marker::ReferenceMarker;
pub use monitor::{GcPhase, GcStats, MarkMonitor};
pub use queue::MarkQueue;
