//! # graphstore - Embedded Object-Graph Persistence Core
//!
//! graphstore is the storage core of an embedded object-graph persistence
//! engine: entities are stored as binary records, registered in per-channel
//! caches and reclaimed by an incremental cross-channel mark-and-sweep
//! garbage collector. This implementation prioritizes:
//!
//! - **Lock-free channel interiors**: one thread owns a channel; only the
//!   mark monitor is shared
//! - **Zero-copy record access**: header scalars read straight from chunk
//!   bytes
//! - **Bounded pauses**: every GC and cache-check entry point takes a time
//!   budget and always makes progress
//!
//! ## Quick Start
//!
//! ```ignore
//! use graphstore::{GcConfig, GraphEngine, StoreEntity, TypeDictionary};
//!
//! let dictionary = TypeDictionary::new();
//! // register a SlotsHandler / BlobHandler per persisted type ...
//!
//! let mut engine = GraphEngine::new(GcConfig::default(), dictionary.into())?;
//! engine.store(&[StoreEntity { object_id: 1, type_id: 1, payload: &[] }])?;
//! engine.run_gc(std::time::Duration::from_millis(10))?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Engine Facade (GraphEngine)       │
//! ├─────────────────────────────────────────┤
//! │ EntityCache (channel 0) │ ... │ (ch n-1) │   one thread each
//! │  oid hash │ type lists │ mark │ sweep    │
//! ├─────────────────────────────────────────┤
//! │   MarkMonitor + per-channel MarkQueues   │   the only shared state
//! ├─────────────────────────────────────────┤
//! │  Binary Entity Records (chunk walking)   │
//! ├─────────────────────────────────────────┤
//! │ Collaborator traits: TypeHandler,        │
//! │ DataStore, CacheEvaluator, ...           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Channel Routing
//!
//! Oids are routed by their low bits: `oid & (channel_count - 1)` names the
//! owning channel, and everything channel-local is touched only by that
//! channel's thread. Cross-channel reference discoveries travel through the
//! owning channel's mark queue instead of touching its structures.
//!
//! ## Module Overview
//!
//! - [`engine`]: multi-channel facade, store routing, parallel GC driver
//! - [`cache`]: per-channel entity cache and the channel-local GC half
//! - [`gc`]: mark monitor, mark queues, reference marker
//! - `registry`: per-channel type registry with insertion-ordered lists
//! - [`entity`]: entity model, arena, binary record access
//! - [`handler`]: collaborator traits and standard implementations
//! - [`config`]: constants and runtime tuning knobs

pub mod cache;
pub mod config;
pub mod engine;
pub mod entity;
pub mod gc;
pub mod handler;
mod macros;
pub(crate) mod registry;

pub use cache::{EntityCache, IdRangeAnalysis};
pub use config::GcConfig;
pub use engine::{GraphEngine, StoreEntity};
pub use entity::{ChunkBuilder, ChunkRecords, Entity, EntityHeader, EntityRecord, GcColor, StoragePosition};
pub use gc::{GcPhase, GcStats, MarkMonitor};
pub use handler::{
    BlobHandler, CacheEvaluator, DataStore, LoggingZombieHandler, MemoryDataStore, RootOidSelector,
    SlotsHandler, ThresholdEvaluator, TypeDictionary, TypeHandler, ZombieOidHandler,
};
