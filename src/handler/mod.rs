//! # External Collaborator Interfaces
//!
//! The storage core consumes its neighbors through narrow traits: type
//! handlers (field layout and reference iteration), the data-file layer,
//! zombie-oid handling, root-oid selection and the cache eviction policy.
//! Everything behind these seams — concrete field layouts, the blob store,
//! the network protocol — is out of scope for this crate.
//!
//! Standard implementations are provided where a default is genuinely
//! useful: [`SlotsHandler`] / [`BlobHandler`] for reference-slot and opaque
//! payloads, [`MemoryDataStore`] for embedding without a real file layer,
//! [`LoggingZombieHandler`] and [`ThresholdEvaluator`] as sane defaults.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::warn;

use crate::config::{DEFAULT_CACHE_MAX_IDLE_MS, DEFAULT_CACHE_THRESHOLD, MIN_ENTITY_LENGTH};
use crate::entity::{Entity, StoragePosition};

/// Per-type persistence logic consulted generically by the GC: reference
/// iteration and entity validation, without the core knowing field layouts.
pub trait TypeHandler: Send + Sync {
    fn type_id(&self) -> u64;

    /// Whether entities of this type can carry outgoing references at all.
    fn has_persisted_references(&self) -> bool;

    /// Number of fixed reference slots in the payload layout (0 for types
    /// with variable or no reference data).
    fn simple_reference_count(&self) -> u64;

    /// Feeds every reference oid found in `payload` to `accept`. Null
    /// references (oid 0) must not be reported.
    fn iterate_references(&self, payload: &[u8], accept: &mut dyn FnMut(u64)) -> Result<()>;

    /// Validates a record's header scalars against this type's layout.
    fn validate_entity(&self, length: u64, object_id: u64) -> Result<()>;
}

/// Lookup table from type id to its handler.
#[derive(Default)]
pub struct TypeDictionary {
    handlers: Mutex<HashMap<u64, Arc<dyn TypeHandler>>>,
}

impl TypeDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn TypeHandler>) {
        self.handlers.lock().insert(handler.type_id(), handler);
    }

    pub fn lookup(&self, type_id: u64) -> Option<Arc<dyn TypeHandler>> {
        self.handlers.lock().get(&type_id).cloned()
    }
}

/// Handler for types whose payload is a sequence of 8-byte little-endian
/// reference slots. A zero slot is a null reference.
pub struct SlotsHandler {
    type_id: u64,
    fixed_slots: u64,
}

impl SlotsHandler {
    /// Handler for a variable number of reference slots.
    pub fn new(type_id: u64) -> Self {
        Self {
            type_id,
            fixed_slots: 0,
        }
    }

    /// Handler whose layout carries at least `fixed_slots` leading
    /// reference slots; records too short to hold them are rejected.
    pub fn with_fixed_slots(type_id: u64, fixed_slots: u64) -> Self {
        Self {
            type_id,
            fixed_slots,
        }
    }
}

impl TypeHandler for SlotsHandler {
    fn type_id(&self) -> u64 {
        self.type_id
    }

    fn has_persisted_references(&self) -> bool {
        true
    }

    fn simple_reference_count(&self) -> u64 {
        self.fixed_slots
    }

    fn iterate_references(&self, payload: &[u8], accept: &mut dyn FnMut(u64)) -> Result<()> {
        ensure!(
            payload.len() % 8 == 0,
            "reference-slot payload length {} is not a multiple of 8",
            payload.len()
        );
        for slot in payload.chunks_exact(8) {
            let oid = u64::from_le_bytes(slot.try_into().unwrap());
            if oid != 0 {
                accept(oid);
            }
        }
        Ok(())
    }

    fn validate_entity(&self, length: u64, object_id: u64) -> Result<()> {
        ensure!(object_id != 0, "null object id for type {}", self.type_id);
        ensure!(
            length >= MIN_ENTITY_LENGTH && (length - MIN_ENTITY_LENGTH) % 8 == 0,
            "invalid reference-slot record length {} for type {}",
            length,
            self.type_id
        );
        Ok(())
    }
}

/// Handler for leaf types with an opaque payload and no references.
pub struct BlobHandler {
    type_id: u64,
}

impl BlobHandler {
    pub fn new(type_id: u64) -> Self {
        Self { type_id }
    }
}

impl TypeHandler for BlobHandler {
    fn type_id(&self) -> u64 {
        self.type_id
    }

    fn has_persisted_references(&self) -> bool {
        false
    }

    fn simple_reference_count(&self) -> u64 {
        0
    }

    fn iterate_references(&self, _payload: &[u8], _accept: &mut dyn FnMut(u64)) -> Result<()> {
        Ok(())
    }

    fn validate_entity(&self, length: u64, object_id: u64) -> Result<()> {
        ensure!(object_id != 0, "null object id for type {}", self.type_id);
        ensure!(
            length >= MIN_ENTITY_LENGTH,
            "record length {} below header size for type {}",
            length,
            self.type_id
        );
        Ok(())
    }
}

/// Narrow interface to the data-file layer: payload reload, stale-position
/// release, and the post-sweep cleanup-cursor reset.
pub trait DataStore: Send + Sync {
    /// Loads the payload bytes of the record at `position`. `length` is the
    /// full record length; implementations return only the payload.
    fn load(&self, position: StoragePosition, length: u64) -> Result<Box<[u8]>>;

    /// Releases an entity's claim on a stale file position.
    fn detach(&self, position: StoragePosition);

    /// Resets the file cleanup cursor so housekeeping re-checks all files
    /// against the post-sweep state.
    fn reset_cleanup_cursor(&self);
}

/// In-memory data store keyed by storage position. Stands in for the file
/// layer in tests and in embeddings that do not persist to disk.
#[derive(Default)]
pub struct MemoryDataStore {
    payloads: Mutex<HashMap<StoragePosition, Box<[u8]>>>,
    cleanup_resets: AtomicU64,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, position: StoragePosition, payload: &[u8]) {
        self.payloads.lock().insert(position, payload.into());
    }

    pub fn cleanup_resets(&self) -> u64 {
        self.cleanup_resets.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.payloads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DataStore for MemoryDataStore {
    fn load(&self, position: StoragePosition, _length: u64) -> Result<Box<[u8]>> {
        self.payloads
            .lock()
            .get(&position)
            .cloned()
            .ok_or_else(|| {
                eyre::eyre!(
                    "no record at file {} offset {}",
                    position.file_id,
                    position.offset
                )
            })
    }

    fn detach(&self, position: StoragePosition) {
        self.payloads.lock().remove(&position);
    }

    fn reset_cleanup_cursor(&self) {
        self.cleanup_resets.fetch_add(1, Ordering::Relaxed);
    }
}

/// Callback for mark-queue oids with no live entry. Expected for genuinely
/// deleted entities still referenced by stale data; never fatal.
pub trait ZombieOidHandler: Send + Sync {
    fn handle_zombie_oid(&self, object_id: u64);
}

/// Default zombie handler: counts and logs.
#[derive(Default)]
pub struct LoggingZombieHandler {
    encountered: AtomicU64,
}

impl LoggingZombieHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encountered(&self) -> u64 {
        self.encountered.load(Ordering::Relaxed)
    }
}

impl ZombieOidHandler for LoggingZombieHandler {
    fn handle_zombie_oid(&self, object_id: u64) {
        self.encountered.fetch_add(1, Ordering::Relaxed);
        warn!(object_id, "zombie oid encountered during marking");
    }
}

/// Accumulates a channel's root-oid candidates during the post-sweep root
/// query. The valid root is the numerically greatest candidate: roots are
/// re-stored under fresh, increasing oids, so the greatest one is newest.
#[derive(Debug, Default)]
pub struct RootOidSelector {
    current: u64,
}

impl RootOidSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.current = 0;
    }

    pub fn accept(&mut self, object_id: u64) {
        if object_id > self.current {
            self.current = object_id;
        }
    }

    pub fn yield_root(&self) -> u64 {
        self.current
    }
}

/// Eviction policy for cached entity payloads. Consulted with the channel's
/// total cached bytes, the evaluation timestamp and the entity itself.
pub trait CacheEvaluator: Send + Sync {
    fn clear_entity_cache(&self, total_cached: u64, eval_time_ms: u64, entity: &Entity) -> bool;
}

/// Default policy: clear once the channel's cache exceeds a byte threshold,
/// or when a payload has been idle past a maximum age.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdEvaluator {
    pub threshold_bytes: u64,
    pub max_idle_ms: u64,
}

impl Default for ThresholdEvaluator {
    fn default() -> Self {
        Self {
            threshold_bytes: DEFAULT_CACHE_THRESHOLD,
            max_idle_ms: DEFAULT_CACHE_MAX_IDLE_MS,
        }
    }
}

impl ThresholdEvaluator {
    pub fn new(threshold_bytes: u64, max_idle_ms: u64) -> Self {
        Self {
            threshold_bytes,
            max_idle_ms,
        }
    }

    /// Policy that never clears, for workloads that fit in memory.
    pub fn keep_all() -> Self {
        Self::new(u64::MAX, u64::MAX)
    }
}

impl CacheEvaluator for ThresholdEvaluator {
    fn clear_entity_cache(&self, total_cached: u64, eval_time_ms: u64, entity: &Entity) -> bool {
        if total_cached >= self.threshold_bytes {
            return true;
        }
        eval_time_ms.saturating_sub(entity.last_touch()) >= self.max_idle_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::NIL;

    #[test]
    fn test_slots_handler_skips_null_references() {
        let handler = SlotsHandler::new(7);
        let mut payload = Vec::new();
        for oid in [10u64, 0, 11, 0, 12] {
            payload.extend_from_slice(&oid.to_le_bytes());
        }

        let mut seen = Vec::new();
        handler
            .iterate_references(&payload, &mut |oid| seen.push(oid))
            .unwrap();
        assert_eq!(seen, vec![10, 11, 12]);
    }

    #[test]
    fn test_slots_handler_rejects_ragged_payload() {
        let handler = SlotsHandler::new(7);
        let payload = [0u8; 12];
        assert!(handler
            .iterate_references(&payload, &mut |_| {})
            .is_err());
        assert!(handler.validate_entity(MIN_ENTITY_LENGTH + 12, 1).is_err());
        assert!(handler.validate_entity(MIN_ENTITY_LENGTH + 16, 1).is_ok());
    }

    #[test]
    fn test_memory_data_store_load_detach() {
        let store = MemoryDataStore::new();
        let pos = StoragePosition::new(0, 128);
        store.insert(pos, &[1, 2, 3]);

        let payload = store.load(pos, MIN_ENTITY_LENGTH + 3).unwrap();
        assert_eq!(&*payload, &[1, 2, 3]);

        store.detach(pos);
        assert!(store.load(pos, MIN_ENTITY_LENGTH + 3).is_err());
    }

    #[test]
    fn test_root_selector_keeps_greatest() {
        let mut selector = RootOidSelector::new();
        selector.accept(5);
        selector.accept(42);
        selector.accept(17);
        assert_eq!(selector.yield_root(), 42);

        selector.reset();
        assert_eq!(selector.yield_root(), 0);
    }

    #[test]
    fn test_threshold_evaluator() {
        let evaluator = ThresholdEvaluator::new(1024, 10_000);
        let mut entity = Entity::new(1, 0, false, NIL);
        entity.put_cache(vec![0u8; 16].into_boxed_slice(), 1_000);

        // under threshold and fresh: keep
        assert!(!evaluator.clear_entity_cache(512, 2_000, &entity));
        // over threshold: clear
        assert!(evaluator.clear_entity_cache(2048, 2_000, &entity));
        // idle past maximum age: clear
        assert!(evaluator.clear_entity_cache(512, 12_000, &entity));
    }
}
