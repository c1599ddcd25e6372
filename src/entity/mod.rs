//! # Entity Model
//!
//! In-memory representation of persisted entities. Each channel owns an
//! [`EntityArena`], a slab of [`Entity`] slots addressed by stable `u32`
//! handles. Hash-bucket chains and per-type lists are expressed as explicit
//! `hash_next` / `type_next` handle fields instead of owned pointers, which
//! keeps the doubly-indexed structure (oid hash table + type list) free of
//! ownership cycles.
//!
//! ## GC Color Protocol
//!
//! Entities carry a tri-color mark state ([`GcColor`]):
//!
//! - **White**: not (yet) proven reachable in the current cycle. This is
//!   both the initial color and the color survivors are reset to at sweep.
//! - **Gray**: proven reachable, outgoing references not yet processed.
//! - **Black**: proven reachable, all references enqueued.
//!
//! Legal transitions: `White→Gray` (store or reference discovery),
//! `Gray→Black` (mark pass scanned the references), `Black→Gray` (re-store
//! forces a re-scan), `Gray|Black→White` (sweep resets survivors).
//!
//! Two rules make the cycle boundary unambiguous:
//!
//! 1. A Gray entity at sweep time always survives. Its oid is still pending
//!    in the mark queue, so the next marking phase re-processes it.
//! 2. An entity may legally be White *and* enqueued (rule 1 produces this
//!    state right after a sweep). Marking therefore skips only Black
//!    entries; a White-but-enqueued entity is simply scanned again.
//!
//! Payload bytes (`cached`) are present only while an entity is live; the
//! resting state is uncached to bound memory. Cache accounting is the
//! owning [`EntityCache`](crate::cache::EntityCache)'s job, which is why
//! [`Entity::put_cache`] and [`Entity::clear_cache`] report byte deltas.

mod record;

pub use record::{ChunkBuilder, ChunkRecords, EntityHeader, EntityRecord};

/// Sentinel handle marking the end of a hash or type chain.
pub(crate) const NIL: u32 = u32::MAX;

/// Location of an entity's current record inside the backing data files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoragePosition {
    pub file_id: u32,
    pub offset: u64,
}

impl StoragePosition {
    pub fn new(file_id: u32, offset: u64) -> Self {
        Self { file_id, offset }
    }
}

/// Tri-color garbage collection mark state. See the module docs for the
/// transition rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcColor {
    White,
    Gray,
    Black,
}

/// One persisted entity, resident in a channel's [`EntityArena`].
#[derive(Debug)]
pub struct Entity {
    object_id: u64,
    type_slot: u32,
    length: u64,
    storage: Option<StoragePosition>,
    cached: Option<Box<[u8]>>,
    last_touch: u64,
    color: GcColor,
    has_references: bool,
    deleted: bool,
    pub(crate) hash_next: u32,
    pub(crate) type_next: u32,
}

impl Entity {
    pub(crate) fn new(object_id: u64, type_slot: u32, has_references: bool, hash_next: u32) -> Self {
        Self {
            object_id,
            type_slot,
            length: 0,
            storage: None,
            cached: None,
            last_touch: 0,
            color: GcColor::White,
            has_references,
            deleted: false,
            hash_next,
            type_next: NIL,
        }
    }

    pub fn object_id(&self) -> u64 {
        self.object_id
    }

    pub(crate) fn type_slot(&self) -> u32 {
        self.type_slot
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub(crate) fn set_length(&mut self, length: u64) {
        self.length = length;
    }

    pub fn storage(&self) -> Option<StoragePosition> {
        self.storage
    }

    pub(crate) fn set_storage(&mut self, position: StoragePosition) {
        self.storage = Some(position);
    }

    /// Detaches the entity from its backing file, returning the stale
    /// position so the caller can notify the data store.
    pub(crate) fn detach_storage(&mut self) -> Option<StoragePosition> {
        self.storage.take()
    }

    /// An entity is live while its payload is resident in memory.
    pub fn is_live(&self) -> bool {
        self.cached.is_some()
    }

    pub fn cached_len(&self) -> u64 {
        self.cached.as_ref().map_or(0, |c| c.len() as u64)
    }

    pub(crate) fn payload(&self) -> Option<&[u8]> {
        self.cached.as_deref()
    }

    /// Installs payload bytes and returns the number of bytes now cached.
    /// Any previously cached payload must have been cleared first so the
    /// owning cache's byte accounting stays exact.
    pub(crate) fn put_cache(&mut self, payload: Box<[u8]>, now_ms: u64) -> u64 {
        debug_assert!(self.cached.is_none(), "put_cache over resident payload");
        let added = payload.len() as u64;
        self.cached = Some(payload);
        self.last_touch = now_ms;
        added
    }

    /// Drops the cached payload and returns the number of bytes freed.
    pub(crate) fn clear_cache(&mut self) -> u64 {
        let freed = self.cached_len();
        self.cached = None;
        freed
    }

    pub fn last_touch(&self) -> u64 {
        self.last_touch
    }

    pub(crate) fn touch(&mut self, now_ms: u64) {
        self.last_touch = now_ms;
    }

    pub fn color(&self) -> GcColor {
        self.color
    }

    pub fn has_references(&self) -> bool {
        self.has_references
    }

    pub(crate) fn mark_gray(&mut self) {
        self.color = GcColor::Gray;
    }

    pub(crate) fn mark_black(&mut self) {
        self.color = GcColor::Black;
    }

    pub(crate) fn mark_white(&mut self) {
        self.color = GcColor::White;
    }

    /// Marked means "reachable in the current cycle": Gray or Black.
    pub fn is_marked(&self) -> bool {
        self.color != GcColor::White
    }

    pub fn is_black(&self) -> bool {
        self.color == GcColor::Black
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub(crate) fn set_deleted(&mut self) {
        self.deleted = true;
    }
}

/// Slab arena of entities with stable handles and a free-list.
///
/// Handles stay valid until the slot is released, which the hash and type
/// chains rely on. Released slots keep their tombstoned entity until reuse
/// so that debug assertions can catch stale-handle access.
#[derive(Debug, Default)]
pub(crate) struct EntityArena {
    slots: Vec<Entity>,
    free: Vec<u32>,
}

impl EntityArena {
    pub fn insert(&mut self, entity: Entity) -> u32 {
        match self.free.pop() {
            Some(handle) => {
                self.slots[handle as usize] = entity;
                handle
            }
            None => {
                let handle = self.slots.len() as u32;
                assert!(handle < NIL, "entity arena exhausted");
                self.slots.push(entity);
                handle
            }
        }
    }

    pub fn get(&self, handle: u32) -> &Entity {
        let entity = &self.slots[handle as usize];
        debug_assert!(!entity.deleted, "access to released entity slot {handle}");
        entity
    }

    pub fn get_mut(&mut self, handle: u32) -> &mut Entity {
        let entity = &mut self.slots[handle as usize];
        debug_assert!(!entity.deleted, "access to released entity slot {handle}");
        entity
    }

    /// Returns the slot to the free-list. The entity must already be
    /// tombstoned (deletion step 5).
    pub fn release(&mut self, handle: u32) {
        debug_assert!(
            self.slots[handle as usize].deleted,
            "release of live entity slot {handle}"
        );
        self.free.push(handle);
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}
