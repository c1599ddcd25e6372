//! # Entity Type Registry
//!
//! Per-channel authoritative enumeration of entities by persisted type.
//! Each [`TypeEntry`] owns an insertion-ordered singly-linked entity list
//! (head/tail arena handles, `type_next` links) plus a hash-chain link for
//! type-id lookup.
//!
//! ## List Contract
//!
//! - `add_entity` appends at the tail, O(1). No reordering ever happens:
//!   the sweep iterates with a lagging predecessor cursor and relies on
//!   insertion order being stable between sweeps.
//! - `remove_entity` requires the immediate predecessor, obtained during
//!   the same iteration pass, for an O(1) unlink. Traversal-order
//!   bookkeeping is deliberately the caller's job; the list never searches.
//!
//! Types are created lazily on first entity and never removed until a
//! channel reset. The tid hash table doubles whenever the type count
//! reaches the current modulo; rebuild happens before registering the new
//! entry so a rebuild failure cannot leave a half-registered type.

use std::sync::Arc;

use crate::entity::{Entity, EntityArena, NIL};
use crate::handler::TypeHandler;

/// One distinct persisted type within a channel.
pub(crate) struct TypeEntry {
    pub type_id: u64,
    pub handler: Arc<dyn TypeHandler>,
    pub has_references: bool,
    pub simple_reference_count: u64,
    pub entity_count: u64,
    pub head: u32,
    pub tail: u32,
    hash_next: u32,
}

/// Per-channel type registry: insertion-ordered arena of [`TypeEntry`]
/// values plus tid hash chains.
pub(crate) struct TypeTable {
    entries: Vec<TypeEntry>,
    buckets: Vec<u32>,
    modulo: u64,
}

impl TypeTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            buckets: vec![NIL],
            modulo: 0,
        }
    }

    fn hash_index(type_id: u64, modulo: u64) -> usize {
        (type_id & modulo) as usize
    }

    pub fn lookup(&self, type_id: u64) -> Option<u32> {
        let mut slot = self.buckets[Self::hash_index(type_id, self.modulo)];
        while slot != NIL {
            let entry = &self.entries[slot as usize];
            if entry.type_id == type_id {
                return Some(slot);
            }
            slot = entry.hash_next;
        }
        None
    }

    /// Registers a new type for `handler`. The caller must have checked
    /// `lookup` first; duplicate registration is a programming error.
    pub fn insert(&mut self, handler: Arc<dyn TypeHandler>) -> u32 {
        let type_id = handler.type_id();
        debug_assert!(self.lookup(type_id).is_none(), "type {type_id} registered twice");

        // rebuild first, then create and register, so a grown table never
        // contains a partially initialized entry
        if self.entries.len() as u64 >= self.modulo {
            self.rebuild_hash_table();
        }

        let index = Self::hash_index(type_id, self.modulo);
        let slot = self.entries.len() as u32;
        self.entries.push(TypeEntry {
            type_id,
            has_references: handler.has_persisted_references(),
            simple_reference_count: handler.simple_reference_count(),
            handler,
            entity_count: 0,
            head: NIL,
            tail: NIL,
            hash_next: self.buckets[index],
        });
        self.buckets[index] = slot;
        slot
    }

    fn rebuild_hash_table(&mut self) {
        let new_modulo = ((self.modulo + 1) << 1) - 1;
        let mut new_buckets = vec![NIL; (new_modulo + 1) as usize];

        for mut slot in std::mem::take(&mut self.buckets) {
            while slot != NIL {
                let entry = &mut self.entries[slot as usize];
                let next = entry.hash_next;
                let index = Self::hash_index(entry.type_id, new_modulo);
                entry.hash_next = new_buckets[index];
                new_buckets[index] = slot;
                slot = next;
            }
        }

        self.buckets = new_buckets;
        self.modulo = new_modulo;
    }

    pub fn entry(&self, slot: u32) -> &TypeEntry {
        &self.entries[slot as usize]
    }

    pub fn handler(&self, slot: u32) -> Arc<dyn TypeHandler> {
        Arc::clone(&self.entries[slot as usize].handler)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Type slots in insertion order (types are never removed).
    pub fn slots(&self) -> impl Iterator<Item = u32> {
        0..self.entries.len() as u32
    }

    /// Appends `handle` at the tail of `slot`'s entity list.
    pub fn add_entity(&mut self, slot: u32, handle: u32, arena: &mut EntityArena) {
        let entry = &mut self.entries[slot as usize];
        if entry.tail == NIL {
            entry.head = handle;
        } else {
            arena.get_mut(entry.tail).type_next = handle;
        }
        entry.tail = handle;
        entry.entity_count += 1;
    }

    /// Unlinks `handle` given its predecessor (`NIL` when `handle` is the
    /// list head). O(1); the predecessor comes from the caller's own
    /// forward pass.
    pub fn remove_entity(&mut self, slot: u32, handle: u32, previous: u32, arena: &mut EntityArena) {
        let next = arena.get(handle).type_next;
        let entry = &mut self.entries[slot as usize];

        if previous == NIL {
            debug_assert_eq!(entry.head, handle, "predecessor contract violated");
            entry.head = next;
        } else {
            debug_assert_eq!(arena.get(previous).type_next, handle, "predecessor contract violated");
            arena.get_mut(previous).type_next = next;
        }
        if entry.tail == handle {
            entry.tail = previous;
        }
        entry.entity_count -= 1;
    }

    /// Forward pass over `slot`'s entities. Finite, not restartable
    /// mid-pass; safe only without concurrent structural mutation, which
    /// single-threaded-per-channel confinement guarantees.
    pub fn iterate_entities(&self, slot: u32, arena: &EntityArena, mut visit: impl FnMut(u32, &Entity)) {
        let mut handle = self.entries[slot as usize].head;
        while handle != NIL {
            let entity = arena.get(handle);
            visit(handle, entity);
            handle = entity.type_next;
        }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.buckets.clear();
        self.buckets.push(NIL);
        self.modulo = 0;
    }
}
