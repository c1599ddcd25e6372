//! # Entity Cache
//!
//! The per-channel hub of the storage engine: an object-id indexed registry
//! of every live entity the channel owns, the entity lifecycle
//! (create/update/delete), payload-cache accounting and eviction, and the
//! channel-local half of the incremental mark-and-sweep collector.
//!
//! ## Thread Confinement
//!
//! One worker thread owns a channel outright. The hash table, the type
//! lists and all entity state are mutated without locks because no other
//! thread ever touches them — the only shared state is the mark monitor
//! and its queues. This is why `get_entry` can interleave freely with
//! structural and GC mutations: they all happen on the same thread.
//!
//! ## Oid Hash Table
//!
//! Bucket array of arena handles, length always a power of two, indexed by
//! `(oid >> channel_shift) & mask`. The shift drops the channel-routing
//! bits so oids of one channel still distribute over the whole table. The
//! table is rebuilt (never resized in place) when the entity count reaches
//! the mask, and shrink-checked when a GC cycle completes so an idle
//! channel does not pin a huge empty table.
//!
//! ## Store/GC Interaction
//!
//! Every create and every re-store runs `ensure_gray`: entities with
//! references are grayed and their oid enqueued through the monitor,
//! entities without references are black right away (vacuously fully
//! marked). A re-store of an already black entity therefore forces it back
//! to gray — without this, a store racing the mark phase could leave a
//! stale black entity whose new references are never visited, and the next
//! sweep would collect live data ("doomed kept alive").
//!
//! ## Sweep
//!
//! Runs only when the monitor has confirmed marking is globally exhausted.
//! One forward pass per type list with a lagging predecessor cursor:
//! marked entities (gray or black) are rescued and reset to white as the
//! next cycle's starting color, white entities are deleted via the ordered
//! five-step protocol. Gray entities at sweep time are legal (a store can
//! slip in between mark exhaustion and this channel's sweep) and always
//! survive; their oid is still pending, so the next mark phase re-scans
//! them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{ensure, Result};
use tracing::{debug, trace};

use crate::config::{GcConfig, MIN_ENTITY_LENGTH};
use crate::entity::{Entity, EntityArena, StoragePosition, NIL};
use crate::entity::{ChunkRecords, EntityRecord};
use crate::gc::{MarkMonitor, ReferenceMarker};
use crate::handler::{
    CacheEvaluator, DataStore, RootOidSelector, TypeDictionary, ZombieOidHandler,
};
use crate::registry::TypeTable;

/// Highest ids observed while validating a channel's entities, used for
/// id-range recovery after a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdRangeAnalysis {
    pub max_object_id: u64,
    pub max_type_id: u64,
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct EntityCache {
    channel_index: u32,
    channel_mask: u64,
    channel_shift: u32,
    root_type_id: u64,
    mark_wait: Duration,

    monitor: Arc<MarkMonitor>,
    dictionary: Arc<TypeDictionary>,
    data: Arc<dyn DataStore>,
    zombies: Arc<dyn ZombieOidHandler>,
    evaluator: Arc<dyn CacheEvaluator>,

    marker: ReferenceMarker,
    mark_buffer: Box<[u64]>,
    /// Last mark round this channel seeded its root entities into.
    seeded_round: Option<u64>,

    arena: EntityArena,
    buckets: Box<[u32]>,
    oid_mask: u64,
    oid_size: u64,

    types: TypeTable,
    root_type_slot: u32,
    root_selector: RootOidSelector,

    /// Cursor of the incremental live check: (type slot, entity handle).
    live_cursor: Option<(u32, u32)>,
    used_cache_size: u64,

    sweep_generation: u64,
    last_sweep_start: u64,
    last_sweep_end: u64,
}

impl EntityCache {
    pub fn new(
        channel_index: u32,
        config: &GcConfig,
        monitor: Arc<MarkMonitor>,
        dictionary: Arc<TypeDictionary>,
        data: Arc<dyn DataStore>,
        zombies: Arc<dyn ZombieOidHandler>,
        evaluator: Arc<dyn CacheEvaluator>,
    ) -> Result<Self> {
        config.validate()?;
        ensure!(
            channel_index < config.channel_count,
            "channel index {} out of range for {} channels",
            channel_index,
            config.channel_count
        );

        let marker = ReferenceMarker::new(Arc::clone(&monitor));
        let mut cache = Self {
            channel_index,
            channel_mask: config.channel_mask(),
            channel_shift: config.channel_shift(),
            root_type_id: config.root_type_id,
            mark_wait: config.mark_wait,
            monitor,
            dictionary,
            data,
            zombies,
            evaluator,
            marker,
            mark_buffer: vec![0; config.mark_batch_length].into_boxed_slice(),
            seeded_round: None,
            arena: EntityArena::default(),
            buckets: vec![NIL; 1].into_boxed_slice(),
            oid_mask: 0,
            oid_size: 0,
            types: TypeTable::new(),
            root_type_slot: 0,
            root_selector: RootOidSelector::new(),
            live_cursor: None,
            used_cache_size: 0,
            sweep_generation: 0,
            last_sweep_start: 0,
            last_sweep_end: 0,
        };
        cache.root_type_slot = cache.get_or_insert_type(cache.root_type_id)?;
        Ok(cache)
    }

    pub fn channel_index(&self) -> u32 {
        self.channel_index
    }

    pub fn entity_count(&self) -> u64 {
        self.oid_size
    }

    /// Total bytes of cached entity payloads on this channel.
    pub fn cache_size(&self) -> u64 {
        self.used_cache_size
    }

    pub fn sweep_generation(&self) -> u64 {
        self.sweep_generation
    }

    pub fn last_sweep_start(&self) -> u64 {
        self.last_sweep_start
    }

    pub fn last_sweep_end(&self) -> u64 {
        self.last_sweep_end
    }

    // ------------------------------------------------------------------
    // oid hash table
    // ------------------------------------------------------------------

    fn oid_hash_index(oid: u64, shift: u32, mask: u64) -> usize {
        // channel-routing bits are shifted out so one channel's oids still
        // spread over the whole table
        ((oid >> shift) & mask) as usize
    }

    fn validate_object_id(&self, object_id: u64) -> Result<()> {
        ensure!(object_id != 0, "null object id");
        ensure!(
            object_id & self.channel_mask == self.channel_index as u64,
            "invalid object id {} for channel {}",
            object_id,
            self.channel_index
        );
        Ok(())
    }

    fn get_entry(&self, object_id: u64) -> Option<u32> {
        let index = Self::oid_hash_index(object_id, self.channel_shift, self.oid_mask);
        let mut handle = self.buckets[index];
        while handle != NIL {
            let entity = self.arena.get(handle);
            if entity.object_id() == object_id {
                return Some(handle);
            }
            handle = entity.hash_next;
        }
        None
    }

    pub fn get(&self, object_id: u64) -> Option<&Entity> {
        self.get_entry(object_id).map(|h| self.arena.get(h))
    }

    pub fn contains(&self, object_id: u64) -> bool {
        self.get_entry(object_id).is_some()
    }

    fn rebuild_oid_buckets(&mut self, new_len: usize) {
        debug_assert!(new_len.is_power_of_two());
        let new_mask = new_len as u64 - 1;
        let mut new_buckets = vec![NIL; new_len].into_boxed_slice();

        let old_buckets = std::mem::replace(&mut self.buckets, Box::new([]));
        for &head in old_buckets.iter() {
            let mut handle = head;
            while handle != NIL {
                let entity = self.arena.get_mut(handle);
                let next = entity.hash_next;
                let index = Self::oid_hash_index(entity.object_id(), self.channel_shift, new_mask);
                entity.hash_next = new_buckets[index];
                new_buckets[index] = handle;
                handle = next;
            }
        }

        self.buckets = new_buckets;
        self.oid_mask = new_mask;
    }

    fn enlarge_oid_hash_table(&mut self) {
        self.rebuild_oid_buckets((self.buckets.len() << 1).max(2));
    }

    /// Shrinks the hash table when a completed GC left it mostly empty,
    /// bounding idle memory.
    fn check_oid_hash_table_consolidation(&mut self) {
        if (self.buckets.len() as u64) >> 1 < self.oid_size {
            return;
        }
        let new_len = (self.oid_size.max(1) as usize).next_power_of_two();
        if new_len < self.buckets.len() {
            self.rebuild_oid_buckets(new_len);
        }
    }

    fn unregister_entity(&mut self, handle: u32) {
        let object_id = self.arena.get(handle).object_id();
        let index = Self::oid_hash_index(object_id, self.channel_shift, self.oid_mask);

        if self.buckets[index] == handle {
            self.buckets[index] = self.arena.get(handle).hash_next;
        } else {
            // the entity is guaranteed to be in the chain
            let mut entry = self.buckets[index];
            while self.arena.get(entry).hash_next != handle {
                entry = self.arena.get(entry).hash_next;
            }
            let next = self.arena.get(handle).hash_next;
            self.arena.get_mut(entry).hash_next = next;
        }
        self.oid_size -= 1;
    }

    // ------------------------------------------------------------------
    // types
    // ------------------------------------------------------------------

    fn get_or_insert_type(&mut self, type_id: u64) -> Result<u32> {
        if let Some(slot) = self.types.lookup(type_id) {
            return Ok(slot);
        }
        let handler = self
            .dictionary
            .lookup(type_id)
            .ok_or_else(|| eyre::eyre!("no type handler registered for type id {type_id}"))?;
        Ok(self.types.insert(handler))
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    fn create_entity(&mut self, object_id: u64, type_slot: u32) -> Result<u32> {
        self.validate_object_id(object_id)?;

        if self.oid_size >= self.oid_mask {
            self.enlarge_oid_hash_table();
        }

        let index = Self::oid_hash_index(object_id, self.channel_shift, self.oid_mask);
        let has_references = self.types.entry(type_slot).has_references;
        let handle = self
            .arena
            .insert(Entity::new(object_id, type_slot, has_references, self.buckets[index]));
        self.buckets[index] = handle;
        self.types.add_entity(type_slot, handle, &mut self.arena);
        // increment size only after creation and registration succeeded
        self.oid_size += 1;

        self.ensure_gray(handle);
        Ok(handle)
    }

    fn update_put_entity(&mut self, handle: u32) {
        // the old payload must not stay cached
        self.ensure_no_cached_data(handle);
        // a black entity goes back to gray: its new references must be
        // visited before the next sweep may trust it
        self.ensure_gray(handle);
        if let Some(stale) = self.arena.get_mut(handle).detach_storage() {
            self.data.detach(stale);
        }
    }

    /// Record validation against the type's layout: handler checks plus the
    /// registry's fixed-slot minimum (the record must be long enough to
    /// hold every fixed reference slot the type declares).
    fn validate_record(&self, type_slot: u32, record: &EntityRecord<'_>) -> Result<()> {
        let entry = self.types.entry(type_slot);
        entry.handler.validate_entity(record.length(), record.object_id())?;
        ensure!(
            record.length() >= MIN_ENTITY_LENGTH + entry.simple_reference_count * 8,
            "record length {} of type {} cannot hold {} fixed reference slots",
            record.length(),
            entry.type_id,
            entry.simple_reference_count
        );
        Ok(())
    }

    /// Registers one validated store record: updates an existing entity or
    /// creates a new one, then installs the new position and payload.
    pub fn put_entity(&mut self, record: &EntityRecord<'_>, position: StoragePosition) -> Result<u32> {
        let object_id = record.object_id();

        let handle = match self.get_entry(object_id) {
            Some(handle) => {
                let type_slot = self.arena.get(handle).type_slot();
                let existing = self.types.entry(type_slot).type_id;
                ensure!(
                    existing == record.type_id(),
                    "object id {} already assigned to an entity of type {}, re-store claims type {}",
                    object_id,
                    existing,
                    record.type_id()
                );
                self.validate_record(type_slot, record)?;
                self.update_put_entity(handle);
                handle
            }
            None => {
                let type_slot = self.get_or_insert_type(record.type_id())?;
                self.validate_record(type_slot, record)?;
                self.create_entity(object_id, type_slot)?
            }
        };

        let now = now_millis();
        let entity = self.arena.get_mut(handle);
        entity.set_length(record.length());
        entity.set_storage(position);
        self.used_cache_size += entity.put_cache(record.payload().into(), now);
        Ok(handle)
    }

    /// Registers every record of a freshly written store chunk. The chunk
    /// sits at `base_offset` in file `file_id`; record positions follow
    /// from their offsets inside the chunk.
    pub fn apply_store_chunk(&mut self, chunk: &[u8], file_id: u32, base_offset: u64) -> Result<usize> {
        self.monitor.signal_pending_store_update(self.channel_index);
        let result = self.apply_chunk_records(chunk, file_id, base_offset);
        self.monitor.clear_pending_store_update(self.channel_index);
        result
    }

    fn apply_chunk_records(&mut self, chunk: &[u8], file_id: u32, base_offset: u64) -> Result<usize> {
        let mut count = 0;
        for item in ChunkRecords::new(chunk) {
            let (offset, record) = item?;
            let position = StoragePosition::new(file_id, base_offset + offset as u64);
            self.put_entity(&record, position)?;
            count += 1;
        }
        trace!(
            channel = self.channel_index,
            records = count,
            "store chunk applied"
        );
        Ok(count)
    }

    /// Removes an entity in five strictly ordered steps so no other path
    /// can observe it in one structure but not another.
    fn delete_entity(&mut self, handle: u32, type_slot: u32, previous_in_type: u32) {
        // 1.) unregister from the hash table: unfindable by future requests
        self.unregister_entity(handle);

        // 2.) detach from the backing file; the physical remains are
        //     unreachable, even after a restart
        if let Some(stale) = self.arena.get_mut(handle).detach_storage() {
            self.data.detach(stale);
        }

        // 3.) remove from the type registry: gone from iteration, count and
        //     export logic
        self.types
            .remove_entity(type_slot, handle, previous_in_type, &mut self.arena);

        // 4.) unload cached data and settle the cache accounting
        self.ensure_no_cached_data(handle);

        // 5.) tombstone the record and recycle the slot
        if let Some((_, cursor_handle)) = self.live_cursor {
            if cursor_handle == handle {
                self.live_cursor = None;
            }
        }
        self.arena.get_mut(handle).set_deleted();
        self.arena.release(handle);
    }

    fn ensure_no_cached_data(&mut self, handle: u32) {
        let freed = self.arena.get_mut(handle).clear_cache();
        self.used_cache_size -= freed;
    }

    /// The glue between store traffic and GC correctness, run on every
    /// create and update: entities with references are grayed and enqueued
    /// so their references get (re)visited; entities without references
    /// are vacuously fully marked.
    fn ensure_gray(&mut self, handle: u32) {
        let entity = self.arena.get_mut(handle);
        if entity.has_references() {
            // gray even if a sweep is already pending: the sweep rescues
            // any non-white entity, and the enqueued oid guarantees the
            // references are processed in the following mark phase
            entity.mark_gray();
            let object_id = entity.object_id();
            // always via the monitor, never directly into the queue, to
            // keep the central pending count consistent
            self.monitor.enqueue(object_id);
        } else {
            entity.mark_black();
        }
    }

    // ------------------------------------------------------------------
    // garbage collection
    // ------------------------------------------------------------------

    fn advance_marking(&mut self, processed: usize) {
        // buffered discoveries must be globally visible before the pending
        // count drops, or completion detection fires early
        self.marker.try_flush();
        self.monitor.advance_marking(self.channel_index, processed);
    }

    /// Incremental mark step. Returns `Ok(true)` when the queue ran dry and
    /// `Ok(false)` when the time budget ran out first. Always processes at
    /// least one oid to avoid starvation under a too-small budget.
    pub fn incremental_mark(&mut self, deadline: Instant) -> Result<bool> {
        let eval_time = now_millis();

        // amount of oids in the current batch and index of the next one
        let mut amount = 0usize;
        let mut index = 0usize;

        loop {
            if index >= amount {
                self.advance_marking(index);
                index = 0;
                let monitor = Arc::clone(&self.monitor);
                amount = monitor.queue(self.channel_index).fill(&mut self.mark_buffer);
                if amount == 0 {
                    // ran out of work before time; local discoveries were
                    // flushed above, so the monitor can re-check exhaustion
                    self.monitor.check_mark_completion();
                    return Ok(true);
                }
            }

            let object_id = self.mark_buffer[index];
            index += 1;

            match self.get_entry(object_id) {
                None => {
                    // an oid with no entry is expected for genuinely
                    // deleted entities still referenced by stale data
                    self.zombies.handle_zombie_oid(object_id);
                }
                Some(handle) => {
                    // a redundantly enqueued black entity is skipped;
                    // white-but-enqueued is legal right after a sweep and
                    // gets scanned like gray
                    if !self.arena.get(handle).is_black() {
                        if self.arena.get(handle).has_references() {
                            self.mark_references(handle, eval_time)?;
                        }
                        self.arena.get_mut(handle).mark_black();
                        self.monitor.stats().record_marked(1);
                    }
                }
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        // account for the processed prefix; the rest of the batch stays
        // queued (fill only reads) and the next slice picks it up
        if index > 0 {
            self.advance_marking(index);
        }
        Ok(false)
    }

    /// Feeds the entity's reference oids to the marker, loading the payload
    /// from the data store if it is not resident.
    fn mark_references(&mut self, handle: u32, eval_time: u64) -> Result<()> {
        let type_slot = self.arena.get(handle).type_slot();
        let handler = self.types.handler(type_slot);

        let required_loading = !self.arena.get(handle).is_live();
        if required_loading {
            let entity = self.arena.get(handle);
            let position = entity.storage().ok_or_else(|| {
                eyre::eyre!(
                    "entity {} has neither cached payload nor storage position",
                    entity.object_id()
                )
            })?;
            let length = entity.length();
            let payload = self.data.load(position, length)?;
            self.used_cache_size += self.arena.get_mut(handle).put_cache(payload, eval_time);
        }

        {
            let arena = &self.arena;
            let marker = &mut self.marker;
            let entity = arena.get(handle);
            let payload = entity.payload().ok_or_else(|| {
                eyre::eyre!("entity {} lost its payload during marking", entity.object_id())
            })?;
            handler.iterate_references(payload, &mut |oid| marker.accept_oid(oid))?;
        }

        if required_loading {
            // marking had to load; re-apply the eviction policy so the GC
            // itself cannot blow the cache budget
            self.check_for_cache_clear(handle, eval_time);
        }
        Ok(())
    }

    fn check_for_cache_clear(&mut self, handle: u32, eval_time: u64) {
        let clear = {
            let entity = self.arena.get(handle);
            self.evaluator
                .clear_entity_cache(self.used_cache_size, eval_time, entity)
        };
        if clear {
            self.ensure_no_cached_data(handle);
        } else {
            // payload stays resident; record the use
            self.arena.get_mut(handle).touch(eval_time);
        }
    }

    /// Grays and enqueues every root-type entity once per mark round, so a
    /// fresh mark phase always has the graph roots as its starting set.
    fn seed_roots_for_round(&mut self) {
        let round = self.monitor.mark_round();
        if self.seeded_round == Some(round) {
            return;
        }
        self.seeded_round = Some(round);

        let mut handle = self.types.entry(self.root_type_slot).head;
        let mut seeded = 0;
        while handle != NIL {
            let next = self.arena.get(handle).type_next;
            self.ensure_gray(handle);
            seeded += 1;
            handle = next;
        }
        if seeded > 0 {
            trace!(channel = self.channel_index, round, seeded, "root entities seeded");
        }
        // reported after the enqueues so the pending count rises first
        self.monitor.report_roots_seeded(self.channel_index);
    }

    /// Sweep pass over every type list. Must only run when the monitor has
    /// scheduled a sweep for this channel; `complete_sweep` asserts that.
    fn sweep(&mut self) {
        self.last_sweep_start = now_millis();
        let mut rescued = 0u64;
        let mut collected = 0u64;

        for type_slot in self.types.slots() {
            let mut previous = NIL;
            let mut handle = self.types.entry(type_slot).head;
            while handle != NIL {
                let entity = self.arena.get(handle);
                let next = entity.type_next;
                if entity.is_marked() {
                    // rescued; white is the starting color of the next cycle
                    self.arena.get_mut(handle).mark_white();
                    rescued += 1;
                    previous = handle;
                } else {
                    // never marked this cycle, so collect it
                    self.delete_entity(handle, type_slot, previous);
                    collected += 1;
                }
                handle = next;
            }
        }

        self.sweep_generation += 1;
        self.last_sweep_end = now_millis();
        self.live_cursor = None;

        // the cleanup cursor must re-check all files against the new state
        self.data.reset_cleanup_cursor();

        let root_candidate = self.query_root_object_id();
        self.monitor.stats().record_sweep(rescued, collected);
        debug!(
            channel = self.channel_index,
            generation = self.sweep_generation,
            rescued,
            collected,
            cache_size = self.used_cache_size,
            "sweep complete"
        );
        self.monitor.complete_sweep(self.channel_index, root_candidate);
    }

    fn query_root_object_id(&mut self) -> u64 {
        let Self {
            types,
            arena,
            root_selector,
            root_type_slot,
            ..
        } = self;
        root_selector.reset();
        types.iterate_entities(*root_type_slot, arena, |_, entity| {
            root_selector.accept(entity.object_id());
        });
        root_selector.yield_root()
    }

    fn check_for_gc_completion(&mut self) -> bool {
        if self.monitor.is_complete() {
            // minimize hash table memory while the storage may go idle
            self.check_oid_hash_table_consolidation();
            return true;
        }
        false
    }

    /// One incremental GC slice: sweep if one is due, otherwise mark until
    /// work or time runs out. `Ok(true)` means out of local work.
    pub fn incremental_garbage_collection(&mut self, deadline: Instant) -> Result<bool> {
        if self.check_for_gc_completion() {
            return Ok(true);
        }

        if self.monitor.needs_sweep(self.channel_index) {
            self.sweep();

            // re-check, otherwise this channel could restart marking
            // beyond a completed collection
            if self.check_for_gc_completion() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
        }

        self.seed_roots_for_round();
        self.incremental_mark(deadline)
    }

    /// Outer GC driver: performs incremental work and, when genuinely out
    /// of local work while the global cycle is still open, blocks on the
    /// mark queue with a bounded wait, re-checking completion and the time
    /// budget on every wakeup. Returns whether the full cycle completed
    /// within the budget.
    pub fn issued_garbage_collection(&mut self, time_budget: Duration) -> Result<bool> {
        let deadline = Instant::now() + time_budget;

        while Instant::now() < deadline {
            if !self.incremental_garbage_collection(deadline)? {
                // time ran out mid-work
                return Ok(false);
            }

            // out of local work; wait for other channels to produce more,
            // re-checking on every wakeup (covers spurious wakeups)
            'wait_for_work: while Instant::now() < deadline {
                if self.monitor.is_complete() {
                    return Ok(true);
                }
                if self.monitor.is_marking_complete() {
                    if self.monitor.needs_sweep(self.channel_index) {
                        // a sweep became due while waiting
                        break 'wait_for_work;
                    }
                    // this channel already swept; stay parked until the
                    // remaining channels finish theirs (the monitor wakes
                    // all channels on every phase transition)
                } else {
                    if self.seeded_round != Some(self.monitor.mark_round()) {
                        // a new marking round opened while waiting; the
                        // roots must be re-seeded before it can close
                        break 'wait_for_work;
                    }

                    self.marker.try_flush();

                    if self.monitor.queue(self.channel_index).has_elements() {
                        break 'wait_for_work;
                    }
                }

                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break 'wait_for_work;
                }
                self.monitor
                    .wait_for_work(self.channel_index, self.mark_wait.min(remaining));
            }
        }

        Ok(self.monitor.is_complete())
    }

    // ------------------------------------------------------------------
    // live-cache check
    // ------------------------------------------------------------------

    /// Budgeted eviction pass over cached entities with an optional
    /// one-off evaluator. Returns whether a full pass completed (or the
    /// cache drained) within the budget.
    pub fn issued_cache_check(
        &mut self,
        time_budget: Duration,
        evaluator: Option<&dyn CacheEvaluator>,
    ) -> bool {
        let deadline = Instant::now() + time_budget;
        match evaluator {
            Some(evaluator) => self.internal_live_check(deadline, evaluator),
            None => {
                let evaluator = Arc::clone(&self.evaluator);
                self.internal_live_check(deadline, evaluator.as_ref())
            }
        }
    }

    fn first_live_position(&self) -> Option<(u32, u32)> {
        for type_slot in self.types.slots() {
            let head = self.types.entry(type_slot).head;
            if head != NIL {
                return Some((type_slot, head));
            }
        }
        None
    }

    fn advance_live_position(&self, mut type_slot: u32, handle: u32) -> (u32, u32) {
        let mut next = self.arena.get(handle).type_next;
        while next == NIL {
            type_slot = (type_slot + 1) % self.types.len() as u32;
            next = self.types.entry(type_slot).head;
        }
        (type_slot, next)
    }

    fn internal_live_check(&mut self, deadline: Instant, evaluator: &dyn CacheEvaluator) -> bool {
        // quick check before setting up cursors
        if self.used_cache_size == 0 {
            return true;
        }

        let eval_time = now_millis();
        let start = match self.live_cursor.or_else(|| self.first_live_position()) {
            Some(position) => position,
            None => return true,
        };
        let (mut type_slot, mut handle) = start;

        // three aborting conditions: full circle, cache drained, time up.
        // at least one entity is checked even without budget (starvation
        // guard).
        loop {
            {
                let entity = self.arena.get(handle);
                if entity.is_live()
                    && evaluator.clear_entity_cache(self.used_cache_size, eval_time, entity)
                {
                    self.ensure_no_cached_data(handle);
                }
            }

            let next = self.advance_live_position(type_slot, handle);
            type_slot = next.0;
            handle = next.1;

            if (type_slot, handle) == start {
                // full circle within one call; the next call starts over
                self.live_cursor = None;
                return true;
            }
            if self.used_cache_size == 0 {
                self.live_cursor = None;
                return true;
            }
            if Instant::now() >= deadline {
                self.live_cursor = Some((type_slot, handle));
                return false;
            }
        }
    }

    // ------------------------------------------------------------------
    // validation / reset
    // ------------------------------------------------------------------

    /// Validates every entity against its type handler and reports the
    /// highest observed ids, for crash-recovery id-range restoration.
    pub fn validate_entities(&self) -> Result<IdRangeAnalysis> {
        let mut analysis = IdRangeAnalysis::default();

        for type_slot in self.types.slots() {
            let entry = self.types.entry(type_slot);
            analysis.max_type_id = analysis.max_type_id.max(entry.type_id);

            let mut handle = entry.head;
            while handle != NIL {
                let entity = self.arena.get(handle);
                entry.handler.validate_entity(entity.length(), entity.object_id())?;
                analysis.max_object_id = analysis.max_object_id.max(entity.object_id());
                handle = entity.type_next;
            }
        }
        Ok(analysis)
    }

    /// Drops all channel state and re-registers the root type.
    pub fn reset(&mut self) -> Result<()> {
        self.arena.clear();
        self.buckets = vec![NIL; 1].into_boxed_slice();
        self.oid_mask = 0;
        self.oid_size = 0;
        self.types.reset();
        self.live_cursor = None;
        self.used_cache_size = 0;
        self.root_type_slot = self.get_or_insert_type(self.root_type_id)?;
        Ok(())
    }

    #[cfg(test)]
    fn check_bidirectional_membership(&self) {
        use hashbrown::HashSet;

        // every hash table entity appears in exactly its type's list
        let mut hashed = HashSet::new();
        for &head in self.buckets.iter() {
            let mut handle = head;
            while handle != NIL {
                assert!(hashed.insert(handle), "entity in two hash chains");
                handle = self.arena.get(handle).hash_next;
            }
        }

        let mut listed = HashSet::new();
        for type_slot in self.types.slots() {
            let mut count = 0;
            let mut handle = self.types.entry(type_slot).head;
            while handle != NIL {
                assert!(listed.insert(handle), "entity in two type lists");
                assert_eq!(self.arena.get(handle).type_slot(), type_slot);
                count += 1;
                handle = self.arena.get(handle).type_next;
            }
            assert_eq!(count, self.types.entry(type_slot).entity_count);
        }

        assert_eq!(hashed, listed, "hash table and type lists disagree");
        assert_eq!(hashed.len() as u64, self.oid_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::ChunkBuilder;
    use crate::entity::GcColor;
    use crate::handler::{
        BlobHandler, LoggingZombieHandler, MemoryDataStore, SlotsHandler, ThresholdEvaluator,
    };
    use proptest::prelude::*;

    const ROOT_TYPE: u64 = 1;
    const NODE_TYPE: u64 = 2;
    const LEAF_TYPE: u64 = 3;

    fn dictionary() -> Arc<TypeDictionary> {
        let dictionary = TypeDictionary::new();
        dictionary.register(Arc::new(SlotsHandler::new(ROOT_TYPE)));
        dictionary.register(Arc::new(SlotsHandler::new(NODE_TYPE)));
        dictionary.register(Arc::new(BlobHandler::new(LEAF_TYPE)));
        Arc::new(dictionary)
    }

    struct Fixture {
        cache: EntityCache,
        monitor: Arc<MarkMonitor>,
        data: Arc<MemoryDataStore>,
        zombies: Arc<LoggingZombieHandler>,
        next_offset: u64,
    }

    fn fixture() -> Fixture {
        fixture_with_evaluator(ThresholdEvaluator::keep_all())
    }

    fn fixture_with_evaluator(evaluator: ThresholdEvaluator) -> Fixture {
        let config = GcConfig {
            channel_count: 1,
            root_type_id: ROOT_TYPE,
            ..GcConfig::default()
        };
        let monitor = Arc::new(MarkMonitor::new(1));
        let data = Arc::new(MemoryDataStore::new());
        let zombies = Arc::new(LoggingZombieHandler::new());
        let cache = EntityCache::new(
            0,
            &config,
            Arc::clone(&monitor),
            dictionary(),
            Arc::clone(&data) as Arc<dyn DataStore>,
            Arc::clone(&zombies) as Arc<dyn ZombieOidHandler>,
            Arc::new(evaluator),
        )
        .unwrap();
        Fixture {
            cache,
            monitor,
            data,
            zombies,
            next_offset: 0,
        }
    }

    fn refs_payload(refs: &[u64]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(refs.len() * 8);
        for oid in refs {
            payload.extend_from_slice(&oid.to_le_bytes());
        }
        payload
    }

    impl Fixture {
        fn store(&mut self, entities: &[(u64, u64, Vec<u8>)]) {
            let mut builder = ChunkBuilder::new();
            let base = self.next_offset;
            for (oid, tid, payload) in entities {
                let offset = builder.push(*oid, *tid, payload);
                self.data
                    .insert(StoragePosition::new(0, base + offset as u64), payload);
            }
            let chunk = builder.finish();
            self.next_offset += chunk.len() as u64;
            self.cache.apply_store_chunk(&chunk, 0, base).unwrap();
        }

        fn far_deadline() -> Instant {
            Instant::now() + Duration::from_secs(60)
        }

        fn mark_all(&mut self) {
            assert!(self.cache.incremental_mark(Self::far_deadline()).unwrap());
        }

        /// Drives one complete mark+sweep cycle on the single channel.
        fn run_full_cycle(&mut self) {
            assert!(self
                .cache
                .issued_garbage_collection(Duration::from_secs(60))
                .unwrap());
        }
    }

    #[test]
    fn test_entity_without_references_is_black_immediately() {
        let mut f = fixture();
        f.store(&[(11, LEAF_TYPE, vec![1, 2, 3])]);
        assert_eq!(f.cache.get(11).unwrap().color(), GcColor::Black);
        // nothing was enqueued for a reference-free entity
        assert!(f.monitor.queue(0).is_empty());
    }

    #[test]
    fn test_entity_with_references_stays_gray_until_marked() {
        let mut f = fixture();
        f.store(&[(21, LEAF_TYPE, vec![]), (31, NODE_TYPE, refs_payload(&[21]))]);
        assert_eq!(f.cache.get(31).unwrap().color(), GcColor::Gray);

        f.mark_all();
        assert_eq!(f.cache.get(31).unwrap().color(), GcColor::Black);
    }

    #[test]
    fn test_wrong_channel_oid_is_fatal() {
        let config = GcConfig {
            channel_count: 2,
            root_type_id: ROOT_TYPE,
            ..GcConfig::default()
        };
        let monitor = Arc::new(MarkMonitor::new(2));
        let mut cache = EntityCache::new(
            0,
            &config,
            monitor,
            dictionary(),
            Arc::new(MemoryDataStore::new()) as Arc<dyn DataStore>,
            Arc::new(LoggingZombieHandler::new()) as Arc<dyn ZombieOidHandler>,
            Arc::new(ThresholdEvaluator::keep_all()),
        )
        .unwrap();

        // oid 3 routes to channel 1, not channel 0
        let mut builder = ChunkBuilder::new();
        builder.push(3, LEAF_TYPE, &[]);
        let chunk = builder.finish();
        assert!(cache.apply_store_chunk(&chunk, 0, 0).is_err());
    }

    #[test]
    fn test_type_mismatch_on_restore_is_fatal() {
        let mut f = fixture();
        f.store(&[(41, LEAF_TYPE, vec![9])]);

        let mut builder = ChunkBuilder::new();
        builder.push(41, NODE_TYPE, &refs_payload(&[]));
        let chunk = builder.finish();
        assert!(f.cache.apply_store_chunk(&chunk, 0, 1024).is_err());
    }

    #[test]
    fn test_hash_resize_keeps_every_entity_reachable() {
        for n in [0u64, 1, 2, 100, 100_000] {
            let mut f = fixture();
            let entities: Vec<_> = (0..n).map(|i| (i * 2 + 1, LEAF_TYPE, Vec::new())).collect();
            if !entities.is_empty() {
                f.store(&entities);
            }
            assert_eq!(f.cache.entity_count(), n);
            for i in 0..n {
                assert!(f.cache.contains(i * 2 + 1), "oid {} lost at n={}", i * 2 + 1, n);
            }
            f.cache.check_bidirectional_membership();
        }
    }

    #[test]
    fn test_fixed_slot_type_rejects_short_record() {
        const PAIR_TYPE: u64 = 4;
        let dictionary = TypeDictionary::new();
        dictionary.register(Arc::new(SlotsHandler::with_fixed_slots(PAIR_TYPE, 2)));
        let config = GcConfig {
            channel_count: 1,
            root_type_id: PAIR_TYPE,
            ..GcConfig::default()
        };
        let mut cache = EntityCache::new(
            0,
            &config,
            Arc::new(MarkMonitor::new(1)),
            Arc::new(dictionary),
            Arc::new(MemoryDataStore::new()) as Arc<dyn DataStore>,
            Arc::new(LoggingZombieHandler::new()) as Arc<dyn ZombieOidHandler>,
            Arc::new(ThresholdEvaluator::keep_all()),
        )
        .unwrap();

        // one slot cannot hold the type's two fixed reference slots
        let mut builder = ChunkBuilder::new();
        builder.push(11, PAIR_TYPE, &refs_payload(&[21]));
        assert!(cache.apply_store_chunk(&builder.finish(), 0, 0).is_err());
        assert!(!cache.contains(11));

        let mut builder = ChunkBuilder::new();
        builder.push(11, PAIR_TYPE, &refs_payload(&[21, 31]));
        cache.apply_store_chunk(&builder.finish(), 0, 0).unwrap();
        assert!(cache.contains(11));
    }

    #[test]
    fn test_restore_of_black_entity_forces_gray() {
        let mut f = fixture();
        f.store(&[(51, NODE_TYPE, refs_payload(&[]))]);
        f.mark_all();
        assert_eq!(f.cache.get(51).unwrap().color(), GcColor::Black);

        // re-store the same oid: must drop back to gray, never stay black
        f.store(&[(51, NODE_TYPE, refs_payload(&[]))]);
        assert_eq!(f.cache.get(51).unwrap().color(), GcColor::Gray);
    }

    #[test]
    fn test_restore_detaches_stale_file_position() {
        let mut f = fixture();
        f.store(&[(61, LEAF_TYPE, vec![7; 16])]);
        let stale = f.cache.get(61).unwrap().storage().unwrap();

        f.store(&[(61, LEAF_TYPE, vec![8; 16])]);
        let fresh = f.cache.get(61).unwrap().storage().unwrap();
        assert_ne!(stale, fresh);
        // the stale record was released from the data store
        assert!(f.data.load(stale, 40).is_err());
        assert!(f.data.load(fresh, 40).is_ok());
    }

    #[test]
    fn test_marking_already_black_entity_is_noop() {
        let mut f = fixture();
        f.store(&[(71, NODE_TYPE, refs_payload(&[]))]);
        f.mark_all();
        let marked_before = f.monitor.stats().marked();

        // redundant enqueue of a black entity
        f.monitor.enqueue(71);
        f.mark_all();
        assert_eq!(f.monitor.stats().marked(), marked_before);
        assert_eq!(f.cache.get(71).unwrap().color(), GcColor::Black);
    }

    #[test]
    fn test_expired_deadline_keeps_unprocessed_oids_queued() {
        let mut f = fixture();
        // 20 nodes with one null slot each: grayed and enqueued on store,
        // but contributing no further reference work
        let entities: Vec<_> = (0..20u64)
            .map(|i| (i * 2 + 1, NODE_TYPE, refs_payload(&[0])))
            .collect();
        f.store(&entities);
        assert_eq!(f.monitor.queue(0).len(), 20);

        // an already-expired deadline: the starvation guard processes
        // exactly one oid and the slice ends mid-batch
        assert!(!f.cache.incremental_mark(Instant::now()).unwrap());
        assert_eq!(f.monitor.queue(0).len(), 19);

        // the cycle must still close on the leftover oids
        f.run_full_cycle();
        assert!(f.monitor.is_complete());
        assert_eq!(f.cache.entity_count(), 20);
        for (oid, _, _) in &entities {
            assert_eq!(f.cache.get(*oid).unwrap().color(), GcColor::White);
        }
    }

    #[test]
    fn test_zombie_oid_is_reported_not_fatal() {
        let mut f = fixture();
        f.monitor.enqueue(91); // no such entity
        f.mark_all();
        assert_eq!(f.zombies.encountered(), 1);
    }

    #[test]
    fn test_sweep_removes_exactly_the_white_entities() {
        let mut f = fixture();
        // three leaf entities of one type; leaves are black after store
        f.store(&[
            (101, LEAF_TYPE, vec![]),
            (111, LEAF_TYPE, vec![]),
            (121, LEAF_TYPE, vec![]),
        ]);
        let slot = f.cache.types.lookup(LEAF_TYPE).unwrap();
        assert_eq!(f.cache.types.entry(slot).entity_count, 3);

        // A black, B gray, C white
        let b = f.cache.get_entry(111).unwrap();
        f.cache.arena.get_mut(b).mark_gray();
        let c = f.cache.get_entry(121).unwrap();
        f.cache.arena.get_mut(c).mark_white();

        f.monitor.report_roots_seeded(0);
        assert!(f.monitor.needs_sweep(0));
        f.cache.sweep();

        assert_eq!(f.cache.types.entry(slot).entity_count, 2);
        assert!(!f.cache.contains(121));
        assert_eq!(f.cache.get(101).unwrap().color(), GcColor::White);
        assert_eq!(f.cache.get(111).unwrap().color(), GcColor::White);
        f.cache.check_bidirectional_membership();
    }

    #[test]
    fn test_full_cycle_collects_unreachable_subgraph() {
        let mut f = fixture();
        // root -> 11 -> 21; 31 -> 41 unreachable from the root
        f.store(&[
            (9, ROOT_TYPE, refs_payload(&[11])),
            (11, NODE_TYPE, refs_payload(&[21])),
            (21, LEAF_TYPE, vec![]),
            (31, NODE_TYPE, refs_payload(&[41])),
            (41, LEAF_TYPE, vec![]),
        ]);

        // first cycle: everything was store-grayed, so everything survives
        f.run_full_cycle();
        assert_eq!(f.cache.entity_count(), 5);
        for oid in [9, 11, 21, 31, 41] {
            assert_eq!(f.cache.get(oid).unwrap().color(), GcColor::White);
        }

        // a leaf re-store reopens the cycle; reachability now decides
        f.store(&[(21, LEAF_TYPE, vec![5])]);
        f.run_full_cycle();

        assert_eq!(f.cache.entity_count(), 3);
        for oid in [9, 11, 21] {
            assert!(f.cache.contains(oid), "reachable oid {oid} was swept");
            assert_eq!(f.cache.get(oid).unwrap().color(), GcColor::White);
        }
        for oid in [31, 41] {
            assert!(!f.cache.contains(oid), "unreachable oid {oid} survived");
        }
        f.cache.check_bidirectional_membership();
        assert_eq!(f.monitor.last_root(), 9);
    }

    #[test]
    fn test_marking_reloads_evicted_payload_on_demand() {
        let mut f = fixture();
        f.store(&[
            (9, ROOT_TYPE, refs_payload(&[11])),
            (11, NODE_TYPE, refs_payload(&[21])),
            (21, LEAF_TYPE, vec![]),
        ]);
        f.run_full_cycle();

        // evict everything, then force a new cycle via a leaf re-store
        let evict_all = ThresholdEvaluator::new(0, 0);
        assert!(f.cache.issued_cache_check(Duration::from_secs(60), Some(&evict_all)));
        assert_eq!(f.cache.cache_size(), 0);

        f.store(&[(21, LEAF_TYPE, vec![])]);
        f.run_full_cycle();

        // marking had to reload 9 and 11 from the data store to walk their
        // references; nothing reachable was lost
        assert_eq!(f.cache.entity_count(), 3);
    }

    #[test]
    fn test_cache_check_clears_and_reports_full_pass() {
        let mut f = fixture();
        f.store(&[
            (11, LEAF_TYPE, vec![0; 100]),
            (21, LEAF_TYPE, vec![0; 100]),
            (31, LEAF_TYPE, vec![0; 100]),
        ]);
        assert_eq!(f.cache.cache_size(), 300);

        // keep-all policy: full pass, nothing cleared
        assert!(f.cache.issued_cache_check(Duration::from_secs(60), None));
        assert_eq!(f.cache.cache_size(), 300);

        let evict_all = ThresholdEvaluator::new(0, 0);
        assert!(f.cache.issued_cache_check(Duration::from_secs(60), Some(&evict_all)));
        assert_eq!(f.cache.cache_size(), 0);
        for oid in [11, 21, 31] {
            assert!(!f.cache.get(oid).unwrap().is_live());
        }
    }

    #[test]
    fn test_hash_table_shrinks_after_collection() {
        let mut f = fixture();
        let entities: Vec<_> = (0..1000u64).map(|i| (i * 2 + 1, LEAF_TYPE, Vec::new())).collect();
        f.store(&entities);
        let grown = f.cache.buckets.len();
        assert!(grown >= 1000);

        // nothing re-stored and no roots: second cycle collects everything
        f.run_full_cycle();
        f.store(&[(2001, LEAF_TYPE, vec![])]);
        f.run_full_cycle();

        assert_eq!(f.cache.entity_count(), 1);
        assert!(
            f.cache.buckets.len() < grown,
            "table did not shrink: {} -> {}",
            grown,
            f.cache.buckets.len()
        );
        assert!(f.cache.contains(2001));
    }

    #[test]
    fn test_validate_entities_reports_id_ranges() {
        let mut f = fixture();
        f.store(&[
            (9, ROOT_TYPE, refs_payload(&[11])),
            (11, NODE_TYPE, refs_payload(&[])),
            (4001, LEAF_TYPE, vec![]),
        ]);
        let analysis = f.cache.validate_entities().unwrap();
        assert_eq!(analysis.max_object_id, 4001);
        assert_eq!(analysis.max_type_id, LEAF_TYPE);
    }

    #[test]
    fn test_reset_clears_all_state() {
        let mut f = fixture();
        f.store(&[(11, LEAF_TYPE, vec![1; 64]), (9, ROOT_TYPE, refs_payload(&[11]))]);
        f.cache.reset().unwrap();

        assert_eq!(f.cache.entity_count(), 0);
        assert_eq!(f.cache.cache_size(), 0);
        assert!(!f.cache.contains(11));
        // root type is re-registered and usable right away
        f.store(&[(19, ROOT_TYPE, refs_payload(&[]))]);
        assert!(f.cache.contains(19));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Inserting any oid set through any interleaving of stores keeps
        /// the hash table and the type lists in exact agreement.
        #[test]
        fn prop_membership_stays_bidirectional(
            oids in proptest::collection::hash_set(1u64..1_000_000, 0..200)
        ) {
            let mut f = fixture();
            let entities: Vec<_> = oids
                .iter()
                .map(|&oid| {
                    let tid = if oid % 3 == 0 { NODE_TYPE } else { LEAF_TYPE };
                    let payload = if tid == NODE_TYPE { refs_payload(&[]) } else { Vec::new() };
                    (oid, tid, payload)
                })
                .collect();
            if !entities.is_empty() {
                f.store(&entities);
            }

            prop_assert_eq!(f.cache.entity_count(), oids.len() as u64);
            for &oid in &oids {
                prop_assert!(f.cache.contains(oid));
            }
            f.cache.check_bidirectional_membership();
        }

        /// A re-store racing the sweep window must never lose the entity:
        /// whatever subset of entities is re-stored between mark exhaustion
        /// and the sweep, every re-stored entity is gray at sweep time and
        /// survives into the next cycle.
        #[test]
        fn prop_restore_during_sweep_pending_never_loses(
            restored in proptest::collection::btree_set(0u64..20, 1..10)
        ) {
            let mut f = fixture();
            let entities: Vec<_> = (0u64..20)
                .map(|i| (i * 2 + 1, NODE_TYPE, refs_payload(&[])))
                .collect();
            f.store(&entities);
            f.mark_all();

            // marking is exhausted; the sweep is now pending
            f.monitor.report_roots_seeded(0);
            prop_assert!(f.monitor.is_marking_complete());

            // the racing store slips in before this channel sweeps
            let restores: Vec<_> = restored
                .iter()
                .map(|&i| (i * 2 + 1, NODE_TYPE, refs_payload(&[])))
                .collect();
            f.store(&restores);
            for &i in &restored {
                prop_assert_eq!(f.cache.get(i * 2 + 1).unwrap().color(), GcColor::Gray);
            }

            prop_assert!(f.monitor.needs_sweep(0));
            f.cache.sweep();

            // gray entities at sweep time always survive
            for &i in &restored {
                let entity = f.cache.get(i * 2 + 1).unwrap();
                prop_assert_eq!(entity.color(), GcColor::White);
            }
            prop_assert_eq!(f.cache.entity_count(), 20);
        }
    }
}
