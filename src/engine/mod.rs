//! # Storage Engine Facade
//!
//! Wires the per-channel entity caches to the shared mark monitor and
//! drives them as a group: store traffic is routed to the owning channels,
//! garbage collection and cache checks run one worker thread per channel.
//!
//! The engine embeds a [`MemoryDataStore`] as its data-file layer. A real
//! file layer would implement [`DataStore`](crate::handler::DataStore) and
//! take its place; everything above the trait is unchanged.
//!
//! Channel ownership: the engine holds the caches and hands each worker
//! thread exclusive access to exactly one, so the caches' single-threaded
//! confinement holds without any locking.

use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, Result};
use tracing::info;

use crate::cache::{EntityCache, IdRangeAnalysis};
use crate::config::GcConfig;
use crate::entity::{ChunkBuilder, Entity, StoragePosition};
use crate::gc::{GcStats, MarkMonitor};
use crate::handler::{
    CacheEvaluator, DataStore, LoggingZombieHandler, MemoryDataStore, ThresholdEvaluator,
    TypeDictionary, ZombieOidHandler,
};

/// One entity to be stored: header scalars plus the serialized payload.
#[derive(Debug, Clone, Copy)]
pub struct StoreEntity<'a> {
    pub object_id: u64,
    pub type_id: u64,
    pub payload: &'a [u8],
}

pub struct GraphEngine {
    config: GcConfig,
    monitor: Arc<MarkMonitor>,
    data: Arc<MemoryDataStore>,
    channels: Vec<EntityCache>,
    /// Next write offset per channel; each channel appends to its own file.
    next_offsets: Vec<u64>,
}

impl GraphEngine {
    pub fn new(config: GcConfig, dictionary: Arc<TypeDictionary>) -> Result<Self> {
        Self::with_collaborators(
            config,
            dictionary,
            Arc::new(LoggingZombieHandler::new()),
            Arc::new(ThresholdEvaluator::new(
                config.cache_threshold,
                config.cache_max_idle_ms,
            )),
        )
    }

    pub fn with_collaborators(
        config: GcConfig,
        dictionary: Arc<TypeDictionary>,
        zombies: Arc<dyn ZombieOidHandler>,
        evaluator: Arc<dyn CacheEvaluator>,
    ) -> Result<Self> {
        config.validate()?;

        let monitor = Arc::new(MarkMonitor::new(config.channel_count));
        let data = Arc::new(MemoryDataStore::new());
        let mut channels = Vec::with_capacity(config.channel_count as usize);
        for channel_index in 0..config.channel_count {
            channels.push(EntityCache::new(
                channel_index,
                &config,
                Arc::clone(&monitor),
                Arc::clone(&dictionary),
                Arc::clone(&data) as Arc<dyn DataStore>,
                Arc::clone(&zombies),
                Arc::clone(&evaluator),
            )?);
        }
        info!(
            channels = config.channel_count,
            root_type = config.root_type_id,
            "storage engine initialized"
        );

        Ok(Self {
            next_offsets: vec![0; channels.len()],
            config,
            monitor,
            data,
            channels,
        })
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn monitor(&self) -> &MarkMonitor {
        &self.monitor
    }

    pub fn stats(&self) -> &GcStats {
        self.monitor.stats()
    }

    pub fn data(&self) -> &MemoryDataStore {
        &self.data
    }

    pub fn channel(&self, channel_index: u32) -> &EntityCache {
        &self.channels[channel_index as usize]
    }

    pub fn channel_mut(&mut self, channel_index: u32) -> &mut EntityCache {
        &mut self.channels[channel_index as usize]
    }

    pub fn entity_count(&self) -> u64 {
        self.channels.iter().map(EntityCache::entity_count).sum()
    }

    pub fn cache_size(&self) -> u64 {
        self.channels.iter().map(EntityCache::cache_size).sum()
    }

    /// Looks up an entity on its owning channel.
    pub fn get(&self, object_id: u64) -> Option<&Entity> {
        let channel = (object_id & self.config.channel_mask()) as usize;
        self.channels[channel].get(object_id)
    }

    pub fn contains(&self, object_id: u64) -> bool {
        self.get(object_id).is_some()
    }

    /// Stores a batch of entities: routes each to its owning channel,
    /// writes one chunk per channel and registers the records. A record
    /// failing validation is fatal for the whole store.
    pub fn store(&mut self, entities: &[StoreEntity<'_>]) -> Result<()> {
        let mask = self.config.channel_mask();
        let mut builders: Vec<ChunkBuilder> =
            (0..self.channels.len()).map(|_| ChunkBuilder::new()).collect();

        for entity in entities {
            let channel = (entity.object_id & mask) as usize;
            let offset = builders[channel].push(entity.object_id, entity.type_id, entity.payload);
            let position =
                StoragePosition::new(channel as u32, self.next_offsets[channel] + offset as u64);
            self.data.insert(position, entity.payload);
        }

        for (channel, builder) in builders.into_iter().enumerate() {
            if builder.is_empty() {
                continue;
            }
            let base = self.next_offsets[channel];
            let chunk = builder.finish();
            self.next_offsets[channel] += chunk.len() as u64;
            self.channels[channel].apply_store_chunk(&chunk, channel as u32, base)?;
        }
        Ok(())
    }

    /// Runs garbage collection on every channel in parallel, each within
    /// `time_budget`. Returns whether the full cycle completed.
    pub fn run_gc(&mut self, time_budget: Duration) -> Result<bool> {
        let results: Vec<Result<bool>> = std::thread::scope(|scope| {
            let workers: Vec<_> = self
                .channels
                .iter_mut()
                .map(|cache| scope.spawn(move || cache.issued_garbage_collection(time_budget)))
                .collect();
            workers
                .into_iter()
                .map(|worker| match worker.join() {
                    Ok(result) => result,
                    Err(_) => Err(eyre!("gc worker panicked")),
                })
                .collect()
        });

        let mut complete = true;
        for result in results {
            complete &= result?;
        }
        Ok(complete)
    }

    /// Runs a budgeted cache eviction pass on every channel in parallel.
    /// Returns whether every channel completed a full pass.
    pub fn run_cache_check(&mut self, time_budget: Duration) -> bool {
        let results: Vec<bool> = std::thread::scope(|scope| {
            let workers: Vec<_> = self
                .channels
                .iter_mut()
                .map(|cache| scope.spawn(move || cache.issued_cache_check(time_budget, None)))
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join().unwrap_or(false))
                .collect()
        });
        results.into_iter().all(|full_pass| full_pass)
    }

    /// Validates every entity on every channel and merges the per-channel
    /// id ranges into the global maxima.
    pub fn validate(&self) -> Result<IdRangeAnalysis> {
        let mut merged = IdRangeAnalysis::default();
        for channel in &self.channels {
            let analysis = channel.validate_entities()?;
            merged.max_object_id = merged.max_object_id.max(analysis.max_object_id);
            merged.max_type_id = merged.max_type_id.max(analysis.max_type_id);
        }
        Ok(merged)
    }

    /// Resets every channel's entity state. Oids still sitting in mark
    /// queues become zombies in the next cycle, which the zombie handler
    /// absorbs.
    pub fn reset(&mut self) -> Result<()> {
        for channel in &mut self.channels {
            channel.reset()?;
        }
        self.next_offsets.fill(0);
        Ok(())
    }
}
