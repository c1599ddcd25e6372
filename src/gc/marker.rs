//! # Reference Marker
//!
//! Per-channel buffer between reference discovery and the shared mark
//! queues. Discovered oids are collected per target channel and flushed
//! batch-wise through the monitor, so a mark pass over an entity costs one
//! monitor lock per flushed batch instead of one per reference.
//!
//! Flushing happens automatically when a buffer fills, and explicitly
//! before a channel reports mark progress or blocks waiting for work —
//! buffered discoveries must be globally visible before the pending count
//! drops, or completion detection would fire early.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::config::MARK_FLUSH_LENGTH;

use super::monitor::MarkMonitor;

type OidBuffer = SmallVec<[u64; MARK_FLUSH_LENGTH]>;

pub struct ReferenceMarker {
    monitor: Arc<MarkMonitor>,
    buffers: Box<[OidBuffer]>,
    channel_mask: u64,
}

impl ReferenceMarker {
    pub fn new(monitor: Arc<MarkMonitor>) -> Self {
        let channel_count = monitor.channel_count();
        Self {
            buffers: (0..channel_count).map(|_| OidBuffer::new()).collect(),
            channel_mask: (channel_count - 1) as u64,
            monitor,
        }
    }

    /// Accepts one discovered reference oid. Null references (oid 0) are
    /// ignored; full target buffers are flushed inline.
    pub fn accept_oid(&mut self, oid: u64) {
        if oid == 0 {
            return;
        }
        let channel = (oid & self.channel_mask) as usize;
        let buffer = &mut self.buffers[channel];
        buffer.push(oid);
        if buffer.len() >= MARK_FLUSH_LENGTH {
            self.monitor.enqueue_batch(channel as u32, buffer);
            buffer.clear();
        }
    }

    /// Flushes every non-empty buffer through the monitor.
    pub fn try_flush(&mut self) {
        for (channel, buffer) in self.buffers.iter_mut().enumerate() {
            if !buffer.is_empty() {
                self.monitor.enqueue_batch(channel as u32, buffer);
                buffer.clear();
            }
        }
    }
}
