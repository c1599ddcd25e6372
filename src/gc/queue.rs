//! # Shared Oid Mark Queue
//!
//! One queue per channel, collectively owned by the [`MarkMonitor`]. Other
//! channels deliver cross-channel reference discoveries here; the owning
//! channel drains them batch-wise during incremental marking.
//!
//! All enqueueing goes through the monitor, never directly through a queue:
//! the global pending-mark counter must change atomically with the queue
//! contents or completion detection would race with channels blocked on
//! the queue. Enqueue methods are therefore private to the `gc` module.
//!
//! Blocked channels use a bounded timed wait and re-check completion and
//! their time budget on every wakeup, which also covers spurious wakeups.
//!
//! [`MarkMonitor`]: crate::gc::MarkMonitor

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub struct MarkQueue {
    oids: Mutex<VecDeque<u64>>,
    work_ready: Condvar,
}

impl MarkQueue {
    pub(crate) fn new() -> Self {
        Self {
            oids: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
        }
    }

    pub(in crate::gc) fn enqueue(&self, oid: u64) {
        self.oids.lock().push_back(oid);
        self.work_ready.notify_all();
    }

    pub(in crate::gc) fn enqueue_batch(&self, oids: &[u64]) {
        let mut guard = self.oids.lock();
        guard.extend(oids.iter().copied());
        drop(guard);
        self.work_ready.notify_all();
    }

    /// Wakes blocked channels without adding work, used for phase
    /// transitions (marking complete, cycle complete).
    pub(in crate::gc) fn notify_all(&self) {
        self.work_ready.notify_all();
    }

    /// Copies up to `buf.len()` oids into `buf` without removing them,
    /// returning how many were read. Zero means the queue is currently
    /// empty. Entries stay queued until the owning channel reports them
    /// processed and [`consume`] advances past them, so a mark slice cut
    /// short by its deadline leaves the unprocessed remainder in place.
    ///
    /// [`consume`]: MarkQueue::consume
    pub fn fill(&self, buf: &mut [u64]) -> usize {
        let guard = self.oids.lock();
        let count = guard.len().min(buf.len());
        for (slot, &oid) in buf.iter_mut().zip(guard.iter()) {
            *slot = oid;
        }
        count
    }

    /// Removes the first `count` oids, previously read via [`fill`]. Only
    /// the owning channel consumes its queue, so the front cannot change
    /// between the read and this call.
    ///
    /// [`fill`]: MarkQueue::fill
    pub(in crate::gc) fn consume(&self, count: usize) {
        let mut guard = self.oids.lock();
        debug_assert!(guard.len() >= count, "consuming beyond queue length");
        let count = count.min(guard.len());
        guard.drain(..count);
    }

    pub fn has_elements(&self) -> bool {
        !self.oids.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.oids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.oids.lock().is_empty()
    }

    /// Bounded wait for new work. Returns whether the queue holds elements
    /// afterwards; the caller re-checks completion and its time budget
    /// either way.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        let mut guard = self.oids.lock();
        if !guard.is_empty() {
            return true;
        }
        self.work_ready.wait_for(&mut guard, timeout);
        !guard.is_empty()
    }
}
