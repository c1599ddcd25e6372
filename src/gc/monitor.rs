//! # Mark Monitor
//!
//! Cross-channel coordinator that serializes per-channel mark/sweep progress
//! into one global state machine:
//!
//! ```text
//! Marking ──(all pending counts zero, no store updates)──> SweepPending
//!    ▲                                                          │
//!    │                                              first channel starts
//!    │                                                          ▼
//!    ├──(pending work or store arrived during sweeps)──── Sweeping
//!    │                                                          │
//!    └──(new store signaled)── Complete ◄──(all channels swept)─┘
//! ```
//!
//! The monitor owns all channel mark queues and the per-channel pending
//! counters. Every counter mutation happens under the monitor's single
//! lock; channels never lock each other. Enqueueing through the monitor is
//! the only sanctioned way to add mark work — the pending counter and the
//! queue contents must change together, otherwise a channel blocked on its
//! queue could miss the wakeup that completion depends on.
//!
//! Mark/sweep statistics are explicit monitor fields ([`GcStats`], plain
//! atomics), queryable by embedders; there is no hidden global state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::queue::MarkQueue;

/// Global garbage collection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// Channels are draining mark queues; pending work may exist.
    Marking,
    /// All marking exhausted; every channel owes one sweep.
    SweepPending,
    /// At least one channel is sweeping.
    Sweeping,
    /// All channels swept and no work arrived meanwhile. Carries the
    /// selected root oid (query via [`MarkMonitor::last_root`]).
    Complete,
}

/// Aggregate mark/sweep counters, cumulative over the monitor's lifetime.
#[derive(Debug, Default)]
pub struct GcStats {
    enqueued: AtomicU64,
    marked: AtomicU64,
    rescued: AtomicU64,
    collected: AtomicU64,
    sweeps_completed: AtomicU64,
}

impl GcStats {
    pub(crate) fn record_enqueued(&self, count: u64) {
        self.enqueued.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_marked(&self, count: u64) {
        self.marked.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_sweep(&self, rescued: u64, collected: u64) {
        self.rescued.fetch_add(rescued, Ordering::Relaxed);
        self.collected.fetch_add(collected, Ordering::Relaxed);
        self.sweeps_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn marked(&self) -> u64 {
        self.marked.load(Ordering::Relaxed)
    }

    pub fn rescued(&self) -> u64 {
        self.rescued.load(Ordering::Relaxed)
    }

    pub fn collected(&self) -> u64 {
        self.collected.load(Ordering::Relaxed)
    }

    pub fn sweeps_completed(&self) -> u64 {
        self.sweeps_completed.load(Ordering::Relaxed)
    }
}

struct MonitorState {
    phase: GcPhase,
    /// Oids enqueued for each channel but not yet reported processed.
    pending: Box<[u64]>,
    total_pending: u64,
    needs_sweep: Box<[bool]>,
    swept: Box<[bool]>,
    store_update: Box<[bool]>,
    store_update_count: u32,
    /// Channels that re-enqueued their root entities for the current mark
    /// round. Sweeping must not begin before every channel has: a marking
    /// phase whose initial stores carry no references would otherwise go
    /// straight to the sweep and collect the whole reachable graph.
    seeded: Box<[bool]>,
    /// Marking phases begun, including reopened and rolled-over ones.
    mark_round: u64,
    root_candidates: Box<[u64]>,
    selected_root: u64,
    /// Completed gc cycles (each cycle = one full mark + sweep round).
    cycle: u64,
}

impl MonitorState {
    fn begin_mark_round(&mut self) {
        self.phase = GcPhase::Marking;
        self.mark_round += 1;
        self.seeded.fill(false);
    }
}

pub struct MarkMonitor {
    queues: Box<[MarkQueue]>,
    state: Mutex<MonitorState>,
    stats: GcStats,
    channel_mask: u64,
}

impl MarkMonitor {
    pub fn new(channel_count: u32) -> Self {
        assert!(
            channel_count >= 1 && channel_count.is_power_of_two(),
            "channel count must be a power of two"
        );
        let n = channel_count as usize;
        Self {
            queues: (0..n).map(|_| MarkQueue::new()).collect(),
            state: Mutex::new(MonitorState {
                phase: GcPhase::Marking,
                pending: vec![0; n].into_boxed_slice(),
                total_pending: 0,
                needs_sweep: vec![false; n].into_boxed_slice(),
                swept: vec![false; n].into_boxed_slice(),
                store_update: vec![false; n].into_boxed_slice(),
                store_update_count: 0,
                seeded: vec![false; n].into_boxed_slice(),
                mark_round: 0,
                root_candidates: vec![0; n].into_boxed_slice(),
                selected_root: 0,
                cycle: 0,
            }),
            stats: GcStats::default(),
            channel_mask: (channel_count - 1) as u64,
        }
    }

    pub fn channel_count(&self) -> u32 {
        self.queues.len() as u32
    }

    /// The queue a channel drains during marking.
    pub fn queue(&self, channel: u32) -> &MarkQueue {
        &self.queues[channel as usize]
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn phase(&self) -> GcPhase {
        self.state.lock().phase
    }

    pub fn cycle(&self) -> u64 {
        self.state.lock().cycle
    }

    /// Root oid selected at the end of the last completed cycle.
    pub fn last_root(&self) -> u64 {
        self.state.lock().selected_root
    }

    /// Current mark round. Channels seed their root entities once per
    /// round; a new round begins whenever a marking phase (re)opens.
    pub fn mark_round(&self) -> u64 {
        self.state.lock().mark_round
    }

    /// A channel reports that its root entities are enqueued for the
    /// current mark round. The last report may unblock the sweep
    /// transition, so the exhaustion check runs here too.
    pub fn report_roots_seeded(&self, channel: u32) {
        let mut state = self.state.lock();
        state.seeded[channel as usize] = true;
        self.try_enter_sweep_pending(&mut state);
    }

    /// Enqueues one oid for marking, routed to its owning channel. The
    /// pending counter and the queue change under one lock acquisition.
    pub fn enqueue(&self, oid: u64) {
        let channel = (oid & self.channel_mask) as usize;
        {
            let mut state = self.state.lock();
            state.pending[channel] += 1;
            state.total_pending += 1;
        }
        self.stats.record_enqueued(1);
        self.queues[channel].enqueue(oid);
    }

    /// Batched enqueue for one target channel (reference-marker flushes).
    pub fn enqueue_batch(&self, channel: u32, oids: &[u64]) {
        if oids.is_empty() {
            return;
        }
        debug_assert!(oids.iter().all(|oid| oid & self.channel_mask == channel as u64));
        {
            let mut state = self.state.lock();
            state.pending[channel as usize] += oids.len() as u64;
            state.total_pending += oids.len() as u64;
        }
        self.stats.record_enqueued(oids.len() as u64);
        self.queues[channel as usize].enqueue_batch(oids);
    }

    /// A channel reports a completed mark batch: the processed oids are
    /// consumed from its queue and the pending counts drop together. When
    /// the global pending count reaches zero (and no store update is in
    /// flight), marking is exhausted and every channel is scheduled for
    /// its sweep.
    pub fn advance_marking(&self, channel: u32, processed: usize) {
        if processed == 0 {
            return;
        }
        self.queues[channel as usize].consume(processed);
        let mut state = self.state.lock();
        let pending = &mut state.pending[channel as usize];
        debug_assert!(*pending >= processed as u64, "advance beyond pending count");
        *pending -= processed as u64;
        state.total_pending -= processed as u64;
        self.try_enter_sweep_pending(&mut state);
    }

    /// Re-checks marking exhaustion without reporting progress. Called by
    /// channels that find their queue empty — including on a cold start
    /// where nothing was ever enqueued.
    pub fn check_mark_completion(&self) {
        let mut state = self.state.lock();
        self.try_enter_sweep_pending(&mut state);
    }

    fn try_enter_sweep_pending(&self, state: &mut MonitorState) {
        if state.phase == GcPhase::Marking
            && state.total_pending == 0
            && state.store_update_count == 0
            && state.seeded.iter().all(|&seeded| seeded)
        {
            state.phase = GcPhase::SweepPending;
            state.needs_sweep.fill(true);
            state.swept.fill(false);
            debug!(cycle = state.cycle, "marking exhausted, sweep pending");
            self.wake_all_channels();
        }
    }

    fn wake_all_channels(&self) {
        for queue in self.queues.iter() {
            queue.notify_all();
        }
    }

    /// Whether `channel` owes a sweep. The first positive answer moves the
    /// global phase from SweepPending to Sweeping.
    pub fn needs_sweep(&self, channel: u32) -> bool {
        let mut state = self.state.lock();
        let due = matches!(state.phase, GcPhase::SweepPending | GcPhase::Sweeping)
            && state.needs_sweep[channel as usize];
        if due && state.phase == GcPhase::SweepPending {
            state.phase = GcPhase::Sweeping;
        }
        due
    }

    /// A channel reports its completed sweep along with its root-oid
    /// candidate. Once every channel has reported, the cycle either
    /// completes (selecting the globally valid root: the numerically
    /// greatest candidate) or drops straight back to Marking if stores
    /// enqueued new work while sweeps were running.
    pub fn complete_sweep(&self, channel: u32, root_candidate: u64) {
        let mut state = self.state.lock();
        assert!(
            matches!(state.phase, GcPhase::SweepPending | GcPhase::Sweeping)
                && state.needs_sweep[channel as usize],
            "sweep completion without a due sweep (channel {channel})"
        );
        state.needs_sweep[channel as usize] = false;
        state.swept[channel as usize] = true;
        state.root_candidates[channel as usize] = root_candidate;

        if state.swept.iter().all(|&done| done) {
            state.cycle += 1;
            if state.total_pending == 0 && state.store_update_count == 0 {
                state.selected_root = state.root_candidates.iter().copied().max().unwrap_or(0);
                state.phase = GcPhase::Complete;
                debug!(
                    cycle = state.cycle,
                    root = state.selected_root,
                    "gc cycle complete"
                );
            } else {
                // work arrived during the sweeps, next cycle starts right away
                state.begin_mark_round();
                debug!(cycle = state.cycle, "gc cycle rolled over into new marking phase");
            }
            self.wake_all_channels();
        }
    }

    /// Whether the full mark+sweep cycle is complete.
    pub fn is_complete(&self) -> bool {
        self.state.lock().phase == GcPhase::Complete
    }

    /// Whether marking is globally exhausted (sweeps may be pending or
    /// running, or the cycle may already be complete).
    pub fn is_marking_complete(&self) -> bool {
        !matches!(self.state.lock().phase, GcPhase::Marking)
    }

    /// Announces an in-flight store update on `channel`. Resets completion:
    /// a completed cycle reopens, because the stored entities must be
    /// re-visited before the next sweep may run.
    pub fn signal_pending_store_update(&self, channel: u32) {
        let mut state = self.state.lock();
        if !state.store_update[channel as usize] {
            state.store_update[channel as usize] = true;
            state.store_update_count += 1;
        }
        if state.phase == GcPhase::Complete {
            state.begin_mark_round();
        }
    }

    /// Clears the store-update flag once the chunk is fully registered.
    pub fn clear_pending_store_update(&self, channel: u32) {
        let mut state = self.state.lock();
        if state.store_update[channel as usize] {
            state.store_update[channel as usize] = false;
            state.store_update_count -= 1;
            // the cleared flag may have been the last thing holding back
            // the sweep transition
            self.try_enter_sweep_pending(&mut state);
        }
    }

    /// Bounded wait on a channel's queue; see [`MarkQueue::wait_for_work`].
    pub fn wait_for_work(&self, channel: u32, timeout: Duration) -> bool {
        self.queues[channel as usize].wait_for_work(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cold_start_completes_without_work() {
        let monitor = MarkMonitor::new(2);
        assert_eq!(monitor.phase(), GcPhase::Marking);

        // nothing was ever enqueued, but both channels must still seed
        // their (empty) root sets before the sweep may begin
        monitor.report_roots_seeded(0);
        monitor.check_mark_completion();
        assert_eq!(monitor.phase(), GcPhase::Marking);
        monitor.report_roots_seeded(1);
        assert_eq!(monitor.phase(), GcPhase::SweepPending);

        assert!(monitor.needs_sweep(0));
        assert_eq!(monitor.phase(), GcPhase::Sweeping);
        monitor.complete_sweep(0, 0);
        assert!(monitor.needs_sweep(1));
        monitor.complete_sweep(1, 0);

        assert!(monitor.is_complete());
        assert_eq!(monitor.cycle(), 1);
    }

    #[test]
    fn test_enqueue_routes_by_low_bits_and_blocks_completion() {
        let monitor = MarkMonitor::new(2);
        monitor.report_roots_seeded(0);
        monitor.report_roots_seeded(1);
        monitor.enqueue(4); // channel 0
        monitor.enqueue(5); // channel 1
        assert_eq!(monitor.queue(0).len(), 1);
        assert_eq!(monitor.queue(1).len(), 1);

        // draining only one channel must not end the marking phase
        monitor.check_mark_completion();
        assert_eq!(monitor.phase(), GcPhase::Marking);
        monitor.advance_marking(0, 1);
        assert_eq!(monitor.phase(), GcPhase::Marking);
        monitor.advance_marking(1, 1);
        assert_eq!(monitor.phase(), GcPhase::SweepPending);
    }

    #[test]
    fn test_root_selection_takes_greatest_candidate() {
        let monitor = MarkMonitor::new(2);
        monitor.report_roots_seeded(0);
        monitor.report_roots_seeded(1);
        assert!(monitor.needs_sweep(0));
        assert!(monitor.needs_sweep(1));
        monitor.complete_sweep(0, 100);
        monitor.complete_sweep(1, 640);
        assert!(monitor.is_complete());
        assert_eq!(monitor.last_root(), 640);
    }

    #[test]
    fn test_store_update_holds_back_sweep_transition() {
        let monitor = MarkMonitor::new(1);
        monitor.report_roots_seeded(0);
        monitor.signal_pending_store_update(0);

        monitor.enqueue(2);
        monitor.advance_marking(0, 1);
        // pending hit zero but a store update is still in flight
        assert_eq!(monitor.phase(), GcPhase::Marking);

        monitor.clear_pending_store_update(0);
        assert_eq!(monitor.phase(), GcPhase::SweepPending);
    }

    #[test]
    fn test_store_during_sweep_rolls_into_next_cycle() {
        let monitor = MarkMonitor::new(2);
        monitor.report_roots_seeded(0);
        monitor.report_roots_seeded(1);
        assert!(monitor.needs_sweep(0));
        monitor.complete_sweep(0, 0);

        // a store on channel 1 enqueues work before channel 1 sweeps
        monitor.enqueue(3);

        assert!(monitor.needs_sweep(1));
        monitor.complete_sweep(1, 0);

        // all channels swept, but pending work forces a new marking phase
        assert_eq!(monitor.phase(), GcPhase::Marking);
        assert!(!monitor.is_complete());
        assert_eq!(monitor.cycle(), 1);
        // the rolled-over phase is a fresh round: roots must be re-seeded
        assert_eq!(monitor.mark_round(), 1);
    }

    #[test]
    fn test_signal_reopens_completed_cycle() {
        let monitor = MarkMonitor::new(1);
        monitor.report_roots_seeded(0);
        assert!(monitor.needs_sweep(0));
        monitor.complete_sweep(0, 9);
        assert!(monitor.is_complete());

        monitor.signal_pending_store_update(0);
        assert_eq!(monitor.phase(), GcPhase::Marking);
        assert!(!monitor.is_complete());
        assert_eq!(monitor.mark_round(), 1);
        // the previous cycle's root remains queryable
        assert_eq!(monitor.last_root(), 9);

        // the reopened round must not sweep before roots are re-seeded
        monitor.clear_pending_store_update(0);
        assert_eq!(monitor.phase(), GcPhase::Marking);
        monitor.report_roots_seeded(0);
        assert_eq!(monitor.phase(), GcPhase::SweepPending);
    }
}
