//! Load tracking for the worker pool
//!
//! Lock-free counters updated by the submitter and the workers, plus a
//! serializable snapshot for callers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Point-in-time view of a queue's counters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// Configured concurrency bound
    pub concurrency: usize,
    /// Items accepted by `submit`
    pub submitted: u64,
    /// Items waiting in the channel
    pub pending: u64,
    /// Items executing right now
    pub in_flight: usize,
    /// Highest `in_flight` observed so far
    pub peak_in_flight: usize,
    /// Items that finished successfully
    pub succeeded: u64,
    /// Items that returned an error or panicked
    pub failed: u64,
    /// Items dropped by an abort or a drain timeout before finishing
    #[serde(default)]
    pub cancelled: u64,
}

impl QueueSnapshot {
    /// Items that settled: succeeded, failed or cancelled
    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed + self.cancelled
    }

    /// Ratio of busy workers (in_flight / concurrency)
    pub fn load_ratio(&self) -> f64 {
        self.in_flight as f64 / self.concurrency.max(1) as f64
    }
}

/// Shared counters for one queue
pub(crate) struct QueueStats {
    concurrency: usize,
    submitted: AtomicU64,
    started: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    first_failure: Mutex<Option<String>>,
}

impl QueueStats {
    pub(crate) fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            submitted: AtomicU64::new(0),
            started: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            first_failure: Mutex::new(None),
        }
    }

    pub(crate) fn item_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
    }

    /// Undo `item_submitted` for an item the channel refused
    pub(crate) fn submit_rejected(&self) {
        self.submitted.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn item_started(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
    }

    pub(crate) fn item_succeeded(&self) {
        if self.leave() {
            self.succeeded.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn item_failed(&self, reason: String) {
        if self.leave() {
            self.failed.fetch_add(1, Ordering::SeqCst);
            self.first_failure.lock().get_or_insert(reason);
        }
    }

    /// False when the item was already counted as cancelled
    fn leave(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Count queued and running items as cancelled; returns how many
    pub(crate) fn cancel_outstanding(&self) -> u64 {
        let submitted = self.submitted.load(Ordering::SeqCst);
        let started = self.started.swap(submitted, Ordering::SeqCst);
        let queued = submitted.saturating_sub(started);
        let running = self.in_flight.swap(0, Ordering::SeqCst) as u64;

        let cancelled = queued + running;
        self.cancelled.fetch_add(cancelled, Ordering::SeqCst);
        cancelled
    }

    /// Message of the first failure recorded, if any
    pub(crate) fn first_failure(&self) -> Option<String> {
        self.first_failure.lock().clone()
    }

    pub(crate) fn snapshot(&self) -> QueueSnapshot {
        let submitted = self.submitted.load(Ordering::SeqCst);
        let started = self.started.load(Ordering::SeqCst);

        QueueSnapshot {
            concurrency: self.concurrency,
            submitted,
            pending: submitted.saturating_sub(started),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
        }
    }
}
