//! Process-wide scheduler metrics.
//!
//! No export/formatting layer is built here (out of scope per the ambient
//! stack's telemetry-formatting exclusion); this is a flat set of atomic
//! counters the host can poll and export however it likes.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global scheduler metrics singleton, following the same `const fn new()`
/// plus `AtomicU64`-fields shape as `kimberlite-vsr`'s own instrumentation,
/// minus its OpenTelemetry export machinery.
pub static METRICS: Metrics = Metrics::new();

#[derive(Debug)]
pub struct Metrics {
    // Throughput counters.
    pub handles_allocated: AtomicU64,
    pub writes_replicated: AtomicU64,
    pub reads_buffered: AtomicU64,
    pub reads_released: AtomicU64,

    // Duplicate-counter outcomes.
    pub counters_done: AtomicU64,
    pub counters_mismatch: AtomicU64,
    pub counters_abort: AtomicU64,

    // Truncation.
    pub truncation_advances: AtomicU64,
    pub truncation_broadcasts_sent: AtomicU64,
    pub truncation_broadcasts_suppressed: AtomicU64,

    // Replay.
    pub replay_duplicates_ignored: AtomicU64,

    // MP durability gate.
    pub mp_gate_opened: AtomicU64,
    pub mp_gate_drained_tasks: AtomicU64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            handles_allocated: AtomicU64::new(0),
            writes_replicated: AtomicU64::new(0),
            reads_buffered: AtomicU64::new(0),
            reads_released: AtomicU64::new(0),
            counters_done: AtomicU64::new(0),
            counters_mismatch: AtomicU64::new(0),
            counters_abort: AtomicU64::new(0),
            truncation_advances: AtomicU64::new(0),
            truncation_broadcasts_sent: AtomicU64::new(0),
            truncation_broadcasts_suppressed: AtomicU64::new(0),
            replay_duplicates_ignored: AtomicU64::new(0),
            mp_gate_opened: AtomicU64::new(0),
            mp_gate_drained_tasks: AtomicU64::new(0),
        }
    }

    pub fn record_handle_allocated(&self) {
        self.handles_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_counter_outcome(&self, outcome: crate::duplicate_counter::OfferOutcome) {
        use crate::duplicate_counter::OfferOutcome;
        match outcome {
            OfferOutcome::Done => self.counters_done.fetch_add(1, Ordering::Relaxed),
            OfferOutcome::Mismatch => self.counters_mismatch.fetch_add(1, Ordering::Relaxed),
            OfferOutcome::Abort => self.counters_abort.fetch_add(1, Ordering::Relaxed),
            OfferOutcome::Waiting => return,
        };
    }

    pub fn record_truncation_advance(&self) {
        self.truncation_advances.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
