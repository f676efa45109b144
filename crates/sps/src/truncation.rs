//! `RepairLogTruncationTracker` — advances `τ` and schedules piggy-backable
//! truncation broadcasts.

use sps_types::SpHandle;
use tracing::info;

/// Side effect requested by [`RepairLogTruncationTracker::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationEffect {
    /// `τ` did not move; nothing to do.
    None,
    /// `τ` advanced; release buffered reads up to it and arm the broadcast
    /// scheduler so a dedicated broadcast fires if nothing else carries the
    /// new `τ` piggy-backed first.
    Advanced { tau: SpHandle },
}

/// Tracks the repair-log truncation handle `τ` and the amortised broadcast
/// policy described in the component design: a dedicated
/// `RepairLogTruncation` broadcast is only sent if no other outbound
/// replicated message has piggy-backed a newer `τ` by the time the
/// scheduled broadcast task runs.
#[derive(Debug, Clone)]
pub struct RepairLogTruncationTracker {
    tau: SpHandle,
    last_sent_tau: SpHandle,
}

impl Default for RepairLogTruncationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RepairLogTruncationTracker {
    pub fn new() -> Self {
        Self {
            tau: SpHandle::ZERO,
            last_sent_tau: SpHandle::ZERO,
        }
    }

    pub fn tau(&self) -> SpHandle {
        self.tau
    }

    /// Advances `τ` to `h` if `h > τ`. `force_on_replica` covers promotion
    /// and rejoin transitions where a replica must accept `τ` moving
    /// backwards as well as forwards; in that case we always set `τ := h`
    /// without the monotonic guard.
    pub fn advance(&mut self, h: SpHandle, force_on_replica: bool) -> TruncationEffect {
        if force_on_replica {
            self.tau = h;
            return TruncationEffect::Advanced { tau: self.tau };
        }
        if h > self.tau {
            self.tau = h;
            info!(tau = %self.tau, "truncation handle advanced");
            TruncationEffect::Advanced { tau: self.tau }
        } else {
            TruncationEffect::None
        }
    }

    /// Records `τ` as having been piggy-backed on an outbound replicated
    /// message, which may suppress a pending dedicated broadcast.
    pub fn note_piggybacked_send(&mut self) {
        self.last_sent_tau = self.tau;
    }

    /// Called when the scheduled broadcast task runs. Returns `Some(tau)` if
    /// a dedicated broadcast is still needed (nothing piggy-backed it since
    /// it was scheduled), or `None` if it was already carried by a normal
    /// message and the broadcast is suppressed.
    pub fn take_pending_broadcast(&mut self) -> Option<SpHandle> {
        if self.last_sent_tau < self.tau {
            self.last_sent_tau = self.tau;
            Some(self.tau)
        } else {
            None
        }
    }
}
