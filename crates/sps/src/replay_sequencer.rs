//! `ReplaySequencer` — orders command-log replay and MP sentinel messages by
//! unique-id so a partition reproduces exactly the schedule it originally
//! produced, and deduplicates replayed unique-ids (testable property P7).

use std::collections::{BTreeMap, HashSet};

use sps_types::UniqueId;
use tracing::debug;

/// Result of [`ReplaySequencer::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Held for later; a smaller unique-id is still outstanding.
    Accepted,
    /// This is the smallest currently-held unique-id; dispatch it now.
    Deliverable,
}

/// Orders replay messages by [`UniqueId`] and deduplicates replayed
/// unique-ids. Generic over the message payload type so both `InitiateTask`
/// replays and MP sentinel messages can share one sequencer instance.
#[derive(Debug, Clone)]
pub struct ReplaySequencer<M> {
    seen: HashSet<UniqueId>,
    held: BTreeMap<UniqueId, M>,
    last_seen: Option<UniqueId>,
    last_polled: Option<UniqueId>,
}

impl<M> Default for ReplaySequencer<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> ReplaySequencer<M> {
    pub fn new() -> Self {
        Self {
            seen: HashSet::new(),
            held: BTreeMap::new(),
            last_seen: None,
            last_polled: None,
        }
    }

    /// If `u` has already been seen, returns `true` and the caller should
    /// synthesize an `IGNORED_TRANSACTION` response instead of dispatching.
    pub fn dedupe(&self, u: UniqueId) -> bool {
        self.seen.contains(&u)
    }

    /// Offers `(u, m)` for ordered dispatch. Marks `u` seen regardless of
    /// outcome, per P7 (each unique-id dispatches at most once).
    pub fn offer(&mut self, u: UniqueId, m: M) -> OfferOutcome {
        self.seen.insert(u);
        self.update_last_seen(u);
        self.held.insert(u, m);

        if self.held.keys().next() == Some(&u) {
            OfferOutcome::Deliverable
        } else {
            debug!(u = %u, "replay message held pending smaller unique-id");
            OfferOutcome::Accepted
        }
    }

    /// Removes and returns the smallest held message, if any is currently
    /// orderable.
    pub fn poll(&mut self) -> Option<(UniqueId, M)> {
        let next_key = *self.held.keys().next()?;
        let m = self.held.remove(&next_key)?;
        self.update_last_polled(next_key);
        Some((next_key, m))
    }

    /// Drains every held message in ascending unique-id order.
    pub fn drain(&mut self) -> Vec<(UniqueId, M)> {
        let mut out = Vec::with_capacity(self.held.len());
        while let Some(entry) = self.poll() {
            out.push(entry);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// On a replica, track replay progress without buffering anything
    /// locally (the leader is the one reproducing order).
    pub fn update_last_seen(&mut self, u: UniqueId) {
        if self.last_seen.map_or(true, |last| u > last) {
            self.last_seen = Some(u);
        }
    }

    pub fn update_last_polled(&mut self, u: UniqueId) {
        if self.last_polled.map_or(true, |last| u > last) {
            self.last_polled = Some(u);
        }
    }

    pub fn last_seen(&self) -> Option<UniqueId> {
        self.last_seen
    }

    pub fn last_polled(&self) -> Option<UniqueId> {
        self.last_polled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_unique_id_is_deliverable_immediately() {
        let mut seq: ReplaySequencer<&'static str> = ReplaySequencer::new();
        assert_eq!(
            seq.offer(UniqueId::new(5), "first"),
            OfferOutcome::Deliverable
        );
    }

    #[test]
    fn later_unique_id_is_held_until_smaller_one_drains() {
        let mut seq: ReplaySequencer<&'static str> = ReplaySequencer::new();
        seq.offer(UniqueId::new(5), "five");
        assert_eq!(
            seq.offer(UniqueId::new(9), "nine"),
            OfferOutcome::Accepted
        );
        let drained = seq.drain();
        assert_eq!(drained[0].0, UniqueId::new(5));
        assert_eq!(drained[1].0, UniqueId::new(9));
    }

    #[test]
    fn duplicate_unique_id_is_deduped() {
        let mut seq: ReplaySequencer<&'static str> = ReplaySequencer::new();
        seq.offer(UniqueId::new(42), "first");
        seq.drain();
        assert!(seq.dedupe(UniqueId::new(42)));
        assert!(!seq.dedupe(UniqueId::new(43)));
    }

    #[test]
    fn last_seen_and_polled_track_high_water_marks() {
        let mut seq: ReplaySequencer<()> = ReplaySequencer::new();
        seq.update_last_seen(UniqueId::new(3));
        seq.update_last_seen(UniqueId::new(1));
        assert_eq!(seq.last_seen(), Some(UniqueId::new(3)));
        seq.update_last_polled(UniqueId::new(2));
        assert_eq!(seq.last_polled(), Some(UniqueId::new(2)));
    }
}
