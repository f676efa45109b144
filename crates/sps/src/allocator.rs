//! Monotonic sp-handle / unique-id generation.

use sps_types::{SpHandle, UniqueId};

/// Generates strictly increasing sp-handles and unique-ids for one
/// partition while it is the leader.
///
/// A non-leader never generates handles locally; it only tracks the
/// high-water mark of handles it has seen (invariant 6), via
/// [`Self::observe`].
#[derive(Debug, Clone)]
pub struct SpHandleAllocator {
    next_h: SpHandle,
    max_seen_h: SpHandle,
    next_u: UniqueId,
}

impl Default for SpHandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SpHandleAllocator {
    pub fn new() -> Self {
        Self {
            next_h: SpHandle::ZERO.next(),
            max_seen_h: SpHandle::ZERO,
            next_u: UniqueId::ZERO,
        }
    }

    /// Assigns the next sp-handle. Only valid while this partition is the
    /// leader (invariant 6: `H` is strictly monotonic on a leader).
    pub fn next_handle(&mut self) -> SpHandle {
        let h = self.next_h;
        self.next_h = h.next();
        if h > self.max_seen_h {
            self.max_seen_h = h;
        }
        h
    }

    /// Assigns the next unique-id, used for writes on the leader.
    pub fn next_unique_id(&mut self) -> UniqueId {
        let u = self.next_u;
        self.next_u = UniqueId::new(u.as_u64() + 1);
        u
    }

    /// The highest sp-handle currently scheduled, used by reads that reuse
    /// `maxScheduledH` rather than allocating a fresh handle.
    pub fn max_scheduled(&self) -> SpHandle {
        if self.next_h.as_u64() == 0 {
            SpHandle::ZERO
        } else {
            SpHandle::new(self.next_h.as_u64() - 1)
        }
    }

    /// Records a handle observed from a replica-copy or replay message.
    /// `maxSeenH` only ever advances (invariant 6).
    pub fn observe(&mut self, h: SpHandle) {
        if h > self.max_seen_h {
            self.max_seen_h = h;
        }
    }

    pub fn max_seen(&self) -> SpHandle {
        self.max_seen_h
    }

    /// Adopts a unique-id seen on a replayed or replica-copy message so that
    /// subsequently generated ids never collide with it.
    pub fn adopt_unique_id(&mut self, u: UniqueId) {
        if u.as_u64() >= self.next_u.as_u64() {
            self.next_u = UniqueId::new(u.as_u64() + 1);
        }
    }

    /// Re-seeds the generator to resume past a given handle, used on
    /// follower-to-leader promotion so a site that only ever observed
    /// handles as a replica doesn't reissue one already in use.
    pub fn advance_to(&mut self, h: SpHandle) {
        if h >= self.next_h {
            self.next_h = h.next();
        }
        self.observe(h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_strictly_increase() {
        let mut alloc = SpHandleAllocator::new();
        let a = alloc.next_handle();
        let b = alloc.next_handle();
        assert!(b > a);
    }

    #[test]
    fn max_seen_only_advances() {
        let mut alloc = SpHandleAllocator::new();
        alloc.observe(SpHandle::new(10));
        alloc.observe(SpHandle::new(3));
        assert_eq!(alloc.max_seen(), SpHandle::new(10));
    }

    #[test]
    fn adopt_unique_id_prevents_collision() {
        let mut alloc = SpHandleAllocator::new();
        alloc.adopt_unique_id(UniqueId::new(41));
        let next = alloc.next_unique_id();
        assert!(next.as_u64() > 41);
    }

    #[test]
    fn advance_to_for_replay_updates_next_handle() {
        let mut alloc = SpHandleAllocator::new();
        alloc.advance_to(SpHandle::new(100));
        let next = alloc.next_handle();
        assert_eq!(next, SpHandle::new(101));
    }
}
