//! Entity identifiers shared across the scheduler.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Monotonic per-partition sequence number assigned by [`SpHandleAllocator`](crate::SpHandleAllocator).
///
/// Strictly increasing on a leader (invariant 6); on a non-leader only the
/// high-water mark (`maxSeenH`) advances, the handle itself is never
/// generated locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpHandle(u64);

impl SpHandle {
    pub const ZERO: SpHandle = SpHandle(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The next handle in sequence. Panics on overflow, which would require
    /// roughly 2^64 transactions on a single partition.
    pub fn next(self) -> Self {
        Self(self.0.checked_add(1).expect("sp-handle overflow"))
    }
}

impl Display for SpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "H{}", self.0)
    }
}

impl From<u64> for SpHandle {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SpHandle> for u64 {
    fn from(handle: SpHandle) -> Self {
        handle.0
    }
}

/// Transaction identifier. Equals the originating `SpHandle` for
/// single-partition writes on the leader; assigned upstream (by the MP
/// coordinator, or recovered from a replay stream) otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(u64);

impl TxnId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl From<u64> for TxnId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<TxnId> for u64 {
    fn from(id: TxnId) -> Self {
        id.0
    }
}

impl From<SpHandle> for TxnId {
    fn from(handle: SpHandle) -> Self {
        Self(handle.0)
    }
}

/// Timestamp-bearing identifier used by the command log for idempotency and
/// disaster-recovery replay. Carries no ordering guarantee of its own beyond
/// uniqueness; ordering for replay is handled by `ReplaySequencer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UniqueId(u64);

impl UniqueId {
    pub const ZERO: UniqueId = UniqueId(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U{}", self.0)
    }
}

impl From<u64> for UniqueId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<UniqueId> for u64 {
    fn from(id: UniqueId) -> Self {
        id.0
    }
}

/// Identity of one partition within the keyspace. A single process may host
/// several partitions, each with its own [`sps::SpScheduler`](../sps/struct.SpScheduler.html).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(u32);

impl PartitionId {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Identity of a process hosting one or more partition replicas; the unit
/// addressed by the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteId(u64);

impl SiteId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "site{}", self.0)
    }
}

impl From<u64> for SiteId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Generation counter bumped on every `updateReplicas` call, letting a stale
/// membership view be distinguished from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct ReplicaSetVersion(u64);

impl ReplicaSetVersion {
    pub const INITIAL: ReplicaSetVersion = ReplicaSetVersion(0);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for ReplicaSetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}
