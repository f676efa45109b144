//! # sps-types: shared identifiers for the Single-Partition Scheduler
//!
//! This crate holds the small, `Copy`-able identity types threaded through
//! every message and piece of state owned by the scheduler:
//! - Sequence numbers ([`SpHandle`], [`TxnId`], [`UniqueId`])
//! - Topology identifiers ([`PartitionId`], [`SiteId`], [`ReplicaSetVersion`])
//! - Determinism comparison ([`ResultHash`])

mod hash;
mod ids;

pub use hash::{ResultHash, RESULT_HASH_LENGTH};
pub use ids::{PartitionId, ReplicaSetVersion, SiteId, SpHandle, TxnId, UniqueId};
