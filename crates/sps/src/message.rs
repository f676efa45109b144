//! Single-Partition Scheduler protocol messages.
//!
//! This module defines every message class the scheduler classifies and
//! dispatches on:
//!
//! ## Single-partition writes and reads
//! - [`InitiateTask`] — client (or replay source) → leader: run this procedure
//! - [`InitiateResponse`] — leader/replica → initiator: result of an initiate
//!
//! ## Multi-partition participation
//! - [`FragmentTask`] — MP coordinator → leader: scatter message
//! - [`FragmentResponse`] — leader/replica → MPI: fragment result
//! - [`CompleteTransactionMessage`] — coordinator/leader → replicas: finalize `T`
//! - [`CompleteTransactionResponse`] — replica → leader: finalize ack
//! - [`BorrowTask`] — MP read executed locally without replication
//!
//! ## Repair and diagnostics
//! - [`RepairLogTruncationMessage`] — piggy-backed or broadcast truncation advance
//! - [`LogFaultMessage`] — leader → replica: viable-replay fault-log entry
//! - [`RepairMessage`] — replica → replicas needing repair: replay a message
//! - [`DumpMessage`] / [`DumpPlanThenExitMessage`] — diagnostics, coordinated crash
//! - [`DummyTransactionTask`] / [`DummyTransactionResponse`] — pipeline-flush no-op

use serde::{Deserialize, Serialize};
use sps_types::{PartitionId, ResultHash, SiteId, SpHandle, TxnId, UniqueId};

/// A scheduler message with routing information.
///
/// `to: None` marks a broadcast (e.g. a truncation message sent to every
/// replica); `to: Some(site)` is a point-to-point delivery through the
/// `Mailbox` collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: SiteId,
    pub to: Option<SiteId>,
    pub payload: MessagePayload,
}

impl Envelope {
    pub fn targeted(from: SiteId, to: SiteId, payload: MessagePayload) -> Self {
        Self {
            from,
            to: Some(to),
            payload,
        }
    }

    pub fn broadcast(from: SiteId, payload: MessagePayload) -> Self {
        Self {
            from,
            to: None,
            payload,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// The transaction id this message concerns, where applicable. Messages
    /// that aren't scoped to a single `T` (dump, truncation broadcast) return
    /// `None`.
    pub fn txn_id(&self) -> Option<TxnId> {
        self.payload.txn_id()
    }

    pub fn name(&self) -> &'static str {
        self.payload.name()
    }
}

/// Read-consistency level requested by an [`InitiateTask`] or MP fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConsistency {
    /// Served by any replica without coordination.
    Fast,
    /// Held until preceding writes are cluster-committed.
    Safe,
}

/// Whether a replica's execution of a procedure committed or rolled back.
/// Carried on the wire so the leader can tell a hash mismatch (both replicas
/// ran to completion, disagreeing on the result) apart from a partial abort
/// (one replica rolled back while another succeeded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    Success,
    Aborted,
}

/// Classification of the payload carried by an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessagePayload {
    InitiateTask(InitiateTask),
    InitiateResponse(InitiateResponse),
    FragmentTask(FragmentTask),
    FragmentResponse(FragmentResponse),
    CompleteTransactionMessage(CompleteTransactionMessage),
    CompleteTransactionResponse(CompleteTransactionResponse),
    BorrowTask(BorrowTask),
    RepairLogTruncation(RepairLogTruncationMessage),
    LogFault(LogFaultMessage),
    Repair(RepairMessage),
    Dump(DumpMessage),
    DumpPlanThenExit(DumpPlanThenExitMessage),
    DummyTransactionTask(DummyTransactionTask),
    DummyTransactionResponse(DummyTransactionResponse),
}

impl MessagePayload {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InitiateTask(_) => "InitiateTask",
            Self::InitiateResponse(_) => "InitiateResponse",
            Self::FragmentTask(_) => "FragmentTask",
            Self::FragmentResponse(_) => "FragmentResponse",
            Self::CompleteTransactionMessage(_) => "CompleteTransactionMessage",
            Self::CompleteTransactionResponse(_) => "CompleteTransactionResponse",
            Self::BorrowTask(_) => "BorrowTask",
            Self::RepairLogTruncation(_) => "RepairLogTruncation",
            Self::LogFault(_) => "LogFault",
            Self::Repair(_) => "Repair",
            Self::Dump(_) => "Dump",
            Self::DumpPlanThenExit(_) => "DumpPlanThenExit",
            Self::DummyTransactionTask(_) => "DummyTransactionTask",
            Self::DummyTransactionResponse(_) => "DummyTransactionResponse",
        }
    }

    pub fn txn_id(&self) -> Option<TxnId> {
        match self {
            Self::InitiateTask(m) => Some(m.t),
            Self::InitiateResponse(m) => Some(m.t),
            Self::FragmentTask(m) => Some(m.t),
            Self::FragmentResponse(m) => Some(m.t),
            Self::CompleteTransactionMessage(m) => Some(m.t),
            Self::CompleteTransactionResponse(m) => Some(m.t),
            Self::BorrowTask(m) => Some(m.fragment.t),
            Self::DummyTransactionTask(m) => Some(m.t),
            Self::DummyTransactionResponse(m) => Some(m.t),
            Self::RepairLogTruncation(_)
            | Self::LogFault(_)
            | Self::Repair(_)
            | Self::Dump(_)
            | Self::DumpPlanThenExit(_) => None,
        }
    }
}

/// Client (or replay source) request to run a single-partition procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiateTask {
    pub initiator_id: SiteId,
    pub coordinator_id: SiteId,
    pub trunc_handle: SpHandle,
    /// The sp-handle stamped by the leader before replication. Zero on the
    /// original client request; filled in once classified (§4.1, "clone the
    /// message, stamp H").
    pub h: SpHandle,
    pub t: TxnId,
    pub u: UniqueId,
    pub read_only: bool,
    pub consistency: ReadConsistency,
    pub single_part: bool,
    pub ci_handle: u64,
    pub conn_id: u64,
    pub for_replay: bool,
    pub is_replica_copy: bool,
}

impl InitiateTask {
    /// A short-circuit read never touches the command log: it carries no
    /// write intent and is not itself replicated.
    pub fn is_short_circuit_read(&self) -> bool {
        self.read_only && matches!(self.consistency, ReadConsistency::Fast)
    }
}

/// Result of an [`InitiateTask`], looked up by `{T, H}` on receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiateResponse {
    pub t: TxnId,
    pub h: SpHandle,
    pub source_id: SiteId,
    pub initiator_id: SiteId,
    pub ci_handle: u64,
    pub read_only: bool,
    pub status: ReplicaStatus,
    /// Determinism digest compared across replicas.
    pub hash: ResultHash,
    /// One digest per statement the procedure ran, for finer-grained
    /// determinism diagnostics than the single aggregate `hash`.
    pub hashes: Vec<ResultHash>,
    /// The procedure's actual return value, opaque to the scheduler.
    pub results: Vec<u8>,
}

/// The MP coordinator's scatter message to a partition leader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentTask {
    pub initiator_id: SiteId,
    pub coordinator_id: SiteId,
    pub t: TxnId,
    pub h: SpHandle,
    pub involved_partitions: Vec<PartitionId>,
    pub sys_proc: bool,
    pub read_only: bool,
    pub is_final: bool,
    pub is_replica_copy: bool,
    pub to_replica: bool,
    pub handled_by_original_leader: bool,
}

/// Result of a [`FragmentTask`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentResponse {
    pub t: TxnId,
    pub h: SpHandle,
    pub source_id: SiteId,
    pub dest_id: SiteId,
    pub status: ReplicaStatus,
    pub hash: ResultHash,
    pub misrouted_to: Option<SiteId>,
}

/// Finalizes a multi-partition transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteTransactionMessage {
    pub t: TxnId,
    pub h: SpHandle,
    pub coordinator_id: SiteId,
    pub to_leader: bool,
    pub restart: bool,
    pub read_only: bool,
    pub ack_requested: bool,
}

/// Acknowledges a [`CompleteTransactionMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteTransactionResponse {
    pub t: TxnId,
    pub h: SpHandle,
    pub restart: bool,
    pub ack_requested: bool,
    pub spi_id: SiteId,
}

/// An MP read executed locally without replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BorrowTask {
    pub fragment: FragmentTask,
}

/// Piggy-backed or broadcast truncation-handle advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairLogTruncationMessage {
    pub tau: SpHandle,
}

/// Sent to a replica when the leader writes a viable-replay fault-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFaultMessage {
    pub h_fault: SpHandle,
    pub u: UniqueId,
}

/// Asks the recipients in `needs_repair` to replay `inner`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairMessage {
    pub needs_repair: Vec<SiteId>,
    pub inner: Box<MessagePayload>,
}

/// Diagnostic dump request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpMessage;

/// Sent to peers after a non-determinism mismatch, just before the sender
/// terminates itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpPlanThenExitMessage {
    pub proc_name: String,
}

/// No-op ordered message used to flush the command-log pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DummyTransactionTask {
    pub t: TxnId,
    pub h: SpHandle,
}

/// Response to a [`DummyTransactionTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DummyTransactionResponse {
    pub t: TxnId,
    pub h: SpHandle,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(id: u64) -> SiteId {
        SiteId::new(id)
    }

    #[test]
    fn broadcast_envelope_has_no_destination() {
        let env = Envelope::broadcast(
            site(1),
            MessagePayload::RepairLogTruncation(RepairLogTruncationMessage {
                tau: SpHandle::new(10),
            }),
        );
        assert!(env.is_broadcast());
        assert_eq!(env.name(), "RepairLogTruncation");
        assert_eq!(env.txn_id(), None);
    }

    #[test]
    fn targeted_envelope_carries_destination() {
        let env = Envelope::targeted(
            site(1),
            site(2),
            MessagePayload::DummyTransactionTask(DummyTransactionTask {
                t: TxnId::new(5),
                h: SpHandle::new(5),
            }),
        );
        assert!(!env.is_broadcast());
        assert_eq!(env.to, Some(site(2)));
        assert_eq!(env.txn_id(), Some(TxnId::new(5)));
    }

    #[test]
    fn short_circuit_read_is_fast_and_read_only() {
        let task = InitiateTask {
            initiator_id: site(1),
            coordinator_id: site(1),
            trunc_handle: SpHandle::ZERO,
            h: SpHandle::ZERO,
            t: TxnId::new(1),
            u: UniqueId::ZERO,
            read_only: true,
            consistency: ReadConsistency::Fast,
            single_part: true,
            ci_handle: 0,
            conn_id: 0,
            for_replay: false,
            is_replica_copy: false,
        };
        assert!(task.is_short_circuit_read());

        let safe = InitiateTask {
            consistency: ReadConsistency::Safe,
            ..task
        };
        assert!(!safe.is_short_circuit_read());
    }
}
