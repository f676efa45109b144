//! Trait seams for the scheduler's external collaborators (§1, §6).
//!
//! The scheduler never touches these implementations' internals; it is
//! referenced only by interface, mirroring the way `kimberlite-vsr`'s
//! `ReplicaOutput` hands completed effects to its host rather than
//! performing I/O itself.

use sps_types::{PartitionId, SiteId};

use crate::message::Envelope;

/// A one-shot completion handle for an asynchronous command-log append. The
/// execution site may await it to throttle on back-pressure; it carries no
/// cancellation, since the command log cannot retract a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DurabilityTicket(u64);

impl DurabilityTicket {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// The asynchronous durability oracle. `append` never blocks; whether it
/// resolves synchronously is reported by `is_synchronous`, which the
/// scheduler uses to decide whether to open an [`MpDurabilityGate`](crate::mp_durability_gate::MpDurabilityGate)
/// entry for a transaction's first fragment.
pub trait CommandLog {
    fn append(&mut self, record: CommandLogRecord) -> DurabilityTicket;
    fn is_synchronous(&self) -> bool;
}

/// A record appended to the command log: either a transaction's procedure
/// invocation or a viable-replay fault-log entry (§6 persisted state).
#[derive(Debug, Clone, PartialEq)]
pub enum CommandLogRecord {
    Procedure(Envelope),
    ViableReplayFault {
        leader_site_id: SiteId,
        replica_set: Vec<SiteId>,
        partition_id: PartitionId,
        h_fault: sps_types::SpHandle,
    },
}

/// A handle to a task submitted to the execution engine's task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

impl TaskHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// The execution engine that runs a procedure and produces a response,
/// invoked via the task queue. The scheduler submits and never calls back
/// in; the response re-enters the scheduler as an ordinary message.
pub trait ExecutionEngine {
    fn submit(&mut self, envelope: Envelope) -> TaskHandle;
}

/// Point-to-point and multicast message delivery with FIFO ordering per
/// source (§5).
pub trait Mailbox {
    fn send(&mut self, dest: SiteId, envelope: Envelope);
    fn multicast(&mut self, dests: &[SiteId], envelope: Envelope);
}

/// Supplies the replica set and partition-master map, and issues the
/// membership commands listed in §6.
pub trait Membership {
    fn replicas(&self, partition: PartitionId) -> Vec<SiteId>;
    fn partition_master(&self, partition: PartitionId) -> Option<SiteId>;
}
