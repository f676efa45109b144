//! `SpScheduler` — the dispatch loop and state machine (§4.1).
//!
//! Mirrors the way `kimberlite-vsr`'s replica state machine is organized:
//! a central owned-state struct with a single `process()` entry point that
//! classifies an event and delegates to a per-message-class handler, each
//! returning the same `(Self, SchedulerOutput)` shape so side effects are
//! data the host executes, never performed here.

mod dispatch;
mod role;

use std::collections::HashMap;

use sps_types::{PartitionId, ReplicaSetVersion, SiteId, SpHandle, TxnId, UniqueId};
use tracing::info;

use crate::allocator::SpHandleAllocator;
use crate::buffered_reads::BufferedReadLog;
use crate::collaborators::{CommandLogRecord, DurabilityTicket};
use crate::duplicate_counter::DuplicateCounterIndex;
use crate::errors::SchedulerFault;
use crate::message::{Envelope, MessagePayload};
use crate::mp_durability_gate::MpDurabilityGate;
use crate::replay_sequencer::{OfferOutcome as ReplayOfferOutcome, ReplaySequencer};
use crate::transaction_state::TransactionState;
use crate::truncation::RepairLogTruncationTracker;

/// A procedure invocation handed off to the execution engine's task queue.
#[derive(Debug, Clone, PartialEq)]
pub struct SpProcedureTask {
    pub envelope: Envelope,
    /// Short-circuit reads skip the command log entirely (§4.1).
    pub short_circuit: bool,
}

/// Queued work behind an [`MpDurabilityGate`] entry: either a later fragment
/// or the complete-transaction message for the same `T`.
#[derive(Debug, Clone, PartialEq)]
pub enum MpQueuedTask {
    Fragment(crate::message::FragmentTask),
    Complete(crate::message::CompleteTransactionMessage),
}

/// Events the scheduler reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// An inbound protocol message.
    Message(Envelope),
    /// Membership service: `updateReplicas(replicas, partitionMasters)`.
    UpdateReplicas { replicas: Vec<SiteId> },
    /// Membership service: `setLeaderState(bool)`.
    SetLeaderState(bool),
    /// A command-log append for `t` has become durable.
    DurabilityComplete { t: TxnId, ticket: DurabilityTicket },
    /// Membership service: `enableWritingFaultLog()`.
    EnableWritingFaultLog,
}

/// Side effects produced by one call to [`SpScheduler::process`]. The host
/// is responsible for carrying these out; the scheduler performs no I/O.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerOutput {
    /// Messages to hand to the mailbox collaborator.
    pub outbound: Vec<Envelope>,
    /// Procedures to hand to the execution engine collaborator.
    pub tasks: Vec<SpProcedureTask>,
    /// Records to append to the command log collaborator.
    pub log_records: Vec<CommandLogRecord>,
    /// Set when a condition requires the host to terminate this node after
    /// carrying out the other effects (e.g. broadcasting a dump-plan).
    pub fault: Option<SchedulerFault>,
}

impl SchedulerOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty()
            && self.tasks.is_empty()
            && self.log_records.is_empty()
            && self.fault.is_none()
    }

    pub fn with_outbound(mut self, envelope: Envelope) -> Self {
        self.outbound.push(envelope);
        self
    }

    pub fn with_task(mut self, task: SpProcedureTask) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_log_record(mut self, record: CommandLogRecord) -> Self {
        self.log_records.push(record);
        self
    }

    pub fn with_fault(mut self, fault: SchedulerFault) -> Self {
        self.fault = Some(fault);
        self
    }

    /// Combines two outputs, preserving order (this output's effects happen
    /// first). A fault on either side wins; if both set one, keep the first
    /// — a scheduler never produces two faults from one event in practice,
    /// but this keeps merge associative.
    pub fn merge(mut self, mut other: Self) -> Self {
        self.outbound.append(&mut other.outbound);
        self.tasks.append(&mut other.tasks);
        self.log_records.append(&mut other.log_records);
        if self.fault.is_none() {
            self.fault = other.fault;
        }
        self
    }
}

/// Static identity and replication configuration for one partition
/// scheduler instance.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub site_id: SiteId,
    pub partition_id: PartitionId,
    pub command_log_synchronous: bool,
}

/// Owned state for one partition's scheduler. All mutation happens through
/// [`Self::process`]; there is no interior mutability and no background
/// thread — the host's single-threaded event loop drives this type.
#[derive(Debug, Clone)]
pub struct SpScheduler {
    config: SchedulerConfig,
    is_leader: bool,
    replicas: Vec<SiteId>,
    replica_set_version: ReplicaSetVersion,

    allocator: SpHandleAllocator,
    truncation: RepairLogTruncationTracker,
    buffered_reads: BufferedReadLog,
    counters: DuplicateCounterIndex,
    transactions: HashMap<TxnId, TransactionState>,
    mp_gate: MpDurabilityGate<MpQueuedTask>,
    replay: ReplaySequencer<MessagePayload>,

    /// `H_cp` recorded by `checkpointBalance()`; `None` when no migration is
    /// in progress.
    balance_checkpoint: Option<SpHandle>,
    writing_fault_log_enabled: bool,
}

impl SpScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            is_leader: false,
            replicas: Vec::new(),
            replica_set_version: ReplicaSetVersion::INITIAL,
            allocator: SpHandleAllocator::new(),
            truncation: RepairLogTruncationTracker::new(),
            buffered_reads: BufferedReadLog::new(),
            counters: DuplicateCounterIndex::new(),
            transactions: HashMap::new(),
            mp_gate: MpDurabilityGate::new(),
            replay: ReplaySequencer::new(),
            balance_checkpoint: None,
            writing_fault_log_enabled: false,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn tau(&self) -> SpHandle {
        self.truncation.tau()
    }

    pub fn replicas(&self) -> &[SiteId] {
        &self.replicas
    }

    pub fn replica_set_version(&self) -> ReplicaSetVersion {
        self.replica_set_version
    }

    pub fn open_counter_count(&self) -> usize {
        self.counters.len()
    }

    pub fn transaction(&self, t: TxnId) -> Option<&TransactionState> {
        self.transactions.get(&t)
    }

    /// Like [`Self::transaction`], but for callers (host diagnostics, tests)
    /// that want to propagate the lookup failure as an error instead of
    /// matching on `None`.
    pub fn require_transaction(
        &self,
        t: TxnId,
    ) -> Result<&TransactionState, crate::errors::TransactionError> {
        self.transactions
            .get(&t)
            .ok_or(crate::errors::TransactionError::Unknown(t))
    }

    /// Replay-stream front door (§4.5): the host runs every replay-sourced
    /// message through these before calling [`Self::process`], per the
    /// `inbound → (replay sequencer, if replay) → classification` pipeline.
    ///
    /// `true` means `u` was already seen; the host should synthesize an
    /// `IGNORED_TRANSACTION` response instead of offering `m` at all.
    pub fn replay_dedupe(&self, u: UniqueId) -> bool {
        let duplicate = self.replay.dedupe(u);
        if duplicate {
            crate::instrumentation::METRICS
                .replay_duplicates_ignored
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        duplicate
    }

    pub fn replay_offer(&mut self, u: UniqueId, m: MessagePayload) -> ReplayOfferOutcome {
        self.replay.offer(u, m)
    }

    pub fn replay_poll(&mut self) -> Option<(UniqueId, MessagePayload)> {
        self.replay.poll()
    }

    pub fn replay_drain(&mut self) -> Vec<(UniqueId, MessagePayload)> {
        self.replay.drain()
    }

    /// Tracks replay progress on a replica without buffering anything
    /// locally — the leader is the one reproducing order.
    pub fn update_last_seen_unique_id(&mut self, u: UniqueId) {
        self.replay.update_last_seen(u);
    }

    pub fn update_last_polled_unique_id(&mut self, u: UniqueId) {
        self.replay.update_last_polled(u);
    }

    pub fn last_seen_unique_id(&self) -> Option<UniqueId> {
        self.replay.last_seen()
    }

    pub fn last_polled_unique_id(&self) -> Option<UniqueId> {
        self.replay.last_polled()
    }

    /// `sendTo = replicas \ self`, recomputed on every `updateReplicas`.
    fn peers(&self) -> Vec<SiteId> {
        self.replicas
            .iter()
            .copied()
            .filter(|r| *r != self.config.site_id)
            .collect()
    }

    /// The central dispatch entry point. Classifies `event`, mutates state,
    /// and returns the effects the host must carry out.
    pub fn process(mut self, event: SchedulerEvent) -> (Self, SchedulerOutput) {
        let output = match event {
            SchedulerEvent::Message(envelope) => self.on_message(envelope),
            SchedulerEvent::UpdateReplicas { replicas } => self.on_update_replicas(replicas),
            SchedulerEvent::SetLeaderState(is_leader) => self.on_set_leader_state(is_leader),
            SchedulerEvent::DurabilityComplete { t, ticket: _ } => {
                self.on_durability_complete(t)
            }
            SchedulerEvent::EnableWritingFaultLog => {
                self.writing_fault_log_enabled = true;
                SchedulerOutput::empty()
            }
        };
        (self, output)
    }

    fn on_message(&mut self, envelope: Envelope) -> SchedulerOutput {
        use crate::message::MessagePayload as P;
        match envelope.payload.clone() {
            P::InitiateTask(task) => self.on_initiate_task(envelope.from, task),
            P::InitiateResponse(resp) => self.on_initiate_response(resp),
            P::FragmentTask(task) => self.on_fragment_task(envelope.from, task),
            P::FragmentResponse(resp) => self.on_fragment_response(resp),
            P::CompleteTransactionMessage(msg) => self.on_complete_transaction_message(msg),
            P::CompleteTransactionResponse(resp) => self.on_complete_transaction_response(resp),
            P::BorrowTask(task) => self.on_borrow_task(task),
            P::RepairLogTruncation(msg) => self.on_repair_log_truncation(msg),
            P::LogFault(msg) => self.on_log_fault(msg),
            P::Repair(msg) => self.on_repair(msg),
            P::Dump(_) => SchedulerOutput::empty(),
            P::DumpPlanThenExit(_) => SchedulerOutput::empty(),
            P::DummyTransactionTask(task) => self.on_dummy_task(task),
            P::DummyTransactionResponse(resp) => self.on_dummy_response(resp),
        }
    }

    fn on_durability_complete(&mut self, t: TxnId) -> SchedulerOutput {
        let drained = self.mp_gate.drain(t);
        crate::instrumentation::METRICS
            .mp_gate_drained_tasks
            .fetch_add(drained.len() as u64, std::sync::atomic::Ordering::Relaxed);
        let mut output = SchedulerOutput::empty();
        for queued in drained {
            output = output.with_task(self.mp_queued_to_task(queued));
        }
        info!(t = %t, "mp-durability gate drained");
        output
    }

    fn mp_queued_to_task(&self, queued: MpQueuedTask) -> SpProcedureTask {
        let payload = match queued {
            MpQueuedTask::Fragment(f) => MessagePayload::FragmentTask(f),
            MpQueuedTask::Complete(c) => MessagePayload::CompleteTransactionMessage(c),
        };
        SpProcedureTask {
            envelope: Envelope::broadcast(self.config.site_id, payload),
            short_circuit: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(site: u64) -> SpScheduler {
        SpScheduler::new(SchedulerConfig {
            site_id: SiteId::new(site),
            partition_id: PartitionId::new(0),
            command_log_synchronous: false,
        })
    }

    #[test]
    fn leader_transition_is_idempotent_and_logged() {
        let mut s = scheduler(1);
        let (next, out) = s.clone().process(SchedulerEvent::SetLeaderState(true));
        assert!(next.is_leader());
        assert!(out.is_empty());
        let (next2, out2) = next.process(SchedulerEvent::SetLeaderState(true));
        assert!(next2.is_leader());
        assert!(out2.is_empty());
    }

    #[test]
    fn replay_stream_dedupes_and_orders_by_unique_id() {
        let mut s = scheduler(1);
        let u1 = UniqueId::new(5);
        let u2 = UniqueId::new(2);

        assert!(!s.replay_dedupe(u2));
        s.replay_offer(u1, MessagePayload::DummyTransactionTask(crate::message::DummyTransactionTask {
            t: TxnId::new(5),
            h: SpHandle::new(5),
        }));
        s.replay_offer(u2, MessagePayload::DummyTransactionTask(crate::message::DummyTransactionTask {
            t: TxnId::new(2),
            h: SpHandle::new(2),
        }));

        let drained = s.replay_drain();
        assert_eq!(drained[0].0, u2);
        assert_eq!(drained[1].0, u1);
        assert!(s.replay_dedupe(u1));
    }

    #[test]
    fn durability_complete_drains_mp_gate_in_arrival_order() {
        let mut s = scheduler(1);
        let t = TxnId::new(7);
        s.mp_gate.open(t);
        let fragment = crate::message::FragmentTask {
            initiator_id: SiteId::new(9),
            coordinator_id: SiteId::new(9),
            t,
            h: SpHandle::new(1),
            involved_partitions: vec![],
            sys_proc: false,
            read_only: false,
            is_final: false,
            is_replica_copy: false,
            to_replica: false,
            handled_by_original_leader: false,
        };
        s.mp_gate.enqueue(t, MpQueuedTask::Fragment(fragment));

        let (_, out) = s.process(SchedulerEvent::DurabilityComplete {
            t,
            ticket: DurabilityTicket::new(1),
        });
        assert_eq!(out.tasks.len(), 1);
    }

    #[test]
    fn require_transaction_reports_unknown_txn() {
        let s = scheduler(1);
        let err = s.require_transaction(TxnId::new(404)).unwrap_err();
        assert_eq!(err, crate::errors::TransactionError::Unknown(TxnId::new(404)));
    }
}
