//! Per-message-class handlers for [`SpScheduler::process`] (§4.1).

use sps_types::{SiteId, SpHandle, TxnId, UniqueId};
use tracing::error;

use crate::collaborators::CommandLogRecord;
use crate::duplicate_counter::{
    collision_permitted, complete_transaction_opener, DuplicateCounter, OfferOutcome,
    ReplicaResponse,
};
use crate::errors::SchedulerFault;
use crate::message::{
    BorrowTask, CompleteTransactionMessage, CompleteTransactionResponse, DummyTransactionResponse,
    DummyTransactionTask, Envelope, FragmentResponse, FragmentTask, InitiateResponse,
    InitiateTask, LogFaultMessage, MessagePayload, ReadConsistency, ReplicaStatus, RepairMessage,
};
use crate::transaction_state::{TransactionKind, TransactionState};

use super::{SchedulerOutput, SpProcedureTask, SpScheduler};

impl SpScheduler {
    pub(super) fn on_initiate_task(
        &mut self,
        _from: SiteId,
        mut task: InitiateTask,
    ) -> SchedulerOutput {
        let mut output = SchedulerOutput::empty();

        if !task.single_part {
            return output.with_fault(SchedulerFault::MisroutedMultiPartitionInitiate { t: task.t });
        }

        let accept_locally = self.is_leader || task.read_only;
        if !accept_locally {
            // Replica receiving a write replica-copy. The leader piggybacks
            // its current truncation handle on the copy (§4.3); apply it
            // (monotonically — this is an advance, not a replica-promotion
            // reset) before anything else so a replica never misses one.
            self.truncation.advance(task.trunc_handle, false);
            self.allocator.observe(task.h);
            self.allocator.adopt_unique_id(task.u);
            let h = task.h;
            self.transactions.insert(
                task.t,
                TransactionState::new(
                    task.t,
                    TransactionKind::SpWrite,
                    h,
                    task.read_only,
                    MessagePayload::InitiateTask(task.clone()),
                ),
            );
            return output.with_task(SpProcedureTask {
                envelope: Envelope::targeted(self.config.site_id, self.config.site_id, MessagePayload::InitiateTask(task)),
                short_circuit: false,
            });
        }

        let h = if task.for_replay {
            self.allocator.adopt_unique_id(task.u);
            self.allocator.next_handle()
        } else if !task.read_only {
            task.u = self.allocator.next_unique_id();
            self.allocator.next_handle()
        } else {
            // Read or short-circuit read: reuse the high-water mark, and
            // synthesize a unique-id (no wall clock is available inside the
            // scheduler; the host may replace this before logging if it
            // needs a true timestamp).
            let h = self.allocator.max_scheduled();
            task.u = UniqueId::new(h.as_u64());
            h
        };
        crate::instrumentation::METRICS.record_handle_allocated();

        let mut stamped = task.clone();
        stamped.h = h;
        if task.single_part {
            stamped.t = TxnId::from(h);
        }

        let kind = if task.read_only {
            TransactionKind::SpRead
        } else {
            TransactionKind::SpWrite
        };
        self.transactions.insert(
            stamped.t,
            TransactionState::new(
                stamped.t,
                kind,
                h,
                task.read_only,
                MessagePayload::InitiateTask(stamped.clone()),
            ),
        );

        let peers = self.peers();
        if self.is_leader && !task.read_only && !peers.is_empty() {
            let mut replica_copy = stamped.clone();
            replica_copy.is_replica_copy = true;
            replica_copy.trunc_handle = self.truncation.tau();
            output = output.with_outbound(Envelope::broadcast(
                self.config.site_id,
                MessagePayload::InitiateTask(replica_copy),
            ));
            self.truncation.note_piggybacked_send();
            crate::instrumentation::METRICS
                .writes_replicated
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

            let mut replicas = peers.clone();
            replicas.push(self.config.site_id);
            let counter = DuplicateCounter::new(
                stamped.t,
                h,
                replicas,
                task.initiator_id,
                crate::duplicate_counter::CounterOpener::Initiate,
            );
            if self.counters.insert(counter).is_err() {
                return output.with_fault(SchedulerFault::CounterCollision { t: stamped.t, h });
            }
        }

        if !stamped.is_short_circuit_read() {
            output = output.with_log_record(CommandLogRecord::Procedure(Envelope::targeted(
                self.config.site_id,
                self.config.site_id,
                MessagePayload::InitiateTask(stamped.clone()),
            )));
        }
        output.with_task(SpProcedureTask {
            envelope: Envelope::targeted(
                self.config.site_id,
                self.config.site_id,
                MessagePayload::InitiateTask(stamped),
            ),
            short_circuit: task.is_short_circuit_read(),
        })
    }

    pub(super) fn on_initiate_response(&mut self, resp: InitiateResponse) -> SchedulerOutput {
        let mut output = SchedulerOutput::empty();

        if resp.read_only {
            // FAST reads (and anything forwarded by a replica, which never
            // buffers) go straight back to the initiator. SAFE reads on the
            // leader wait in `BufferedReadLog` until `τ` reaches their gate.
            let safe_on_leader = self.is_leader
                && matches!(
                    self.transactions.get(&resp.t).map(|txn| &txn.originating),
                    Some(MessagePayload::InitiateTask(t)) if matches!(t.consistency, ReadConsistency::Safe)
                );
            if !safe_on_leader {
                return output.with_outbound(Envelope::targeted(
                    self.config.site_id,
                    resp.initiator_id,
                    MessagePayload::InitiateResponse(resp),
                ));
            }
            let gate = self.tau();
            self.buffered_reads.enqueue(crate::buffered_reads::BufferedRead {
                gate,
                t: resp.t,
                destination: resp.initiator_id,
                hash: resp.hash,
                hashes: resp.hashes,
                results: resp.results,
            });
            crate::instrumentation::METRICS
                .reads_buffered
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return output;
        }

        if self.counters.contains(resp.t, resp.h) {
            let outcome = self
                .counters
                .get_mut(resp.t, resp.h)
                .expect("checked contains above")
                .offer(ReplicaResponse {
                    source: resp.source_id,
                    hash: resp.hash,
                    hashes: resp.hashes.clone(),
                    results: resp.results.clone(),
                    status: resp.status,
                });
            crate::instrumentation::METRICS.record_counter_outcome(outcome);
            return self.resolve_counter_outcome(resp.t, resp.h, outcome, output);
        }

        // Single-replica case: no counter was opened.
        self.advance_truncation(resp.h, &mut output);
        output.with_outbound(Envelope::targeted(
            self.config.site_id,
            resp.initiator_id,
            MessagePayload::InitiateResponse(resp),
        ))
    }

    fn resolve_counter_outcome(
        &mut self,
        t: TxnId,
        h: SpHandle,
        outcome: OfferOutcome,
        mut output: SchedulerOutput,
    ) -> SchedulerOutput {
        match outcome {
            OfferOutcome::Waiting => output,
            OfferOutcome::Done => {
                let counter = self.counters.remove(t, h).expect("present");
                let aggregated = counter.aggregated().expect("done counter has a response");
                self.advance_truncation(h, &mut output);
                output.with_outbound(Envelope::targeted(
                    self.config.site_id,
                    aggregated.destination,
                    MessagePayload::InitiateResponse(InitiateResponse {
                        t,
                        h,
                        source_id: self.config.site_id,
                        initiator_id: aggregated.destination,
                        ci_handle: 0,
                        read_only: false,
                        status: aggregated.status,
                        hash: aggregated.hash,
                        hashes: aggregated.hashes,
                        results: aggregated.results,
                    }),
                ))
            }
            OfferOutcome::Mismatch | OfferOutcome::Abort => {
                self.counters.remove(t, h);
                error!(t = %t, h = %h, "replica responses diverged");
                let peers = self.peers();
                let mut out = output;
                for peer in peers {
                    out = out.with_outbound(Envelope::targeted(
                        self.config.site_id,
                        peer,
                        MessagePayload::DumpPlanThenExit(crate::message::DumpPlanThenExitMessage {
                            proc_name: String::new(),
                        }),
                    ));
                }
                let fault = if outcome == OfferOutcome::Mismatch {
                    SchedulerFault::HashMismatch {
                        t,
                        h,
                        replica: self.config.site_id,
                    }
                } else {
                    SchedulerFault::PartialAbort {
                        t,
                        h,
                        replica: self.config.site_id,
                    }
                };
                out.with_fault(fault)
            }
        }
    }

    fn advance_truncation(&mut self, h: SpHandle, output: &mut SchedulerOutput) {
        use crate::truncation::TruncationEffect;
        if let TruncationEffect::Advanced { tau } = self.truncation.advance(h, false) {
            crate::instrumentation::METRICS.record_truncation_advance();
            if self.is_leader {
                let released = self.buffered_reads.release(tau);
                crate::instrumentation::METRICS
                    .reads_released
                    .fetch_add(released.len() as u64, std::sync::atomic::Ordering::Relaxed);
                for read in released {
                    *output = std::mem::take(output).with_outbound(Envelope::targeted(
                        self.config.site_id,
                        read.destination,
                        MessagePayload::InitiateResponse(InitiateResponse {
                            t: read.t,
                            h: read.gate,
                            source_id: self.config.site_id,
                            initiator_id: read.destination,
                            ci_handle: 0,
                            read_only: true,
                            status: ReplicaStatus::Success,
                            hash: read.hash,
                            hashes: read.hashes,
                            results: read.results,
                        }),
                    ));
                }
                if let Some(tau) = self.truncation.take_pending_broadcast() {
                    crate::instrumentation::METRICS
                        .truncation_broadcasts_sent
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    *output = std::mem::take(output).with_outbound(Envelope::broadcast(
                        self.config.site_id,
                        MessagePayload::RepairLogTruncation(
                            crate::message::RepairLogTruncationMessage { tau },
                        ),
                    ));
                } else {
                    crate::instrumentation::METRICS
                        .truncation_broadcasts_suppressed
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
        }
    }

    pub(super) fn on_fragment_task(
        &mut self,
        _from: SiteId,
        mut task: FragmentTask,
    ) -> SchedulerOutput {
        let mut output = SchedulerOutput::empty();

        if self.is_leader {
            let h = if task.read_only {
                self.allocator.max_scheduled()
            } else {
                self.allocator.next_handle()
            };
            task.h = h;

            let peers = self.peers();
            let should_replicate = !peers.is_empty() && (!task.read_only || task.sys_proc);
            if should_replicate {
                let mut replica_copy = task.clone();
                replica_copy.is_replica_copy = true;
                output = output.with_outbound(Envelope::broadcast(
                    self.config.site_id,
                    MessagePayload::FragmentTask(replica_copy),
                ));
                crate::instrumentation::METRICS
                    .writes_replicated
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let mut replicas = peers;
                replicas.push(self.config.site_id);
                let counter = DuplicateCounter::new(
                    task.t,
                    h,
                    replicas,
                    task.coordinator_id,
                    crate::duplicate_counter::CounterOpener::Fragment,
                );
                if self.counters.insert(counter).is_err() {
                    return output.with_fault(SchedulerFault::CounterCollision { t: task.t, h });
                }
            }
        } else {
            self.allocator.observe(task.h);
        }

        let first_fragment = !self.transactions.contains_key(&task.t);
        if first_fragment {
            self.transactions.insert(
                task.t,
                TransactionState::new(
                    task.t,
                    TransactionKind::MpParticipant,
                    task.h,
                    task.read_only,
                    MessagePayload::FragmentTask(task.clone()),
                ),
            );
            if !task.read_only {
                output = output.with_log_record(CommandLogRecord::Procedure(Envelope::targeted(
                    self.config.site_id,
                    self.config.site_id,
                    MessagePayload::FragmentTask(task.clone()),
                )));
                if self.config.command_log_synchronous {
                    self.mp_gate.open(task.t);
                    crate::instrumentation::METRICS
                        .mp_gate_opened
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
        }

        if task.is_final && task.read_only {
            self.transactions.remove(&task.t);
        } else if task.is_final {
            // Known now, ahead of the response that will actually resolve
            // the counter, so `on_fragment_response` can tell a completing
            // write apart from an intermediate one and advance truncation.
            if let Some(state) = self.transactions.get_mut(&task.t) {
                state.mark_done();
            }
        }

        // The first fragment is the one that (maybe) opened the gate; it
        // always proceeds to the task queue. Only later fragments for the
        // same `T` wait behind it.
        if !first_fragment && self.mp_gate.is_open(task.t) {
            self.mp_gate
                .enqueue(task.t, super::MpQueuedTask::Fragment(task));
            return output;
        }

        output.with_task(SpProcedureTask {
            envelope: Envelope::targeted(self.config.site_id, self.config.site_id, MessagePayload::FragmentTask(task)),
            short_circuit: false,
        })
    }

    pub(super) fn on_fragment_response(&mut self, resp: FragmentResponse) -> SchedulerOutput {
        let mut output = SchedulerOutput::empty();

        if let Some(misrouted_to) = resp.misrouted_to {
            return output.with_outbound(Envelope::targeted(
                self.config.site_id,
                misrouted_to,
                MessagePayload::FragmentResponse(resp),
            ));
        }

        if self.counters.contains(resp.t, resp.h) {
            let outcome = self
                .counters
                .get_mut(resp.t, resp.h)
                .expect("checked contains above")
                .offer(ReplicaResponse {
                    source: resp.source_id,
                    hash: resp.hash,
                    hashes: Vec::new(),
                    results: Vec::new(),
                    status: resp.status,
                });
            crate::instrumentation::METRICS.record_counter_outcome(outcome);
            return match outcome {
                OfferOutcome::Waiting => output,
                OfferOutcome::Done => {
                    let counter = self.counters.remove(resp.t, resp.h).expect("present");
                    let aggregated = counter.aggregated().expect("done counter has a response");
                    let txn_done = self
                        .transactions
                        .get(&resp.t)
                        .map(|t| t.done)
                        .unwrap_or(false);
                    if txn_done {
                        self.advance_truncation(resp.h, &mut output);
                    }
                    output.with_outbound(Envelope::targeted(
                        self.config.site_id,
                        aggregated.destination,
                        MessagePayload::FragmentResponse(FragmentResponse {
                            t: resp.t,
                            h: resp.h,
                            source_id: self.config.site_id,
                            dest_id: aggregated.destination,
                            status: aggregated.status,
                            hash: aggregated.hash,
                            misrouted_to: None,
                        }),
                    ))
                }
                OfferOutcome::Mismatch | OfferOutcome::Abort => {
                    self.counters.remove(resp.t, resp.h);
                    let fault = if outcome == OfferOutcome::Mismatch {
                        SchedulerFault::HashMismatch {
                            t: resp.t,
                            h: resp.h,
                            replica: self.config.site_id,
                        }
                    } else {
                        SchedulerFault::PartialAbort {
                            t: resp.t,
                            h: resp.h,
                            replica: self.config.site_id,
                        }
                    };
                    output.with_fault(fault)
                }
            };
        }

        let buffer_eligible = self.is_leader
            && !self.peers().is_empty()
            && self
                .transactions
                .get(&resp.t)
                .map(|t| t.read_only)
                .unwrap_or(false);
        if buffer_eligible {
            let gate = self
                .transactions
                .get(&resp.t)
                .map(|t| t.first_handle)
                .unwrap_or(resp.h);
            self.buffered_reads.enqueue(crate::buffered_reads::BufferedRead {
                gate,
                t: resp.t,
                destination: resp.dest_id,
                hash: resp.hash,
                hashes: Vec::new(),
                results: Vec::new(),
            });
            return output;
        }

        output.with_outbound(Envelope::targeted(
            self.config.site_id,
            resp.dest_id,
            MessagePayload::FragmentResponse(resp),
        ))
    }

    pub(super) fn on_complete_transaction_message(
        &mut self,
        mut msg: CompleteTransactionMessage,
    ) -> SchedulerOutput {
        let mut output = SchedulerOutput::empty();

        if msg.to_leader {
            msg.h = self.allocator.next_handle();
            msg.to_leader = false;
            let ack_requested = true;
            let mut outbound_msg = msg.clone();
            outbound_msg.ack_requested = ack_requested;

            let peers = self.peers();
            if !peers.is_empty() {
                output = output.with_outbound(Envelope::broadcast(
                    self.config.site_id,
                    MessagePayload::CompleteTransactionMessage(outbound_msg.clone()),
                ));
            }

            if !msg.read_only && !msg.restart {
                let mut replicas = peers;
                replicas.push(self.config.site_id);
                let counter = DuplicateCounter::new(
                    msg.t,
                    msg.h,
                    replicas,
                    msg.coordinator_id,
                    complete_transaction_opener(&msg),
                );
                if let Err(rejected) = self.counters.insert(counter) {
                    let existing_opener = self
                        .counters
                        .get(msg.t, msg.h)
                        .map(|c| c.opener().clone());
                    let permitted = existing_opener
                        .map(|o| collision_permitted(&o, msg.coordinator_id))
                        .unwrap_or(false);
                    if !permitted {
                        return output
                            .with_fault(SchedulerFault::CounterCollision { t: msg.t, h: msg.h });
                    }
                    drop(rejected);
                }
            }
            msg = outbound_msg;
        }

        if !self.transactions.contains_key(&msg.t) {
            // Rejoin snapshot cutoff: synthesize a self-response to unblock
            // the counter path.
            return output.with_outbound(Envelope::targeted(
                self.config.site_id,
                self.config.site_id,
                MessagePayload::CompleteTransactionResponse(CompleteTransactionResponse {
                    t: msg.t,
                    h: msg.h,
                    restart: msg.restart,
                    ack_requested: msg.ack_requested,
                    spi_id: self.config.site_id,
                }),
            ));
        }

        if self.mp_gate.is_open(msg.t) {
            self.mp_gate
                .enqueue(msg.t, super::MpQueuedTask::Complete(msg));
            return output;
        }

        output.with_task(SpProcedureTask {
            envelope: Envelope::targeted(
                self.config.site_id,
                self.config.site_id,
                MessagePayload::CompleteTransactionMessage(msg),
            ),
            short_circuit: false,
        })
    }

    pub(super) fn on_complete_transaction_response(
        &mut self,
        resp: CompleteTransactionResponse,
    ) -> SchedulerOutput {
        let mut output = SchedulerOutput::empty();

        if self.counters.contains(resp.t, resp.h) {
            let outcome = self
                .counters
                .get_mut(resp.t, resp.h)
                .expect("checked contains above")
                .offer(ReplicaResponse {
                    source: resp.spi_id,
                    hash: sps_types::ResultHash::from_bytes(
                        [0u8; sps_types::RESULT_HASH_LENGTH],
                    ),
                    hashes: Vec::new(),
                    results: Vec::new(),
                    status: if resp.restart {
                        ReplicaStatus::Aborted
                    } else {
                        ReplicaStatus::Success
                    },
                });
            if outcome == OfferOutcome::Done {
                self.counters.remove(resp.t, resp.h);
                self.transactions.remove(&resp.t);
                self.advance_truncation(resp.h, &mut output);
            }
        }

        if !self.is_leader && resp.ack_requested {
            output = output.with_outbound(Envelope::broadcast(
                self.config.site_id,
                MessagePayload::CompleteTransactionResponse(resp),
            ));
        }
        output
    }

    pub(super) fn on_borrow_task(&mut self, task: BorrowTask) -> SchedulerOutput {
        let t = task.fragment.t;
        self.transactions.insert(
            t,
            TransactionState::new(
                t,
                TransactionKind::MpBorrow,
                task.fragment.h,
                true,
                MessagePayload::BorrowTask(task.clone()),
            ),
        );
        SchedulerOutput::empty().with_task(SpProcedureTask {
            envelope: Envelope::targeted(
                self.config.site_id,
                self.config.site_id,
                MessagePayload::BorrowTask(task),
            ),
            short_circuit: false,
        })
    }

    pub(super) fn on_dummy_task(&mut self, task: DummyTransactionTask) -> SchedulerOutput {
        SchedulerOutput::empty().with_task(SpProcedureTask {
            envelope: Envelope::targeted(
                self.config.site_id,
                self.config.site_id,
                MessagePayload::DummyTransactionTask(task),
            ),
            short_circuit: false,
        })
    }

    pub(super) fn on_dummy_response(&mut self, resp: DummyTransactionResponse) -> SchedulerOutput {
        let mut output = SchedulerOutput::empty();
        self.advance_truncation(resp.h, &mut output);
        output
    }

    pub(super) fn on_log_fault(&mut self, msg: LogFaultMessage) -> SchedulerOutput {
        self.allocator.observe(msg.h_fault);
        self.allocator.adopt_unique_id(msg.u);
        SchedulerOutput::empty().with_log_record(CommandLogRecord::ViableReplayFault {
            leader_site_id: self.config.site_id,
            replica_set: self.replicas.clone(),
            partition_id: self.config.partition_id,
            h_fault: msg.h_fault,
        })
    }

    pub(super) fn on_repair(&mut self, msg: RepairMessage) -> SchedulerOutput {
        let mut output = SchedulerOutput::empty();
        if let Some(t) = msg.inner.txn_id() {
            if let Some(h) = self.inner_handle(&msg.inner) {
                if self.counters.contains(t, h) {
                    return output.with_fault(SchedulerFault::RepairAlreadyPresent { t, h });
                }
            }
        }
        if msg.needs_repair.contains(&self.config.site_id) {
            output = output.with_outbound(Envelope::targeted(
                self.config.site_id,
                self.config.site_id,
                *msg.inner.clone(),
            ));
        }
        let remaining: Vec<SiteId> = msg
            .needs_repair
            .iter()
            .copied()
            .filter(|r| *r != self.config.site_id)
            .collect();
        if !remaining.is_empty() {
            output = output.with_outbound(Envelope::broadcast(
                self.config.site_id,
                MessagePayload::Repair(RepairMessage {
                    needs_repair: remaining,
                    inner: msg.inner,
                }),
            ));
        }
        output
    }

    fn inner_handle(&self, payload: &MessagePayload) -> Option<SpHandle> {
        match payload {
            MessagePayload::InitiateResponse(m) => Some(m.h),
            MessagePayload::FragmentResponse(m) => Some(m.h),
            MessagePayload::CompleteTransactionResponse(m) => Some(m.h),
            _ => None,
        }
    }
}
