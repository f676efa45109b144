//! Replica role transitions and the balance-leader checkpoint (§4.7).

use sps_types::{SiteId, SpHandle};
use tracing::info;

use crate::collaborators::CommandLogRecord;
use crate::duplicate_counter::{AggregatedResponse, CounterOpener};
use crate::message::{
    CompleteTransactionResponse, Envelope, FragmentResponse, InitiateResponse, MessagePayload,
    RepairLogTruncationMessage, ReplicaStatus,
};

use super::{SchedulerOutput, SpScheduler};

impl SpScheduler {
    pub(super) fn on_set_leader_state(&mut self, is_leader: bool) -> SchedulerOutput {
        if is_leader == self.is_leader {
            return SchedulerOutput::empty();
        }
        self.is_leader = is_leader;
        if is_leader {
            // A newly promoted leader may have only ever observed handles
            // via replica-copies, never generated one itself; resume the
            // generator past the highest it has seen so it never reissues
            // an already-used H.
            self.allocator.advance_to(self.allocator.max_seen());
            info!(site = %self.config.site_id, "entering leader role");
        } else {
            info!(site = %self.config.site_id, "entering follower role");
            self.balance_checkpoint = None;
        }
        SchedulerOutput::empty()
    }

    /// `updateReplicas(replicas, partitionMasters)`: recompute `sendTo`,
    /// drain `DONE` counters in ascending `(T, H)` order, forward their
    /// aggregated responses, and write a viable-replay fault-log entry.
    pub(super) fn on_update_replicas(&mut self, replicas: Vec<SiteId>) -> SchedulerOutput {
        self.replicas = replicas;
        self.replica_set_version = self.replica_set_version.next();

        let done = self.counters.update_all_replicas(&self.replicas);
        let mut output = SchedulerOutput::empty();
        for aggregated in &done {
            output = self.forward_aggregated(output, aggregated);
        }

        if self.writing_fault_log_enabled {
            output = output.with_log_record(CommandLogRecord::ViableReplayFault {
                leader_site_id: self.config.site_id,
                replica_set: self.replicas.clone(),
                partition_id: self.config.partition_id,
                h_fault: self.allocator.max_seen(),
            });
        }

        output
    }

    /// Rebuilds the message class that originally opened the drained
    /// counter so the MP coordinator (or client) receives a response it can
    /// correlate to its outstanding request.
    fn forward_aggregated(
        &self,
        output: SchedulerOutput,
        aggregated: &AggregatedResponse,
    ) -> SchedulerOutput {
        let payload = match &aggregated.opener {
            CounterOpener::Initiate => MessagePayload::InitiateResponse(InitiateResponse {
                t: aggregated.t,
                h: aggregated.h,
                source_id: self.config.site_id,
                initiator_id: aggregated.destination,
                ci_handle: 0,
                read_only: false,
                status: aggregated.status,
                hash: aggregated.hash,
                hashes: aggregated.hashes.clone(),
                results: aggregated.results.clone(),
            }),
            CounterOpener::Fragment => MessagePayload::FragmentResponse(FragmentResponse {
                t: aggregated.t,
                h: aggregated.h,
                source_id: self.config.site_id,
                dest_id: aggregated.destination,
                status: aggregated.status,
                hash: aggregated.hash,
                misrouted_to: None,
            }),
            CounterOpener::CompleteTransaction { .. } => {
                MessagePayload::CompleteTransactionResponse(CompleteTransactionResponse {
                    t: aggregated.t,
                    h: aggregated.h,
                    restart: aggregated.status == ReplicaStatus::Aborted,
                    ack_requested: false,
                    spi_id: self.config.site_id,
                })
            }
            CounterOpener::Repair => {
                info!(
                    t = %aggregated.t,
                    h = %aggregated.h,
                    "membership change drained a repair-opened counter with no forwardable response"
                );
                return output;
            }
        };
        output.with_outbound(Envelope::targeted(
            self.config.site_id,
            aggregated.destination,
            payload,
        ))
    }

    /// Records `H_cp := maxScheduledH`, invoked by the outgoing leader
    /// during a balance-leader migration.
    pub fn checkpoint_balance(&mut self) {
        let h_cp = self.allocator.max_scheduled();
        self.balance_checkpoint = Some(h_cp);
        info!(h_cp = %h_cp, "balance-leader checkpoint recorded");
    }

    /// True iff no duplicate counter exists with key `{·, H < H_cp}` — the
    /// signal that in-flight work under the old leader has drained and may
    /// now be replayed by the new leader. Resets the internal checkpoint
    /// once satisfied.
    pub fn txn_done_before_checkpoint(&mut self) -> bool {
        let Some(h_cp) = self.balance_checkpoint else {
            return true;
        };
        let blocked = self.counters.iter_handles().any(|h| h < h_cp);
        if !blocked {
            self.balance_checkpoint = None;
        }
        !blocked
    }

    pub fn balance_checkpoint(&self) -> Option<SpHandle> {
        self.balance_checkpoint
    }

    pub(super) fn on_repair_log_truncation(
        &mut self,
        msg: RepairLogTruncationMessage,
    ) -> SchedulerOutput {
        self.truncation.advance(msg.tau, !self.is_leader);
        SchedulerOutput::empty()
    }
}
