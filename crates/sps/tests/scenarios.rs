//! End-to-end scenarios driving `SpScheduler` through its public
//! `process()` entry point, one per concrete case in the design notes.

use sps::message::{
    CompleteTransactionMessage, Envelope, FragmentTask, InitiateResponse, InitiateTask,
    MessagePayload, ReadConsistency, ReplicaStatus,
};
use sps::scheduler::{SchedulerConfig, SchedulerEvent, SpScheduler};
use sps_types::{PartitionId, ResultHash, SiteId, SpHandle, TxnId, UniqueId};

fn site(id: u64) -> SiteId {
    SiteId::new(id)
}

fn hash(byte: u8) -> ResultHash {
    ResultHash::from_bytes([byte; sps_types::RESULT_HASH_LENGTH])
}

fn leader_with_one_peer() -> SpScheduler {
    let s = SpScheduler::new(SchedulerConfig {
        site_id: site(1),
        partition_id: PartitionId::new(0),
        command_log_synchronous: false,
    });
    let (s, _) = s.process(SchedulerEvent::SetLeaderState(true));
    let (s, _) = s.process(SchedulerEvent::UpdateReplicas {
        replicas: vec![site(1), site(2)],
    });
    s
}

fn write_task(t: u64, client: u64) -> InitiateTask {
    InitiateTask {
        initiator_id: site(client),
        coordinator_id: site(client),
        trunc_handle: SpHandle::ZERO,
        h: SpHandle::ZERO,
        t: TxnId::new(t),
        u: UniqueId::ZERO,
        read_only: false,
        consistency: ReadConsistency::Fast,
        single_part: true,
        ci_handle: 0,
        conn_id: 0,
        for_replay: false,
        is_replica_copy: false,
    }
}

/// Scenario 1: SP write, k=2. Both replicas answer with the same hash; the
/// counter reaches DONE, the response is forwarded, and `tau` advances.
#[test]
fn sp_write_k2_reaches_done_and_advances_tau() {
    let s = leader_with_one_peer();
    let (mut s, out) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(9),
        site(1),
        MessagePayload::InitiateTask(write_task(0, 9)),
    )));

    assert_eq!(out.outbound.len(), 1, "replica-copy multicast to the peer");
    assert_eq!(out.tasks.len(), 1);
    let stamped_t = out.tasks[0]
        .envelope
        .txn_id()
        .expect("initiate task carries a txn id");
    let h = match &out.tasks[0].envelope.payload {
        MessagePayload::InitiateTask(t) => t.h,
        _ => panic!("expected an InitiateTask"),
    };
    assert_eq!(s.open_counter_count(), 1);

    let (s2, out1) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(1),
        site(1),
        MessagePayload::InitiateResponse(InitiateResponse {
            t: stamped_t,
            h,
            source_id: site(1),
            initiator_id: site(9),
            ci_handle: 0,
            read_only: false,
            status: ReplicaStatus::Success,
            hash: hash(0xAB),
            hashes: vec![hash(0xAB)],
            results: vec![0xAB],
        }),
    )));
    s = s2;
    assert!(out1.outbound.is_empty(), "still waiting on the peer");
    assert_eq!(s.open_counter_count(), 1);

    let (s3, out2) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(2),
        site(1),
        MessagePayload::InitiateResponse(InitiateResponse {
            t: stamped_t,
            h,
            source_id: site(2),
            initiator_id: site(9),
            ci_handle: 0,
            read_only: false,
            status: ReplicaStatus::Success,
            hash: hash(0xAB),
            hashes: vec![hash(0xAB)],
            results: vec![0xAB],
        }),
    )));
    s = s3;

    assert_eq!(s.open_counter_count(), 0, "counter finalized");
    assert_eq!(s.tau(), h, "truncation handle advanced to H");
    assert!(out2.fault.is_none());
    assert_eq!(out2.outbound.len(), 1);
    match &out2.outbound[0].payload {
        MessagePayload::InitiateResponse(r) => assert_eq!(r.initiator_id, site(9)),
        other => panic!("expected InitiateResponse, got {}", other.name()),
    }
}

/// Scenario 2: replica responses diverge in hash. The counter reports
/// MISMATCH, a dump-plan is broadcast to the peer, and the scheduler
/// surfaces a `SchedulerFault`.
#[test]
fn hash_mismatch_is_cluster_fatal() {
    let s = leader_with_one_peer();
    let (mut s, out) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(9),
        site(1),
        MessagePayload::InitiateTask(write_task(0, 9)),
    )));
    let stamped_t = out.tasks[0].envelope.txn_id().unwrap();
    let h = match &out.tasks[0].envelope.payload {
        MessagePayload::InitiateTask(t) => t.h,
        _ => unreachable!(),
    };

    let (s2, _) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(1),
        site(1),
        MessagePayload::InitiateResponse(InitiateResponse {
            t: stamped_t,
            h,
            source_id: site(1),
            initiator_id: site(9),
            ci_handle: 0,
            read_only: false,
            status: ReplicaStatus::Success,
            hash: hash(0xAB),
            hashes: vec![hash(0xAB)],
            results: vec![0xAB],
        }),
    )));
    s = s2;

    let (s3, out2) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(2),
        site(1),
        MessagePayload::InitiateResponse(InitiateResponse {
            t: stamped_t,
            h,
            source_id: site(2),
            initiator_id: site(9),
            ci_handle: 0,
            read_only: false,
            status: ReplicaStatus::Success,
            hash: hash(0xDE),
            hashes: vec![hash(0xDE)],
            results: vec![0xDE],
        }),
    )));
    s = s3;

    assert!(matches!(
        out2.fault,
        Some(sps::SchedulerFault::HashMismatch { .. })
    ));
    assert_eq!(out2.outbound.len(), 1, "dump-plan sent to the peer");
    assert!(matches!(
        out2.outbound[0].payload,
        MessagePayload::DumpPlanThenExit(_)
    ));
    assert_eq!(s.open_counter_count(), 0, "counter removed on divergence");
}

/// Scenario 3: a replay stream redelivers the same unique-id. The second
/// delivery is detected as a duplicate before it ever reaches dispatch.
#[test]
fn replay_stream_dedupes_repeated_unique_id() {
    let s = SpScheduler::new(SchedulerConfig {
        site_id: site(1),
        partition_id: PartitionId::new(0),
        command_log_synchronous: false,
    });
    let (mut s, _) = s.process(SchedulerEvent::SetLeaderState(true));

    let u = UniqueId::new(42);
    assert!(!s.replay_dedupe(u));
    s.replay_offer(u, MessagePayload::InitiateTask(write_task(0, 9)));

    // Redelivery of the same unique-id: the host must not dispatch it.
    assert!(s.replay_dedupe(u));
    let drained = s.replay_drain();
    assert_eq!(drained.len(), 1, "only one task was ever accepted");
}

/// Scenario 4: a SAFE read submitted while a write is still outstanding is
/// held in the buffered-read log and only released once `tau` catches up.
#[test]
fn safe_read_waits_for_tau_to_catch_up() {
    let s = leader_with_one_peer();
    let (mut s, write_out) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(9),
        site(1),
        MessagePayload::InitiateTask(write_task(0, 9)),
    )));
    let write_t = write_out.tasks[0].envelope.txn_id().unwrap();
    let write_h = match &write_out.tasks[0].envelope.payload {
        MessagePayload::InitiateTask(t) => t.h,
        _ => unreachable!(),
    };

    let read = InitiateTask {
        initiator_id: site(9),
        coordinator_id: site(9),
        trunc_handle: SpHandle::ZERO,
        h: SpHandle::ZERO,
        t: TxnId::new(201),
        u: UniqueId::ZERO,
        read_only: true,
        consistency: ReadConsistency::Safe,
        single_part: true,
        ci_handle: 0,
        conn_id: 0,
        for_replay: false,
        is_replica_copy: false,
    };
    let (s2, read_out) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(9),
        site(1),
        MessagePayload::InitiateTask(read),
    )));
    s = s2;
    let read_h = match &read_out.tasks[0].envelope.payload {
        MessagePayload::InitiateTask(t) => t.h,
        _ => unreachable!(),
    };

    let (s3, read_resp_out) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(1),
        site(1),
        MessagePayload::InitiateResponse(InitiateResponse {
            t: TxnId::new(201),
            h: read_h,
            source_id: site(1),
            initiator_id: site(9),
            ci_handle: 0,
            read_only: true,
            status: ReplicaStatus::Success,
            hash: hash(0x11),
            hashes: vec![hash(0x11)],
            results: vec![0x11],
        }),
    )));
    s = s3;
    assert!(
        read_resp_out.outbound.is_empty(),
        "SAFE read held until tau advances"
    );

    let (s4, offer1) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(1),
        site(1),
        MessagePayload::InitiateResponse(InitiateResponse {
            t: write_t,
            h: write_h,
            source_id: site(1),
            initiator_id: site(9),
            ci_handle: 0,
            read_only: false,
            status: ReplicaStatus::Success,
            hash: hash(0xAB),
            hashes: vec![hash(0xAB)],
            results: vec![0xAB],
        }),
    )));
    s = s4;
    assert!(offer1.outbound.is_empty());

    let (s5, offer2) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(2),
        site(1),
        MessagePayload::InitiateResponse(InitiateResponse {
            t: write_t,
            h: write_h,
            source_id: site(2),
            initiator_id: site(9),
            ci_handle: 0,
            read_only: false,
            status: ReplicaStatus::Success,
            hash: hash(0xAB),
            hashes: vec![hash(0xAB)],
            results: vec![0xAB],
        }),
    )));
    s = s5;

    let read_released = offer2.outbound.iter().any(|e| {
        matches!(&e.payload, MessagePayload::InitiateResponse(r) if r.read_only && r.t == TxnId::new(201))
    });
    assert!(read_released, "SAFE read released once tau >= its gate");
    let _ = s;
}

/// Scenario 5: the outgoing leader's balance checkpoint blocks until every
/// counter that predates it has drained.
#[test]
fn balance_checkpoint_drains_in_order() {
    let mut s = leader_with_one_peer();

    let (s1, out1) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(9),
        site(1),
        MessagePayload::InitiateTask(write_task(0, 9)),
    )));
    s = s1;
    let t1 = out1.tasks[0].envelope.txn_id().unwrap();
    let h1 = match &out1.tasks[0].envelope.payload {
        MessagePayload::InitiateTask(t) => t.h,
        _ => unreachable!(),
    };

    let (s2, out2) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(9),
        site(1),
        MessagePayload::InitiateTask(write_task(0, 9)),
    )));
    s = s2;
    let _h2 = match &out2.tasks[0].envelope.payload {
        MessagePayload::InitiateTask(t) => t.h,
        _ => unreachable!(),
    };

    s.checkpoint_balance();
    assert!(
        !s.txn_done_before_checkpoint(),
        "a counter older than H_cp is still open"
    );

    // Resolve the older counter (h1); it predates H_cp and must drain. Both
    // expected replicas must answer before the counter reaches DONE.
    let (s3, _) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(1),
        site(1),
        MessagePayload::InitiateResponse(InitiateResponse {
            t: t1,
            h: h1,
            source_id: site(1),
            initiator_id: site(9),
            ci_handle: 0,
            read_only: false,
            status: ReplicaStatus::Success,
            hash: hash(0xAB),
            hashes: vec![hash(0xAB)],
            results: vec![0xAB],
        }),
    )));
    s = s3;
    let (s3b, _) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(2),
        site(1),
        MessagePayload::InitiateResponse(InitiateResponse {
            t: t1,
            h: h1,
            source_id: site(2),
            initiator_id: site(9),
            ci_handle: 0,
            read_only: false,
            status: ReplicaStatus::Success,
            hash: hash(0xAB),
            hashes: vec![hash(0xAB)],
            results: vec![0xAB],
        }),
    )));
    s = s3b;

    assert!(
        s.txn_done_before_checkpoint(),
        "no remaining counter predates H_cp"
    );
    assert!(s.balance_checkpoint().is_none(), "checkpoint reset once satisfied");
}

/// Scenario 6: under synchronous command logging, a second fragment and the
/// complete-transaction message for the same `T` queue behind the
/// MP-durability gate and drain together, in arrival order, once the first
/// fragment's durability callback fires.
#[test]
fn mp_durability_gate_queues_behind_first_fragment() {
    let s = SpScheduler::new(SchedulerConfig {
        site_id: site(1),
        partition_id: PartitionId::new(0),
        command_log_synchronous: true,
    });
    let (mut s, _) = s.process(SchedulerEvent::SetLeaderState(true));
    let (s2, _) = s.process(SchedulerEvent::UpdateReplicas {
        replicas: vec![site(1)],
    });
    s = s2;

    let t = TxnId::new(900);
    let fragment1 = FragmentTask {
        initiator_id: site(9),
        coordinator_id: site(9),
        t,
        h: SpHandle::ZERO,
        involved_partitions: vec![],
        sys_proc: false,
        read_only: false,
        is_final: false,
        is_replica_copy: false,
        to_replica: false,
        handled_by_original_leader: false,
    };
    let (s3, out1) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(9),
        site(1),
        MessagePayload::FragmentTask(fragment1),
    )));
    s = s3;
    assert_eq!(out1.tasks.len(), 1, "first fragment dispatches immediately");
    assert_eq!(out1.log_records.len(), 1);

    let fragment2 = FragmentTask {
        initiator_id: site(9),
        coordinator_id: site(9),
        t,
        h: SpHandle::ZERO,
        involved_partitions: vec![],
        sys_proc: false,
        read_only: false,
        is_final: true,
        is_replica_copy: false,
        to_replica: false,
        handled_by_original_leader: false,
    };
    let (s4, out2) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(9),
        site(1),
        MessagePayload::FragmentTask(fragment2),
    )));
    s = s4;
    assert!(out2.tasks.is_empty(), "second fragment queued behind the gate");

    let complete = CompleteTransactionMessage {
        t,
        h: SpHandle::ZERO,
        coordinator_id: site(9),
        to_leader: false,
        restart: false,
        read_only: false,
        ack_requested: false,
    };
    let (s5, out3) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(9),
        site(1),
        MessagePayload::CompleteTransactionMessage(complete),
    )));
    s = s5;
    assert!(out3.tasks.is_empty(), "complete message queued behind the gate too");

    let (s6, out4) = s.process(SchedulerEvent::DurabilityComplete {
        t,
        ticket: sps::collaborators::DurabilityTicket::new(1),
    });
    assert_eq!(
        out4.tasks.len(),
        2,
        "both queued tasks drain in arrival order"
    );
    match &out4.tasks[0].envelope.payload {
        MessagePayload::FragmentTask(f) => assert!(f.is_final),
        other => panic!("expected the second fragment first, got {}", other.name()),
    }
    match &out4.tasks[1].envelope.payload {
        MessagePayload::CompleteTransactionMessage(_) => {}
        other => panic!("expected the complete-transaction message second, got {}", other.name()),
    }
    assert_eq!(s6.open_counter_count(), 0);
}

/// Scenario 7: a replica promoted to leader resumes handle generation past
/// the highest handle it observed as a replica, never reissuing one already
/// in use.
#[test]
fn promoted_replica_resumes_past_highest_observed_handle() {
    let s = SpScheduler::new(SchedulerConfig {
        site_id: site(2),
        partition_id: PartitionId::new(0),
        command_log_synchronous: false,
    });

    let replica_copy = InitiateTask {
        initiator_id: site(9),
        coordinator_id: site(9),
        trunc_handle: SpHandle::ZERO,
        h: SpHandle::new(500),
        t: TxnId::new(500),
        u: UniqueId::new(500),
        read_only: false,
        consistency: ReadConsistency::Fast,
        single_part: true,
        ci_handle: 0,
        conn_id: 0,
        for_replay: false,
        is_replica_copy: true,
    };
    let (s, _) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(1),
        site(2),
        MessagePayload::InitiateTask(replica_copy),
    )));

    let (s, _) = s.process(SchedulerEvent::SetLeaderState(true));
    let (_, out) = s.process(SchedulerEvent::Message(Envelope::targeted(
        site(9),
        site(2),
        MessagePayload::InitiateTask(write_task(0, 9)),
    )));
    let new_h = match &out.tasks[0].envelope.payload {
        MessagePayload::InitiateTask(t) => t.h,
        _ => unreachable!(),
    };
    assert!(
        new_h > SpHandle::new(500),
        "newly promoted leader must not reissue a handle already seen as a replica"
    );
}
