//! # sps: the Single-Partition Scheduler
//!
//! One `SpScheduler` runs per partition replica of a replicated, partitioned
//! OLTP database. It assigns a monotonic per-partition sequence number (the
//! sp-handle) to each transaction, fans writes out to k-safety replicas and
//! compares their responses for determinism, integrates with an
//! asynchronous command log, participates as a non-coordinating site in
//! multi-partition transactions, enforces FAST and SAFE read consistency,
//! and drains cleanly across a leader migration.
//!
//! The scheduler itself performs no I/O: [`scheduler::SpScheduler::process`]
//! takes an event and returns `(Self, SchedulerOutput)`, where
//! `SchedulerOutput` is the list of messages, execution tasks, and
//! command-log records the host must carry out. The execution engine,
//! command log, mailbox, and membership service are referenced only
//! through the traits in [`collaborators`].

pub mod allocator;
pub mod buffered_reads;
pub mod collaborators;
pub mod duplicate_counter;
pub mod errors;
pub mod instrumentation;
pub mod message;
pub mod mp_durability_gate;
pub mod replay_sequencer;
pub mod scheduler;
pub mod transaction_state;
pub mod truncation;

pub use errors::{SchedulerFault, TransactionError};
pub use scheduler::{SchedulerConfig, SchedulerEvent, SchedulerOutput, SpScheduler};
