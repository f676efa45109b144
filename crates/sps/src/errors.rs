//! Error taxonomy.
//!
//! Follows the propagation policy: anything that threatens linearizability
//! or replica identity escalates to [`SchedulerFault`]; resource-level
//! transients are absorbed locally with structured logging via `tracing`
//! and never surfaced as an `Err`; client-visible failures are ordinary
//! response messages, not errors at all.

use sps_types::{SiteId, SpHandle, TxnId};
use thiserror::Error;

/// A condition that requires the local node to stop processing and
/// terminate. The scheduler never calls into the process directly; it
/// returns this from `process()` and the host is responsible for acting on
/// it (broadcasting a dump-plan, then exiting).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerFault {
    /// Replica responses for `{t, h}` diverged in result hash.
    #[error("hash mismatch for {t}/{h}: replica {replica} disagreed")]
    HashMismatch {
        t: TxnId,
        h: SpHandle,
        replica: SiteId,
    },

    /// One replica succeeded and another rolled back the same operation.
    #[error("partial abort for {t}/{h}: replica {replica} aborted")]
    PartialAbort {
        t: TxnId,
        h: SpHandle,
        replica: SiteId,
    },

    /// Two duplicate counters were opened for the same `{T, H}` without a
    /// balance-leader migration to explain it.
    #[error("duplicate-counter collision at {t}/{h} not attributable to leader migration")]
    CounterCollision { t: TxnId, h: SpHandle },

    /// A multi-partition initiate was routed to the single-partition
    /// scheduler.
    #[error("multi-partition initiate {t} routed to single-partition scheduler")]
    MisroutedMultiPartitionInitiate { t: TxnId },

    /// A repair message targeted a fragment this site already has.
    #[error("repair requested for {t}/{h} which is already present")]
    RepairAlreadyPresent { t: TxnId, h: SpHandle },
}

/// Errors surfaced while looking up a single transaction's state. Not a
/// `SchedulerFault`: a missing `T` is not cluster-fatal, just a lookup the
/// caller asked for and didn't get (e.g. a stale handle after rejoin).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("no transaction state for {0}")]
    Unknown(TxnId),
}
