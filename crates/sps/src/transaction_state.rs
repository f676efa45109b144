//! Per-`T` transaction state (§3 DATA MODEL).

use sps_types::{SpHandle, TxnId};

use crate::message::MessagePayload;

/// What kind of transaction this state tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    SpWrite,
    SpRead,
    MpParticipant,
    MpBorrow,
    Dummy,
}

/// State kept for one outstanding `T`, from creation on its first message
/// until the final response is aggregated and it is marked done (or, for a
/// read-only MP transaction, at the end of its final fragment).
#[derive(Debug, Clone)]
pub struct TransactionState {
    pub t: TxnId,
    pub kind: TransactionKind,
    pub first_handle: SpHandle,
    pub read_only: bool,
    pub done: bool,
    /// The message that created this state, kept for diagnostics.
    pub originating: MessagePayload,
}

impl TransactionState {
    pub fn new(
        t: TxnId,
        kind: TransactionKind,
        first_handle: SpHandle,
        read_only: bool,
        originating: MessagePayload,
    ) -> Self {
        Self {
            t,
            kind,
            first_handle,
            read_only,
            done: false,
            originating,
        }
    }

    pub fn mark_done(&mut self) {
        self.done = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DummyTransactionTask, MessagePayload};

    #[test]
    fn mark_done_sets_flag() {
        let mut state = TransactionState::new(
            TxnId::new(1),
            TransactionKind::SpWrite,
            SpHandle::new(1),
            false,
            MessagePayload::DummyTransactionTask(DummyTransactionTask {
                t: TxnId::new(1),
                h: SpHandle::new(1),
            }),
        );
        assert!(!state.done);
        state.mark_done();
        assert!(state.done);
    }
}
