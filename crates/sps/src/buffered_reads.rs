//! `BufferedReadLog` — holds SAFE reads until their gate sp-handle is
//! reached by the truncation handle. Leader-only.

use std::collections::VecDeque;

use sps_types::{ResultHash, SiteId, SpHandle, TxnId};

/// A SAFE read response waiting for `τ` to reach its gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedRead {
    pub gate: SpHandle,
    pub t: TxnId,
    pub destination: SiteId,
    pub hash: ResultHash,
    pub hashes: Vec<ResultHash>,
    pub results: Vec<u8>,
}

/// FIFO of pending SAFE read responses. A single-partition read is gated on
/// the `τ` observed at enqueue time; an MP read is gated on the
/// transaction's first sp-handle instead, so its release only depends on
/// that specific prior write having committed.
#[derive(Debug, Clone, Default)]
pub struct BufferedReadLog {
    queue: VecDeque<BufferedRead>,
}

impl BufferedReadLog {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, read: BufferedRead) {
        self.queue.push_back(read);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Dequeues every entry whose gate is `<= tau`, in FIFO order, stopping
    /// at the first entry still gated — entries are enqueued in arrival
    /// order and gates are non-decreasing with `τ`, so nothing later in the
    /// queue can release before an earlier ungated entry.
    pub fn release(&mut self, tau: SpHandle) -> Vec<BufferedRead> {
        let mut released = Vec::new();
        while let Some(front) = self.queue.front() {
            if front.gate <= tau {
                released.push(self.queue.pop_front().expect("front just peeked"));
            } else {
                break;
            }
        }
        released
    }
}
