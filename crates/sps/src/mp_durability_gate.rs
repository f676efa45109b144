//! `MpDurabilityGate` — queues follow-up MP fragments while the first
//! fragment of a transaction awaits synchronous command-log durability.

use std::collections::{HashMap, VecDeque};

use sps_types::TxnId;

/// Maps `T -> queue<Task>`. An entry exists only while `T`'s first fragment
/// is synchronously logged and not yet durable; everything offered for that
/// `T` in the meantime queues here instead of going straight to the task
/// queue.
#[derive(Debug, Clone, Default)]
pub struct MpDurabilityGate<Task> {
    pending: HashMap<TxnId, VecDeque<Task>>,
}

impl<Task> MpDurabilityGate<Task> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Opens a gate for `t`, called when the first fragment's log append
    /// does not complete synchronously.
    pub fn open(&mut self, t: TxnId) {
        self.pending.entry(t).or_default();
    }

    pub fn is_open(&self, t: TxnId) -> bool {
        self.pending.contains_key(&t)
    }

    /// Enqueues `task` behind the gate for `t`. Caller must have checked
    /// [`Self::is_open`] first; opening implicitly on enqueue would hide a
    /// durability race where a fragment for an unopened `T` bypasses the
    /// gate entirely.
    pub fn enqueue(&mut self, t: TxnId, task: Task) {
        self.pending
            .entry(t)
            .or_default()
            .push_back(task);
    }

    /// Drains every task queued for `t`, in arrival order, and closes the
    /// gate. Called from the durability callback.
    pub fn drain(&mut self, t: TxnId) -> Vec<Task> {
        self.pending
            .remove(&t)
            .map(|queue| queue.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn open_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_drain_in_arrival_order() {
        let mut gate: MpDurabilityGate<u32> = MpDurabilityGate::new();
        let t = TxnId::new(900);
        gate.open(t);
        gate.enqueue(t, 1);
        gate.enqueue(t, 2);
        assert_eq!(gate.drain(t), vec![1, 2]);
        assert!(!gate.is_open(t));
    }

    #[test]
    fn draining_unopened_gate_yields_empty() {
        let mut gate: MpDurabilityGate<u32> = MpDurabilityGate::new();
        assert!(gate.drain(TxnId::new(1)).is_empty());
    }
}
