//! `DuplicateCounter` — the determinism arbiter.
//!
//! One counter exists per `{T, H}` for a replicated operation (invariant 1).
//! It collects a response from each expected replica, demands identical
//! result hashes (and for writes, identical success/abort status), and
//! resolves to `DONE` once the full expected set has answered.
//!
//! The ordered-drain requirement in `updateReplicas` (finalize DONE counters
//! in `T` then `H` order so response ordering per destination is preserved)
//! is met by [`DuplicateCounterIndex`], which keeps a random-access map
//! keyed by `{T, H}` alongside a `BTreeSet` ordered by `(T, H)` — mirroring
//! the two-container approach a `BinaryHeap`-based eviction index would use,
//! adapted here to a set since counters can be removed from the middle.

use std::collections::{BTreeSet, HashMap, HashSet};

use sps_types::{ResultHash, SiteId, TxnId};
use tracing::warn;

use crate::message::{CompleteTransactionMessage, ReplicaStatus};
use sps_types::SpHandle;

/// Outcome of [`DuplicateCounter::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Still waiting on one or more expected replicas.
    Waiting,
    /// All expected replicas answered with matching hash and status.
    Done,
    /// Replicas answered with differing result hashes.
    Mismatch,
    /// One replica succeeded and another rolled back.
    Abort,
}

/// Outcome of [`DuplicateCounter::update_replicas`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReplicasOutcome {
    /// Still waiting on the (possibly shrunk) expected set.
    Continue,
    /// The remaining expected set is already fully satisfied.
    Done,
}

/// A single replica's answer, normalized from whichever concrete response
/// message (`InitiateResponse`, `FragmentResponse`, `CompleteTransactionResponse`)
/// opened this comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaResponse {
    pub source: SiteId,
    pub hash: ResultHash,
    /// Per-statement hash vector, when the opening message carries one
    /// (`InitiateResponse`); empty otherwise.
    pub hashes: Vec<ResultHash>,
    /// The procedure's return payload, when the opening message carries one;
    /// empty otherwise.
    pub results: Vec<u8>,
    pub status: ReplicaStatus,
}

/// The message class that opened a counter, kept for diagnostics and for the
/// balance-leader tie-break rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterOpener {
    Initiate,
    Fragment,
    CompleteTransaction { coordinator_id: SiteId },
    Repair,
}

/// A response aggregated and forwarded once a counter reaches `DONE`. Carries
/// the opener so the caller can rebuild the right message class to forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedResponse {
    pub t: TxnId,
    pub h: SpHandle,
    pub hash: ResultHash,
    pub hashes: Vec<ResultHash>,
    pub results: Vec<u8>,
    pub status: ReplicaStatus,
    pub destination: SiteId,
    pub opener: CounterOpener,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateCounter {
    t: TxnId,
    h: SpHandle,
    expected: Vec<SiteId>,
    responded: HashSet<SiteId>,
    first_hash: Option<ResultHash>,
    first_hashes: Vec<ResultHash>,
    first_results: Vec<u8>,
    first_status: Option<ReplicaStatus>,
    destination: SiteId,
    opener: CounterOpener,
}

impl DuplicateCounter {
    pub fn new(
        t: TxnId,
        h: SpHandle,
        expected: Vec<SiteId>,
        destination: SiteId,
        opener: CounterOpener,
    ) -> Self {
        Self {
            t,
            h,
            expected,
            responded: HashSet::new(),
            first_hash: None,
            first_hashes: Vec::new(),
            first_results: Vec::new(),
            first_status: None,
            destination,
            opener,
        }
    }

    pub fn t(&self) -> TxnId {
        self.t
    }

    pub fn h(&self) -> SpHandle {
        self.h
    }

    pub fn destination(&self) -> SiteId {
        self.destination
    }

    pub fn opener(&self) -> &CounterOpener {
        &self.opener
    }

    fn is_satisfied(&self) -> bool {
        self.expected.iter().all(|r| self.responded.contains(r))
    }

    /// Records a response from one replica. The first response seen fixes
    /// the expected hash and status for everyone after it.
    pub fn offer(&mut self, response: ReplicaResponse) -> OfferOutcome {
        match (self.first_hash, self.first_status) {
            (None, None) => {
                self.first_hash = Some(response.hash);
                self.first_hashes = response.hashes.clone();
                self.first_results = response.results.clone();
                self.first_status = Some(response.status);
            }
            (Some(hash), Some(status)) => {
                if status != response.status {
                    return OfferOutcome::Abort;
                }
                if hash != response.hash {
                    return OfferOutcome::Mismatch;
                }
            }
            _ => unreachable!("first_hash and first_status are always set together"),
        }

        self.responded.insert(response.source);

        if self.is_satisfied() {
            OfferOutcome::Done
        } else {
            OfferOutcome::Waiting
        }
    }

    /// Called on membership change: replicas that disappeared are removed
    /// from the expected set.
    pub fn update_replicas(&mut self, current_replicas: &[SiteId]) -> UpdateReplicasOutcome {
        let current: HashSet<SiteId> = current_replicas.iter().copied().collect();
        let before = self.expected.len();
        self.expected.retain(|r| current.contains(r));
        if self.expected.len() < before && self.responded.is_empty() {
            warn!(t = %self.t, h = %self.h, "duplicate counter lost replicas before any response arrived");
        }
        self.responded.retain(|r| current.contains(r));

        if self.is_satisfied() {
            UpdateReplicasOutcome::Done
        } else {
            UpdateReplicasOutcome::Continue
        }
    }

    /// The canonical response to forward once `DONE` is reached.
    pub fn aggregated(&self) -> Option<AggregatedResponse> {
        let hash = self.first_hash?;
        let status = self.first_status?;
        Some(AggregatedResponse {
            t: self.t,
            h: self.h,
            hash,
            hashes: self.first_hashes.clone(),
            results: self.first_results.clone(),
            status,
            destination: self.destination,
            opener: self.opener.clone(),
        })
    }
}

/// Whether two counters are allowed to collide on the same `{T, H}` key —
/// only when both openers are complete-transaction messages from distinct
/// coordinators (a legal artifact of leader migration).
pub fn collision_permitted(
    existing: &CounterOpener,
    incoming_coordinator: SiteId,
) -> bool {
    matches!(
        existing,
        CounterOpener::CompleteTransaction { coordinator_id } if *coordinator_id != incoming_coordinator
    )
}

/// Helper for classifying whether an incoming [`CompleteTransactionMessage`]
/// is permitted to open a second counter at a key already in use.
pub fn complete_transaction_opener(msg: &CompleteTransactionMessage) -> CounterOpener {
    CounterOpener::CompleteTransaction {
        coordinator_id: msg.coordinator_id,
    }
}

/// Random-access-by-key plus ordered-by-`(T, H)` index over live counters,
/// so `updateReplicas` can finalize `DONE` counters in ascending `T, H`
/// order without a linear sort on every membership change.
#[derive(Debug, Clone, Default)]
pub struct DuplicateCounterIndex {
    by_key: HashMap<(TxnId, SpHandle), DuplicateCounter>,
    ordered: BTreeSet<(TxnId, SpHandle)>,
}

impl DuplicateCounterIndex {
    pub fn new() -> Self {
        Self {
            by_key: HashMap::new(),
            ordered: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn get(&self, t: TxnId, h: SpHandle) -> Option<&DuplicateCounter> {
        self.by_key.get(&(t, h))
    }

    pub fn get_mut(&mut self, t: TxnId, h: SpHandle) -> Option<&mut DuplicateCounter> {
        self.by_key.get_mut(&(t, h))
    }

    pub fn contains(&self, t: TxnId, h: SpHandle) -> bool {
        self.by_key.contains_key(&(t, h))
    }

    /// Iterates the `H` component of every live counter's key, used by the
    /// balance-leader checkpoint to test whether any counter still predates
    /// `H_cp`.
    pub fn iter_handles(&self) -> impl Iterator<Item = SpHandle> + '_ {
        self.by_key.keys().map(|(_, h)| *h)
    }

    /// Inserts a counter. Returns `Err` (with the rejected counter) if the
    /// key is already occupied and the collision is not permitted by the
    /// balance-leader tie-break rule.
    pub fn insert(&mut self, counter: DuplicateCounter) -> Result<(), DuplicateCounter> {
        let key = (counter.t, counter.h);
        if self.by_key.contains_key(&key) {
            return Err(counter);
        }
        self.ordered.insert(key);
        self.by_key.insert(key, counter);
        Ok(())
    }

    pub fn remove(&mut self, t: TxnId, h: SpHandle) -> Option<DuplicateCounter> {
        let key = (t, h);
        self.ordered.remove(&key);
        self.by_key.remove(&key)
    }

    /// Runs `updateReplicas` over every live counter, then returns the
    /// aggregated responses of those that reached `DONE`, in ascending
    /// `(T, H)` order — the order callers must finalize/forward them in to
    /// preserve per-destination response ordering.
    pub fn update_all_replicas(&mut self, current_replicas: &[SiteId]) -> Vec<AggregatedResponse> {
        let mut done = Vec::new();
        for key in self.ordered.iter().copied().collect::<Vec<_>>() {
            let Some(counter) = self.by_key.get_mut(&key) else {
                continue;
            };
            if counter.update_replicas(current_replicas) == UpdateReplicasOutcome::Done {
                if let Some(aggregated) = counter.aggregated() {
                    done.push(aggregated);
                }
            }
        }
        for aggregated in &done {
            self.remove(aggregated.t, aggregated.h);
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(id: u64) -> SiteId {
        SiteId::new(id)
    }

    fn hash(byte: u8) -> ResultHash {
        ResultHash::from_bytes([byte; sps_types::RESULT_HASH_LENGTH])
    }

    fn response(source: SiteId, byte: u8) -> ReplicaResponse {
        ReplicaResponse {
            source,
            hash: hash(byte),
            hashes: vec![hash(byte)],
            results: vec![byte],
            status: ReplicaStatus::Success,
        }
    }

    #[test]
    fn done_once_all_expected_respond_with_matching_hash() {
        let mut dc = DuplicateCounter::new(
            TxnId::new(100),
            SpHandle::new(100),
            vec![site(1), site(2)],
            site(9),
            CounterOpener::Initiate,
        );
        assert_eq!(dc.offer(response(site(1), 0xAB)), OfferOutcome::Waiting);
        assert_eq!(dc.offer(response(site(2), 0xAB)), OfferOutcome::Done);
        assert_eq!(dc.aggregated().unwrap().hash, hash(0xAB));
    }

    #[test]
    fn mismatch_on_divergent_hash() {
        let mut dc = DuplicateCounter::new(
            TxnId::new(1),
            SpHandle::new(1),
            vec![site(1), site(2)],
            site(9),
            CounterOpener::Initiate,
        );
        dc.offer(response(site(1), 0xAB));
        assert_eq!(
            dc.offer(response(site(2), 0xDE)),
            OfferOutcome::Mismatch
        );
    }

    #[test]
    fn abort_on_divergent_status() {
        let mut dc = DuplicateCounter::new(
            TxnId::new(1),
            SpHandle::new(1),
            vec![site(1), site(2)],
            site(9),
            CounterOpener::Initiate,
        );
        dc.offer(response(site(1), 0xAB));
        let mut aborted = response(site(2), 0xAB);
        aborted.status = ReplicaStatus::Aborted;
        assert_eq!(dc.offer(aborted), OfferOutcome::Abort);
    }

    #[test]
    fn update_replicas_completes_when_remaining_set_satisfied() {
        let mut dc = DuplicateCounter::new(
            TxnId::new(1),
            SpHandle::new(1),
            vec![site(1), site(2)],
            site(9),
            CounterOpener::Initiate,
        );
        dc.offer(response(site(1), 0xAB));
        assert_eq!(
            dc.update_replicas(&[site(1)]),
            UpdateReplicasOutcome::Done
        );
    }

    #[test]
    fn collision_permitted_only_for_distinct_coordinators() {
        let existing = CounterOpener::CompleteTransaction {
            coordinator_id: site(1),
        };
        assert!(collision_permitted(&existing, site(2)));
        assert!(!collision_permitted(&existing, site(1)));
        assert!(!collision_permitted(&CounterOpener::Initiate, site(2)));
    }

    #[test]
    fn index_rejects_colliding_key() {
        let mut idx = DuplicateCounterIndex::new();
        let first = DuplicateCounter::new(
            TxnId::new(1),
            SpHandle::new(1),
            vec![site(1)],
            site(9),
            CounterOpener::Initiate,
        );
        idx.insert(first).unwrap();
        let second = DuplicateCounter::new(
            TxnId::new(1),
            SpHandle::new(1),
            vec![site(2)],
            site(9),
            CounterOpener::Initiate,
        );
        assert!(idx.insert(second).is_err());
    }

    #[test]
    fn update_all_replicas_drains_in_ascending_order() {
        let mut idx = DuplicateCounterIndex::new();
        for (t, h) in [(3u64, 3u64), (1, 1), (2, 2)] {
            let mut dc = DuplicateCounter::new(
                TxnId::new(t),
                SpHandle::new(h),
                vec![site(1)],
                site(9),
                CounterOpener::Initiate,
            );
            dc.offer(response(site(1), 0xAB));
            idx.insert(dc).unwrap();
        }
        let done = idx.update_all_replicas(&[site(1)]);
        let order: Vec<u64> = done.iter().map(|r| r.t.as_u64()).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(idx.is_empty());
    }
}
