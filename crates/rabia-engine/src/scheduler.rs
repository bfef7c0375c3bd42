//! Batch admission scheduling.
//!
//! Every node keeps the batches it knows about but has not yet seen
//! committed: its own submissions plus batches forwarded by peers or learned
//! from their proposals. When a slot opens, [`BatchScheduler::next_to_admit`]
//! hands out the earliest-submitted batch that is not already proposed in
//! another open slot.
//!
//! Ordering is `(submitted_at, submitter, local_sequence)`. Because all
//! nodes use the same key, nodes that know the same batches propose the same
//! head, which is what lets round 1 find a majority.
//!
//! The heap uses lazy deletion: completed and already-admitted entries are
//! skipped when popped instead of being removed eagerly.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use rabia_types::{Batch, BatchId, NodeId, SequenceNumber, Timestamp};

use crate::applied::AppliedIndex;

/// Heap key. Derived `Ord` compares fields top to bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct AdmissionKey {
    submitted_at: Timestamp,
    submitter: NodeId,
    local_sequence: u64,
}

impl AdmissionKey {
    fn of(batch: &Batch) -> Self {
        Self {
            submitted_at: batch.submitted_at,
            submitter: batch.id.submitter,
            local_sequence: batch.id.local_sequence,
        }
    }

    fn batch_id(&self) -> BatchId {
        BatchId::new(self.submitter, self.local_sequence)
    }
}

/// Priority queue of uncommitted batches.
#[derive(Debug, Clone, Default)]
pub struct BatchScheduler {
    /// All uncommitted batches this node knows about.
    pending: BTreeMap<BatchId, Batch>,
    /// Min-heap over admission keys (via `Reverse`).
    queue: BinaryHeap<Reverse<AdmissionKey>>,
    /// Batches currently proposed by this node, and the slot they went to.
    admitted: BTreeMap<BatchId, SequenceNumber>,
}

impl BatchScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a batch. Returns false if it was already known.
    pub fn submit(&mut self, batch: Batch) -> bool {
        if self.pending.contains_key(&batch.id) {
            return false;
        }
        self.queue.push(Reverse(AdmissionKey::of(&batch)));
        self.pending.insert(batch.id, batch);
        true
    }

    pub fn contains(&self, id: BatchId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Pops the earliest-submitted batch that is not admitted yet and
    /// marks it admitted to `slot`.
    pub fn next_to_admit(&mut self, slot: SequenceNumber) -> Option<Batch> {
        while let Some(Reverse(key)) = self.queue.pop() {
            let id = key.batch_id();
            if self.admitted.contains_key(&id) {
                continue;
            }
            let Some(batch) = self.pending.get(&id) else {
                continue;
            };
            self.admitted.insert(id, slot);
            return Some(batch.clone());
        }
        None
    }

    /// Returns an admitted batch to the queue, e.g. after its slot decided
    /// something else.
    pub fn requeue(&mut self, id: BatchId) {
        if self.admitted.remove(&id).is_none() {
            return;
        }
        if let Some(batch) = self.pending.get(&id) {
            self.queue.push(Reverse(AdmissionKey::of(batch)));
        }
    }

    /// Forgets a batch that committed (or was rejected) in some slot.
    pub fn complete(&mut self, id: BatchId) -> Option<Batch> {
        self.admitted.remove(&id);
        self.pending.remove(&id)
    }

    /// Slot the batch is currently admitted to, if any.
    pub fn admitted_slot(&self, id: BatchId) -> Option<SequenceNumber> {
        self.admitted.get(&id).copied()
    }

    /// Drops every batch the index already covers and requeues batches that
    /// were admitted to slots at or below `through`.
    ///
    /// Used after a snapshot restore skips over slots wholesale.
    pub fn reconcile(&mut self, applied: &AppliedIndex, through: SequenceNumber) -> Vec<BatchId> {
        let committed: Vec<BatchId> = self
            .pending
            .keys()
            .filter(|id| applied.contains(**id))
            .copied()
            .collect();
        for id in &committed {
            self.complete(*id);
        }

        let stranded: Vec<BatchId> = self
            .admitted
            .iter()
            .filter(|(_, slot)| **slot <= through)
            .map(|(id, _)| *id)
            .collect();
        for id in stranded {
            self.requeue(id);
        }

        committed
    }

    /// Batches submitted by `node` that have not committed yet.
    pub fn pending_from(&self, node: NodeId) -> impl Iterator<Item = &Batch> {
        self.pending
            .range(BatchId::new(node, 0)..=BatchId::new(node, u64::MAX))
            .map(|(_, batch)| batch)
    }

    /// Known uncommitted batches (admitted or not).
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.admitted.len()
    }

    /// Returns true if some batch could be admitted right now.
    pub fn has_admissible(&self) -> bool {
        self.pending.len() > self.admitted.len()
    }
}
