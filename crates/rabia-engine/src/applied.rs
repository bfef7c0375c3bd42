//! Exactly-once bookkeeping for applied batches.
//!
//! The same batch can legitimately be decided in two slots: a node may
//! propose it again in a later slot before it learns about the earlier
//! decision. [`AppliedIndex`] records which batch IDs have been consumed so
//! the second decision applies as a no-op on every node.
//!
//! Per submitter, IDs below a contiguous watermark are implied; anything
//! above it sits in a sparse set until the gap closes.
//!
//! Rejected batches are consumed too, but their reason is kept alongside so
//! a node that learns about them from a snapshot reports the rejection
//! instead of a commit.

use std::collections::{BTreeMap, BTreeSet};

use rabia_types::{BatchId, NodeId};
use serde::{Deserialize, Serialize};

use crate::cluster::ReconfigError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct SubmitterRecord {
    /// Every local sequence below this value has been applied.
    watermark: u64,
    /// Applied local sequences at or above the watermark.
    sparse: BTreeSet<u64>,
}

/// Set of batch IDs that have been applied (or rejected) in some slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedIndex {
    submitters: BTreeMap<NodeId, SubmitterRecord>,
    rejected: BTreeMap<BatchId, ReconfigError>,
}

impl AppliedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `id`. Returns false if it was already present.
    pub fn insert(&mut self, id: BatchId) -> bool {
        let record = self.submitters.entry(id.submitter).or_default();
        if id.local_sequence < record.watermark || !record.sparse.insert(id.local_sequence) {
            return false;
        }
        while record.sparse.remove(&record.watermark) {
            record.watermark += 1;
        }
        true
    }

    pub fn contains(&self, id: BatchId) -> bool {
        self.submitters.get(&id.submitter).is_some_and(|record| {
            id.local_sequence < record.watermark || record.sparse.contains(&id.local_sequence)
        })
    }

    /// Records `id` as consumed by a rejection. Returns false if it was
    /// already present.
    pub fn reject(&mut self, id: BatchId, error: ReconfigError) -> bool {
        if !self.insert(id) {
            return false;
        }
        self.rejected.insert(id, error);
        true
    }

    /// Why `id` was rejected, if it was.
    pub fn rejection(&self, id: BatchId) -> Option<ReconfigError> {
        self.rejected.get(&id).copied()
    }

    /// Next local sequence `submitter` has not had applied contiguously.
    pub fn watermark(&self, submitter: NodeId) -> u64 {
        self.submitters
            .get(&submitter)
            .map_or(0, |record| record.watermark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(submitter: u64, local: u64) -> BatchId {
        BatchId::new(NodeId::new(submitter), local)
    }

    #[test]
    fn test_watermark_compacts_contiguous_prefix() {
        let mut index = AppliedIndex::new();
        assert!(index.insert(id(1, 1)));
        assert_eq!(index.watermark(NodeId::new(1)), 0);
        assert!(index.insert(id(1, 0)));
        assert_eq!(index.watermark(NodeId::new(1)), 2);
        assert!(index.contains(id(1, 0)));
        assert!(index.contains(id(1, 1)));
        assert!(!index.contains(id(1, 2)));
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut index = AppliedIndex::new();
        assert!(index.insert(id(2, 5)));
        assert!(!index.insert(id(2, 5)));
        assert!(!index.contains(id(3, 5)));
    }

    #[test]
    fn test_rejection_is_consumed_and_remembered() {
        let mut index = AppliedIndex::new();
        let error = ReconfigError::NotPresent(NodeId::new(9));
        assert!(index.reject(id(1, 0), error));
        assert!(index.contains(id(1, 0)));
        assert!(!index.insert(id(1, 0)));
        assert!(!index.reject(id(1, 0), error));
        assert_eq!(index.rejection(id(1, 0)), Some(error));

        assert!(index.insert(id(1, 1)));
        assert_eq!(index.rejection(id(1, 1)), None);
        assert_eq!(index.watermark(NodeId::new(1)), 2);
    }

    #[test]
    fn test_rejections_survive_serialization() {
        let mut index = AppliedIndex::new();
        let error = ReconfigError::EpochConflict {
            expected: rabia_types::Epoch::new(0),
            actual: rabia_types::Epoch::new(1),
        };
        index.reject(id(5, 0), error);
        index.insert(id(2, 0));

        let bytes = postcard::to_allocvec(&index).expect("encode");
        let decoded: AppliedIndex = postcard::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, index);
        assert_eq!(decoded.rejection(id(5, 0)), Some(error));
    }

    proptest! {
        /// Property: the index behaves like a plain set of IDs.
        #[test]
        fn prop_matches_naive_set(ops in prop::collection::vec((0u64..3, 0u64..12), 0..64)) {
            let mut index = AppliedIndex::new();
            let mut naive = BTreeSet::new();
            for (submitter, local) in ops {
                let fresh = naive.insert((submitter, local));
                prop_assert_eq!(index.insert(id(submitter, local)), fresh);
            }
            for submitter in 0..3 {
                for local in 0..12 {
                    prop_assert_eq!(
                        index.contains(id(submitter, local)),
                        naive.contains(&(submitter, local))
                    );
                }
            }
        }
    }
}
