//! Incremental vote counting.
//!
//! [`VoteSet`] keeps one vote per sender (last write wins) and a
//! [`VoteTally`] of per-value counts that is updated on every record, so
//! `count_of` never rescans the vote map. Re-recording a sender moves its
//! count from the old bucket to the new one.

use std::collections::BTreeMap;

use rabia_types::{NodeId, StateValue};

/// Per-value vote counters over {V0, V1, Undecided}.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoteTally {
    counts: [usize; 3],
}

impl VoteTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves one vote from `previous` (if any) into `next`.
    pub fn record_transition(&mut self, previous: Option<StateValue>, next: StateValue) {
        if let Some(previous) = previous {
            let bucket = &mut self.counts[previous.bucket()];
            debug_assert!(*bucket > 0, "tally underflow for {previous}");
            *bucket = bucket.saturating_sub(1);
        }
        self.counts[next.bucket()] += 1;
    }

    pub fn count_of(&self, value: StateValue) -> usize {
        self.counts[value.bucket()]
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }
}

/// What happened when a vote was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First vote from this sender.
    New,
    /// Same value as already recorded; nothing changed.
    Duplicate,
    /// The sender's earlier value was replaced.
    Overwritten { previous: StateValue },
}

/// One round's votes: at most one entry per sender.
#[derive(Debug, Clone, Default)]
pub struct VoteSet {
    votes: BTreeMap<NodeId, StateValue>,
    tally: VoteTally,
}

impl VoteSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` for `sender`, idempotently.
    pub fn record(&mut self, sender: NodeId, value: StateValue) -> RecordOutcome {
        let previous = self.votes.insert(sender, value);
        match previous {
            Some(previous) if previous == value => RecordOutcome::Duplicate,
            Some(previous) => {
                self.tally.record_transition(Some(previous), value);
                RecordOutcome::Overwritten { previous }
            }
            None => {
                self.tally.record_transition(None, value);
                RecordOutcome::New
            }
        }
    }

    pub fn count_of(&self, value: StateValue) -> usize {
        self.tally.count_of(value)
    }

    /// Number of distinct senders.
    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn get(&self, sender: NodeId) -> Option<StateValue> {
        self.votes.get(&sender).copied()
    }

    pub fn votes(&self) -> impl Iterator<Item = (NodeId, StateValue)> + '_ {
        self.votes.iter().map(|(id, value)| (*id, *value))
    }

    pub fn tally(&self) -> VoteTally {
        self.tally
    }

    /// Recounts from the vote map. Used to cross-check the cached tally.
    pub fn rescan(&self) -> VoteTally {
        let mut tally = VoteTally::new();
        for value in self.votes.values() {
            tally.record_transition(None, *value);
        }
        tally
    }
}
