//! Per-slot protocol state.
//!
//! A [`PhaseState`] holds everything one node knows about one sequence
//! number: the proposals it has seen, the votes of the current attempt, its
//! own vote history and, eventually, the decision.
//!
//! # Stages
//!
//! ```text
//!              quorum of proposals
//!   Admitted ───────────────────────► Round1(a)
//!                                        │ quorum of round-1 votes
//!                                        ▼
//!                 Adopt / Coin       Round2(a)
//!   Round1(a+1) ◄────────────────────────┤ quorum of round-2 votes
//!                                        │ quorum agrees on definite v
//!                                        ▼
//!                                     Decided
//! ```
//!
//! `PhaseState` does not know which nodes are members; the engine filters
//! senders against the slot's [`ClusterView`] before recording anything
//! that counts toward a quorum.

use std::collections::BTreeMap;

use rabia_types::{Attempt, Batch, BatchDigest, NodeId, Round, SequenceNumber, StateValue};

use crate::cluster::ClusterView;
use crate::tally::{RecordOutcome, VoteSet};

// ============================================================================
// Stage and Classification Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Slot exists locally; round 1 has not started.
    Admitted,
    Round1 { attempt: Attempt },
    Round2 { attempt: Attempt },
    Decided,
}

/// Identifies one round of one attempt. Orders by attempt, then round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VoteKey {
    pub attempt: Attempt,
    pub round: Round,
}

impl VoteKey {
    pub fn new(attempt: Attempt, round: Round) -> Self {
        Self { attempt, round }
    }
}

/// Outcome of classifying a quorum of round-1 votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// At least a quorum of members voted for this value.
    StrictMajority(StateValue),
    /// Neither value reached a majority of the membership.
    NoMajority,
}

/// Outcome of a quorum of round-2 votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Round2Outcome {
    /// A quorum agreed on a definite value.
    Decide(StateValue),
    /// Some definite value was seen; carry it into the next attempt.
    Adopt(StateValue),
    /// Only undecided votes; flip the common coin.
    Coin,
}

/// What happened to an incoming vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteDisposition {
    /// Counted toward the current round.
    Applied(RecordOutcome),
    /// Held until its round opens.
    Buffered,
    /// Belongs to a round this node already finished.
    Stale,
    /// The slot is decided; the vote is only worth answering.
    AlreadyDecided,
    /// Inconsistent with what this slot already knows.
    Ignored,
}

/// A vote as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CastVote {
    pub value: StateValue,
    /// Digest of the batch a `V1` vote stands for.
    pub candidate: Option<BatchDigest>,
}

/// The final value of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub value: StateValue,
    pub digest: Option<BatchDigest>,
}

// ============================================================================
// PhaseState
// ============================================================================

#[derive(Debug, Clone)]
pub struct PhaseState {
    sequence: SequenceNumber,
    stage: Stage,

    /// This node's proposal. Outer `None` means it has not proposed yet.
    own_proposal: Option<Option<Batch>>,
    /// First proposal seen from each sender. `None` is an empty proposal.
    proposals: BTreeMap<NodeId, Option<BatchDigest>>,
    batches: BTreeMap<BatchDigest, Batch>,

    /// The unique batch a `V1` in this slot refers to, once known.
    candidate: Option<BatchDigest>,

    round1: VoteSet,
    round2: VoteSet,
    own_votes: BTreeMap<VoteKey, CastVote>,
    buffered: BTreeMap<VoteKey, BTreeMap<NodeId, CastVote>>,

    decision: Option<Decision>,
}

impl PhaseState {
    pub fn new(sequence: SequenceNumber) -> Self {
        Self {
            sequence,
            stage: Stage::Admitted,
            own_proposal: None,
            proposals: BTreeMap::new(),
            batches: BTreeMap::new(),
            candidate: None,
            round1: VoteSet::new(),
            round2: VoteSet::new(),
            own_votes: BTreeMap::new(),
            buffered: BTreeMap::new(),
            decision: None,
        }
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Current attempt; `FIRST` before round 1 starts.
    pub fn attempt(&self) -> Attempt {
        match self.stage {
            Stage::Round1 { attempt } | Stage::Round2 { attempt } => attempt,
            Stage::Admitted | Stage::Decided => Attempt::FIRST,
        }
    }

    /// The round currently accepting votes, if any.
    pub fn current_key(&self) -> Option<VoteKey> {
        match self.stage {
            Stage::Round1 { attempt } => Some(VoteKey::new(attempt, Round::One)),
            Stage::Round2 { attempt } => Some(VoteKey::new(attempt, Round::Two)),
            Stage::Admitted | Stage::Decided => None,
        }
    }

    pub fn candidate(&self) -> Option<BatchDigest> {
        self.candidate
    }

    // ------------------------------------------------------------------------
    // Proposals
    // ------------------------------------------------------------------------

    pub fn has_proposed(&self) -> bool {
        self.own_proposal.is_some()
    }

    pub fn own_proposal(&self) -> Option<Option<&Batch>> {
        self.own_proposal.as_ref().map(Option::as_ref)
    }

    /// Fixes this node's proposal. Later calls are ignored.
    pub fn set_own_proposal(&mut self, own: NodeId, batch: Option<Batch>) {
        if self.own_proposal.is_some() {
            return;
        }
        self.own_proposal = Some(batch.clone());
        self.record_proposal(own, batch);
    }

    /// Records a peer's proposal. Only the first one per sender counts.
    pub fn record_proposal(&mut self, from: NodeId, batch: Option<Batch>) -> bool {
        if self.proposals.contains_key(&from) {
            return false;
        }
        let digest = batch.map(|batch| self.learn_batch(batch));
        self.proposals.insert(from, digest);
        true
    }

    pub fn proposal_count(&self) -> usize {
        self.proposals.len()
    }

    /// Stores batch content so a later `V1` decision can be resolved.
    pub fn learn_batch(&mut self, batch: Batch) -> BatchDigest {
        let digest = batch.digest();
        self.batches.entry(digest).or_insert(batch);
        digest
    }

    pub fn batch(&self, digest: &BatchDigest) -> Option<&Batch> {
        self.batches.get(digest)
    }

    /// Derives the attempt-1 round-1 vote once a quorum of members proposed.
    ///
    /// `V1` requires one digest proposed by at least a quorum of members.
    /// Each member proposes once per slot, so two such digests cannot both
    /// exist.
    pub fn classify_proposals(&self, view: &ClusterView) -> Option<CastVote> {
        let mut received = 0;
        let mut per_digest: BTreeMap<BatchDigest, usize> = BTreeMap::new();
        for (from, digest) in &self.proposals {
            if !view.is_member(*from) {
                continue;
            }
            received += 1;
            if let Some(digest) = digest {
                *per_digest.entry(*digest).or_default() += 1;
            }
        }
        if received < view.quorum_size() {
            return None;
        }

        let majority = per_digest
            .into_iter()
            .find(|(_, count)| *count >= view.quorum_size())
            .map(|(digest, _)| digest);

        Some(match majority {
            Some(digest) => CastVote {
                value: StateValue::V1,
                candidate: Some(digest),
            },
            None => CastVote {
                value: StateValue::V0,
                candidate: None,
            },
        })
    }

    // ------------------------------------------------------------------------
    // Voting
    // ------------------------------------------------------------------------

    /// Opens `key` with this node's own vote and returns the vote to send.
    ///
    /// Resets the current-attempt vote sets when a new attempt starts.
    pub fn open_round(&mut self, own: NodeId, key: VoteKey, vote: CastVote) -> CastVote {
        assert!(
            self.decision.is_none(),
            "slot {} is decided; rounds cannot reopen",
            self.sequence
        );
        debug_assert!(
            self.current_key().is_none_or(|current| key > current),
            "rounds only move forward"
        );
        let vote = self.bind_candidate(vote);

        match key.round {
            Round::One => {
                self.stage = Stage::Round1 {
                    attempt: key.attempt,
                };
                self.round1 = VoteSet::new();
                self.round2 = VoteSet::new();
                self.round1.record(own, vote.value);
            }
            Round::Two => {
                self.stage = Stage::Round2 {
                    attempt: key.attempt,
                };
                self.round2.record(own, vote.value);
            }
        }
        self.own_votes.insert(key, vote);
        self.buffered.retain(|buffered_key, _| *buffered_key >= key);
        vote
    }

    /// A `V1` vote without a known candidate cannot be honoured; fall back
    /// to `V0`. Only liveness depends on this choice.
    fn bind_candidate(&mut self, vote: CastVote) -> CastVote {
        match (vote.value, vote.candidate.or(self.candidate)) {
            (StateValue::V1, Some(digest)) => {
                self.candidate.get_or_insert(digest);
                CastVote {
                    value: StateValue::V1,
                    candidate: Some(digest),
                }
            }
            (StateValue::V1, None) => CastVote {
                value: StateValue::V0,
                candidate: None,
            },
            (value, _) => CastVote {
                value,
                candidate: None,
            },
        }
    }

    /// Records a member's vote.
    pub fn record_vote(&mut self, from: NodeId, key: VoteKey, vote: CastVote) -> VoteDisposition {
        if self.decision.is_some() {
            return VoteDisposition::AlreadyDecided;
        }
        if vote.value == StateValue::V1 {
            match (self.candidate, vote.candidate) {
                (_, None) => return VoteDisposition::Ignored,
                (Some(known), Some(claimed)) if known != claimed => {
                    return VoteDisposition::Ignored;
                }
                (None, Some(claimed)) => self.candidate = Some(claimed),
                _ => {}
            }
        }

        match self.current_key() {
            Some(current) if key == current => {
                let set = match key.round {
                    Round::One => &mut self.round1,
                    Round::Two => &mut self.round2,
                };
                VoteDisposition::Applied(set.record(from, vote.value))
            }
            Some(current) if key < current => VoteDisposition::Stale,
            _ => {
                self.buffered.entry(key).or_default().insert(from, vote);
                VoteDisposition::Buffered
            }
        }
    }

    /// Removes and returns buffered votes for `key`.
    pub fn take_buffered(&mut self, key: VoteKey) -> Vec<(NodeId, CastVote)> {
        self.buffered
            .remove(&key)
            .map(|votes| votes.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.values().map(BTreeMap::len).sum()
    }

    /// This node's vote for `key`, for answering retransmissions.
    pub fn own_vote(&self, key: VoteKey) -> Option<CastVote> {
        self.own_votes.get(&key).copied()
    }

    /// This node's vote in the round currently open.
    pub fn current_own_vote(&self) -> Option<(VoteKey, CastVote)> {
        let key = self.current_key()?;
        self.own_vote(key).map(|vote| (key, vote))
    }

    pub fn round_votes(&self, round: Round) -> &VoteSet {
        match round {
            Round::One => &self.round1,
            Round::Two => &self.round2,
        }
    }

    /// Classifies round 1 once a quorum of members has voted.
    pub fn classify_round1(&self, view: &ClusterView) -> Option<Classification> {
        let Stage::Round1 { .. } = self.stage else {
            return None;
        };
        let quorum = view.quorum_size();
        if self.round1.len() < quorum {
            return None;
        }
        let classification = if self.round1.count_of(StateValue::V1) >= quorum {
            Classification::StrictMajority(StateValue::V1)
        } else if self.round1.count_of(StateValue::V0) >= quorum {
            Classification::StrictMajority(StateValue::V0)
        } else {
            Classification::NoMajority
        };
        Some(classification)
    }

    /// Evaluates round 2 once a quorum of members has voted.
    pub fn classify_round2(&self, view: &ClusterView) -> Option<Round2Outcome> {
        let Stage::Round2 { .. } = self.stage else {
            return None;
        };
        let quorum = view.quorum_size();
        if self.round2.len() < quorum {
            return None;
        }
        let v0 = self.round2.count_of(StateValue::V0);
        let v1 = self.round2.count_of(StateValue::V1);
        debug_assert!(
            v0 == 0 || v1 == 0,
            "conflicting definite round-2 votes in slot {}",
            self.sequence
        );

        let outcome = if v1 >= quorum {
            Round2Outcome::Decide(StateValue::V1)
        } else if v0 >= quorum {
            Round2Outcome::Decide(StateValue::V0)
        } else if v1 > 0 {
            Round2Outcome::Adopt(StateValue::V1)
        } else if v0 > 0 {
            Round2Outcome::Adopt(StateValue::V0)
        } else {
            Round2Outcome::Coin
        };
        Some(outcome)
    }

    // ------------------------------------------------------------------------
    // Decision
    // ------------------------------------------------------------------------

    /// Records the decision. Returns true if it is new.
    ///
    /// # Panics
    ///
    /// Panics if a different decision was already recorded: a slot decides
    /// at most once.
    pub fn decide(&mut self, value: StateValue, digest: Option<BatchDigest>) -> bool {
        assert!(value.is_definite(), "cannot decide {value}");
        let digest = match value {
            StateValue::V1 => digest.or(self.candidate),
            _ => None,
        };
        let decision = Decision { value, digest };

        if let Some(existing) = self.decision {
            assert_eq!(
                existing.value, decision.value,
                "slot {} decided twice with different values",
                self.sequence
            );
            return false;
        }
        if let Some(digest) = digest {
            self.candidate = Some(digest);
        }
        self.decision = Some(decision);
        self.stage = Stage::Decided;
        self.buffered.clear();
        true
    }

    pub fn decision(&self) -> Option<Decision> {
        self.decision
    }

    pub fn is_decided(&self) -> bool {
        self.decision.is_some()
    }

    /// The committed batch, once the slot decided `V1` and the content is known.
    pub fn decided_batch(&self) -> Option<&Batch> {
        let decision = self.decision?;
        decision.digest.and_then(|digest| self.batches.get(&digest))
    }

    /// True when the slot decided `V1` but the batch content is still missing.
    pub fn awaiting_batch(&self) -> bool {
        matches!(
            self.decision,
            Some(Decision {
                value: StateValue::V1,
                ..
            })
        ) && self.decided_batch().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;
    use rabia_types::{BatchId, Command, Timestamp};

    fn node(id: u64) -> NodeId {
        NodeId::new(id)
    }

    fn view5() -> ClusterView {
        ClusterView::new((1..=5).map(NodeId::new))
    }

    fn batch(tag: &'static [u8]) -> Batch {
        Batch::new(
            BatchId::new(node(1), 0),
            Timestamp::from_nanos(1),
            vec![Command::Opaque(Bytes::from_static(tag))],
        )
    }

    fn vote(value: StateValue, candidate: Option<BatchDigest>) -> CastVote {
        CastVote { value, candidate }
    }

    const R1: VoteKey = VoteKey {
        attempt: Attempt::FIRST,
        round: Round::One,
    };
    const R2: VoteKey = VoteKey {
        attempt: Attempt::FIRST,
        round: Round::Two,
    };

    #[test]
    fn test_unanimous_proposals_vote_v1() {
        let view = view5();
        let mut phase = PhaseState::new(SequenceNumber::FIRST);
        let b = batch(b"x");
        phase.set_own_proposal(node(1), Some(b.clone()));
        assert!(phase.classify_proposals(&view).is_none());
        phase.record_proposal(node(2), Some(b.clone()));
        phase.record_proposal(node(3), Some(b.clone()));

        let cast = phase.classify_proposals(&view).expect("quorum of proposals");
        assert_eq!(cast.value, StateValue::V1);
        assert_eq!(cast.candidate, Some(b.digest()));
    }

    #[test]
    fn test_split_proposals_vote_v0() {
        let view = view5();
        let mut phase = PhaseState::new(SequenceNumber::FIRST);
        phase.record_proposal(node(1), Some(batch(b"x")));
        phase.record_proposal(node(2), Some(batch(b"y")));
        phase.record_proposal(node(3), None);
        phase.record_proposal(node(4), Some(batch(b"x")));

        let cast = phase.classify_proposals(&view).expect("quorum of proposals");
        assert_eq!(cast.value, StateValue::V0);
    }

    #[test]
    fn test_non_member_proposals_ignored() {
        let view = view5();
        let mut phase = PhaseState::new(SequenceNumber::FIRST);
        let b = batch(b"x");
        phase.record_proposal(node(1), Some(b.clone()));
        phase.record_proposal(node(2), Some(b.clone()));
        phase.record_proposal(node(9), Some(b));
        assert!(phase.classify_proposals(&view).is_none());
    }

    #[test]
    fn test_second_proposal_from_sender_ignored() {
        let mut phase = PhaseState::new(SequenceNumber::FIRST);
        assert!(phase.record_proposal(node(2), Some(batch(b"x"))));
        assert!(!phase.record_proposal(node(2), Some(batch(b"y"))));
        assert_eq!(phase.proposal_count(), 1);
    }

    #[test]
    fn test_round2_vote_buffered_until_round_opens() {
        let view = view5();
        let mut phase = PhaseState::new(SequenceNumber::FIRST);
        phase.open_round(node(1), R1, vote(StateValue::V0, None));

        let early = phase.record_vote(node(2), R2, vote(StateValue::V0, None));
        assert_eq!(early, VoteDisposition::Buffered);
        assert_eq!(phase.round_votes(Round::Two).len(), 0);

        phase.record_vote(node(2), R1, vote(StateValue::V0, None));
        phase.record_vote(node(3), R1, vote(StateValue::V0, None));
        assert_eq!(
            phase.classify_round1(&view),
            Some(Classification::StrictMajority(StateValue::V0))
        );

        phase.open_round(node(1), R2, vote(StateValue::V0, None));
        for (from, buffered) in phase.take_buffered(R2) {
            phase.record_vote(from, R2, buffered);
        }
        assert_eq!(phase.round_votes(Round::Two).count_of(StateValue::V0), 2);
        assert_eq!(phase.buffered_len(), 0);
    }

    #[test]
    fn test_stale_votes_after_round_moves() {
        let mut phase = PhaseState::new(SequenceNumber::FIRST);
        phase.open_round(node(1), R1, vote(StateValue::V0, None));
        phase.open_round(node(1), R2, vote(StateValue::V0, None));
        assert_eq!(
            phase.record_vote(node(2), R1, vote(StateValue::V0, None)),
            VoteDisposition::Stale
        );
        assert_eq!(phase.own_vote(R1), Some(vote(StateValue::V0, None)));
    }

    #[test]
    fn test_v1_without_candidate_ignored() {
        let mut phase = PhaseState::new(SequenceNumber::FIRST);
        phase.open_round(node(1), R1, vote(StateValue::V0, None));
        assert_eq!(
            phase.record_vote(node(2), R1, vote(StateValue::V1, None)),
            VoteDisposition::Ignored
        );
    }

    #[test]
    fn test_open_round_v1_without_candidate_falls_back() {
        let mut phase = PhaseState::new(SequenceNumber::FIRST);
        let cast = phase.open_round(node(1), R1, vote(StateValue::V1, None));
        assert_eq!(cast.value, StateValue::V0);
    }

    #[test]
    fn test_no_majority_and_coin() {
        let view = view5();
        let d = batch(b"x").digest();
        let mut phase = PhaseState::new(SequenceNumber::FIRST);
        phase.open_round(node(1), R1, vote(StateValue::V1, Some(d)));
        phase.record_vote(node(2), R1, vote(StateValue::V0, None));
        phase.record_vote(node(3), R1, vote(StateValue::V0, None));
        assert_eq!(
            phase.classify_round1(&view),
            Some(Classification::NoMajority)
        );

        phase.open_round(node(1), R2, vote(StateValue::Undecided, None));
        phase.record_vote(node(2), R2, vote(StateValue::Undecided, None));
        assert_eq!(phase.classify_round2(&view), None);
        phase.record_vote(node(3), R2, vote(StateValue::Undecided, None));
        assert_eq!(phase.classify_round2(&view), Some(Round2Outcome::Coin));
    }

    #[test]
    fn test_decide_is_sticky() {
        let b = batch(b"x");
        let mut phase = PhaseState::new(SequenceNumber::FIRST);
        phase.learn_batch(b.clone());
        assert!(phase.decide(StateValue::V1, Some(b.digest())));
        assert!(!phase.decide(StateValue::V1, Some(b.digest())));
        assert_eq!(phase.decided_batch(), Some(&b));
        assert_eq!(
            phase.record_vote(node(2), R1, vote(StateValue::V0, None)),
            VoteDisposition::AlreadyDecided
        );
    }

    #[test]
    #[should_panic(expected = "decided twice")]
    fn test_conflicting_decision_panics() {
        let mut phase = PhaseState::new(SequenceNumber::FIRST);
        phase.decide(StateValue::V0, None);
        phase.decide(StateValue::V1, Some(batch(b"x").digest()));
    }

    #[test]
    fn test_awaiting_batch_until_learned() {
        let b = batch(b"x");
        let mut phase = PhaseState::new(SequenceNumber::FIRST);
        phase.decide(StateValue::V1, Some(b.digest()));
        assert!(phase.awaiting_batch());
        phase.learn_batch(b);
        assert!(!phase.awaiting_batch());
    }

    /// Feeds round-2 votes in order; returns the outcome at the first quorum.
    fn first_round2_outcome(
        own: StateValue,
        others: &[(u64, StateValue)],
        digest: BatchDigest,
    ) -> Option<Round2Outcome> {
        let view = view5();
        let mut phase = PhaseState::new(SequenceNumber::new(7));
        phase.open_round(node(1), R1, vote(StateValue::V1, Some(digest)));
        let own_candidate = (own == StateValue::V1).then_some(digest);
        phase.open_round(node(1), R2, vote(own, own_candidate));
        for (sender, value) in others {
            let candidate = (*value == StateValue::V1).then_some(digest);
            phase.record_vote(node(*sender), R2, vote(*value, candidate));
            if let Some(outcome) = phase.classify_round2(&view) {
                return Some(outcome);
            }
        }
        None
    }

    fn round2_votes() -> impl Strategy<Value = (StateValue, StateValue, Vec<(u64, StateValue)>)> {
        prop_oneof![Just(StateValue::V0), Just(StateValue::V1)].prop_flat_map(|v| {
            let values = prop::collection::vec(
                prop_oneof![Just(v), Just(StateValue::Undecided)],
                5,
            );
            (Just(v), values).prop_flat_map(|(v, values)| {
                let mut others: Vec<(u64, StateValue)> = values[1..]
                    .iter()
                    .enumerate()
                    .map(|(i, value)| (i as u64 + 2, *value))
                    .collect();
                // inject duplicates of two senders
                others.push(others[0]);
                others.push(others[1]);
                (Just(v), Just(values[0]), Just(others).prop_shuffle())
            })
        })
    }

    proptest! {
        /// Property: any permutation of the same round-2 votes, duplicates
        /// included, yields the same decision or none at all.
        #[test]
        fn prop_decision_independent_of_delivery_order(
            (value, own, others) in round2_votes()
        ) {
            let digest = batch(b"x").digest();
            match first_round2_outcome(own, &others, digest) {
                Some(Round2Outcome::Decide(decided)) => prop_assert_eq!(decided, value),
                Some(Round2Outcome::Adopt(adopted)) => prop_assert_eq!(adopted, value),
                Some(Round2Outcome::Coin) | None => {}
            }
        }

        /// Property: the round-1 tally equals a rescan after arbitrary
        /// duplicate-laden delivery.
        #[test]
        fn prop_round1_tally_consistent(
            votes in prop::collection::vec((1u64..6, any::<bool>()), 0..30)
        ) {
            let digest = batch(b"x").digest();
            let mut phase = PhaseState::new(SequenceNumber::FIRST);
            phase.open_round(node(1), R1, vote(StateValue::V0, None));
            for (sender, bit) in votes {
                let value = StateValue::from_bit(bit);
                let candidate = bit.then_some(digest);
                phase.record_vote(node(sender), R1, vote(value, candidate));
                let set = phase.round_votes(Round::One);
                prop_assert_eq!(set.tally(), set.rescan());
            }
        }
    }
}
