//! Proposals, votes and round progression for the votable slot.

use rabia_types::{
    Attempt, Batch, BatchDigest, NodeId, Round, SequenceNumber, StateValue,
};

use crate::coin::common_coin;
use crate::instrumentation::METRICS;
use crate::message::{Message, MessagePayload};
use crate::phase::{CastVote, Classification, Round2Outcome, Stage, VoteDisposition, VoteKey};
use crate::state_machine::StateMachine;

use super::{ConsensusEngine, EngineOutput, NodeStatus};

impl<S: StateMachine> ConsensusEngine<S> {
    // ========================================================================
    // Incoming Proposals and Votes
    // ========================================================================

    pub(super) fn on_proposal(
        mut self,
        from: NodeId,
        sequence: SequenceNumber,
        batch: Option<Batch>,
    ) -> (Self, EngineOutput) {
        let mut output = EngineOutput::empty();
        if self.status() != NodeStatus::Member {
            return (self, output);
        }
        if sequence <= self.applied_through {
            self.answer_settled(from, sequence, &mut output);
            return (self, output);
        }
        if sequence > self.window_end() {
            self.request_catch_up(from, sequence.prev(), &mut output);
            return (self, output);
        }

        if let Some(batch) = &batch {
            self.learn_pending(batch.clone());
            self.highest_active = self.highest_active.max(sequence);
        }

        let phase = self.cache.get_or_create(sequence);
        if phase.is_decided() {
            if let Some(reply) = self.decision_reply(from, sequence) {
                output.messages.push(reply);
            }
            return (self, output);
        }
        if phase.record_proposal(from, batch) {
            tracing::trace!(node = %self.node_id, seq = %sequence, %from, "proposal recorded");
        }
        (self, output)
    }

    pub(super) fn on_vote(
        mut self,
        from: NodeId,
        sequence: SequenceNumber,
        attempt: Attempt,
        round: Round,
        value: StateValue,
        candidate: Option<BatchDigest>,
    ) -> (Self, EngineOutput) {
        let mut output = EngineOutput::empty();
        if self.status() != NodeStatus::Member {
            return (self, output);
        }
        if sequence <= self.applied_through {
            self.answer_settled(from, sequence, &mut output);
            return (self, output);
        }
        if sequence > self.window_end() {
            self.request_catch_up(from, sequence.prev(), &mut output);
            return (self, output);
        }
        // Votes for later slots are checked against membership when their
        // slot becomes votable.
        if self
            .view_for(sequence)
            .is_some_and(|view| !view.is_member(from))
        {
            return (self, output);
        }

        self.highest_active = self.highest_active.max(sequence);
        let key = VoteKey::new(attempt, round);
        let vote = CastVote { value, candidate };
        let node_id = self.node_id;

        let phase = self.cache.get_or_create(sequence);
        match phase.record_vote(from, key, vote) {
            VoteDisposition::AlreadyDecided => {
                if let Some(reply) = self.decision_reply(from, sequence) {
                    output.messages.push(reply);
                }
            }
            VoteDisposition::Stale => {
                METRICS.increment_votes_stale();
                // The sender is behind; give it our vote for the round it
                // is still in.
                if let Some(own) = phase.own_vote(key) {
                    output
                        .messages
                        .push(vote_message(node_id, Some(from), sequence, key, own));
                }
            }
            VoteDisposition::Buffered => METRICS.increment_votes_buffered(),
            VoteDisposition::Applied(_) | VoteDisposition::Ignored => {}
        }
        (self, output)
    }

    // ========================================================================
    // Round Progression
    // ========================================================================

    /// Advances the slot right after `applied_through` as far as the votes
    /// at hand allow.
    ///
    /// Returns true if any round opened or the slot decided.
    pub(super) fn advance_votable(&mut self, output: &mut EngineOutput) -> bool {
        if self.status() != NodeStatus::Member {
            return false;
        }
        let sequence = self.applied_through.next();
        let node_id = self.node_id;
        let view = self.view.clone();
        let Some(phase) = self.cache.get_mut(sequence) else {
            return false;
        };
        if !phase.has_proposed() {
            return false;
        }

        let mut progressed = false;
        loop {
            let next = match phase.stage() {
                Stage::Decided => break,
                Stage::Admitted => phase
                    .classify_proposals(&view)
                    .map(|vote| (VoteKey::new(Attempt::FIRST, Round::One), vote)),
                Stage::Round1 { attempt } => phase.classify_round1(&view).map(|class| {
                    let value = match class {
                        Classification::StrictMajority(value) => value,
                        Classification::NoMajority => StateValue::Undecided,
                    };
                    let vote = CastVote {
                        value,
                        candidate: None,
                    };
                    (VoteKey::new(attempt, Round::Two), vote)
                }),
                Stage::Round2 { attempt } => match phase.classify_round2(&view) {
                    None => None,
                    Some(Round2Outcome::Decide(value)) => {
                        let candidate = phase.candidate();
                        phase.decide(value, candidate);
                        METRICS.increment_decisions(value);
                        tracing::debug!(
                            node = %node_id,
                            seq = %sequence,
                            %attempt,
                            %value,
                            "slot decided"
                        );
                        let batch = phase.decided_batch().cloned();
                        for learner in view.learners() {
                            output.messages.push(Message::targeted(
                                node_id,
                                learner,
                                MessagePayload::Decision {
                                    sequence,
                                    value,
                                    digest: candidate.filter(|_| value == StateValue::V1),
                                    batch: batch.clone(),
                                },
                            ));
                        }
                        progressed = true;
                        break;
                    }
                    Some(Round2Outcome::Adopt(value)) => Some((
                        VoteKey::new(attempt.next(), Round::One),
                        CastVote {
                            value,
                            candidate: None,
                        },
                    )),
                    Some(Round2Outcome::Coin) => {
                        let value = common_coin(sequence, attempt);
                        METRICS.increment_coin_flips();
                        Some((
                            VoteKey::new(attempt.next(), Round::One),
                            CastVote {
                                value,
                                candidate: None,
                            },
                        ))
                    }
                },
            };

            let Some((key, vote)) = next else {
                break;
            };
            if key.round == Round::One && key.attempt > Attempt::FIRST {
                METRICS.increment_retries();
                tracing::debug!(
                    node = %node_id,
                    seq = %sequence,
                    attempt = %key.attempt,
                    value = %vote.value,
                    "starting new attempt"
                );
            }

            let cast = phase.open_round(node_id, key, vote);
            output
                .messages
                .push(vote_message(node_id, None, sequence, key, cast));
            for (from, buffered) in phase.take_buffered(key) {
                if from != node_id && view.is_member(from) {
                    phase.record_vote(from, key, buffered);
                }
            }
            progressed = true;
        }
        progressed
    }

    // ========================================================================
    // Retransmission
    // ========================================================================

    /// Re-broadcasts this node's proposal and current vote for every open
    /// slot. Receivers record them idempotently, so loss is repaired by
    /// repetition.
    pub(super) fn retransmit(&self, output: &mut EngineOutput) {
        for sequence in self.cache.sequences() {
            if sequence <= self.applied_through {
                continue;
            }
            let Some(phase) = self.cache.peek(sequence) else {
                continue;
            };
            if phase.is_decided() {
                continue;
            }
            if let Some(own) = phase.own_proposal() {
                output.messages.push(Message::broadcast(
                    self.node_id,
                    MessagePayload::Proposal {
                        sequence,
                        batch: own.cloned(),
                    },
                ));
            }
            if let Some((key, vote)) = phase.current_own_vote() {
                output
                    .messages
                    .push(vote_message(self.node_id, None, sequence, key, vote));
            }
        }
    }
}

fn vote_message(
    from: NodeId,
    to: Option<NodeId>,
    sequence: SequenceNumber,
    key: VoteKey,
    vote: CastVote,
) -> Message {
    let payload = MessagePayload::Vote {
        sequence,
        attempt: key.attempt,
        round: key.round,
        value: vote.value,
        candidate: vote.candidate,
    };
    match to {
        Some(to) => Message::targeted(from, to, payload),
        None => Message::broadcast(from, payload),
    }
}
