//! Client submissions and slot admission.

use bytes::Bytes;
use rabia_types::{Batch, BatchId, Command, MembershipChange, NodeId, Reconfiguration, Timestamp};

use crate::error::EngineError;
use crate::message::{Message, MessagePayload};
use crate::state_machine::StateMachine;

use super::{ConsensusEngine, EngineOutput, NodeStatus};

impl<S: StateMachine> ConsensusEngine<S> {
    // ========================================================================
    // Submission
    // ========================================================================

    pub(super) fn on_submit(mut self, commands: Vec<Bytes>, now: Timestamp) -> (Self, EngineOutput) {
        let mut output = EngineOutput::empty();
        let commands = commands.into_iter().map(Command::Opaque).collect();
        output.accepted = Some(self.submit_if_active(commands, now, &mut output));
        (self, output)
    }

    /// Submits a membership change against the current epoch.
    pub(super) fn on_reconfigure(
        mut self,
        change: MembershipChange,
        now: Timestamp,
    ) -> (Self, EngineOutput) {
        let mut output = EngineOutput::empty();
        let reconfig = Reconfiguration {
            change,
            expected_epoch: self.view.epoch(),
        };
        tracing::info!(
            node = %self.node_id,
            %change,
            epoch = %reconfig.expected_epoch,
            "submitting membership change"
        );
        output.accepted = Some(self.submit_if_active(
            vec![Command::Reconfigure(reconfig)],
            now,
            &mut output,
        ));
        (self, output)
    }

    fn submit_if_active(
        &mut self,
        commands: Vec<Command>,
        now: Timestamp,
        output: &mut EngineOutput,
    ) -> Result<BatchId, EngineError> {
        if !self.is_active() {
            tracing::debug!(
                node = %self.node_id,
                status = ?self.status(),
                connected = self.connected,
                "rejecting submission from inactive node"
            );
            return Err(EngineError::NodeInactive);
        }
        Ok(self.submit_batch(commands, now, output))
    }

    /// Queues a new batch of this node's and forwards it to every peer.
    fn submit_batch(
        &mut self,
        commands: Vec<Command>,
        now: Timestamp,
        output: &mut EngineOutput,
    ) -> BatchId {
        self.clock = self.clock.max(now);
        let id = BatchId::new(self.node_id, self.next_local_sequence);
        self.next_local_sequence += 1;

        let batch = Batch::new(id, self.clock, commands);
        self.scheduler.submit(batch.clone());
        output
            .messages
            .push(Message::broadcast(self.node_id, MessagePayload::Submit(batch)));

        tracing::debug!(node = %self.node_id, batch = %id, "batch submitted");
        id
    }

    /// Learns a batch forwarded by a peer.
    pub(super) fn on_submit_message(mut self, from: NodeId, batch: Batch) -> (Self, EngineOutput) {
        self.learn_pending(batch);
        tracing::trace!(node = %self.node_id, %from, "learned forwarded batch");
        (self, EngineOutput::empty())
    }

    /// Adds a batch to the scheduler unless it already committed.
    pub(super) fn learn_pending(&mut self, batch: Batch) {
        if self.status() != NodeStatus::Member || self.applied_index.contains(batch.id) {
            return;
        }
        self.scheduler.submit(batch);
    }

    /// Re-broadcasts this node's submissions that have not committed yet.
    ///
    /// A submission forwarded while peers were unreachable would otherwise
    /// only be known locally.
    pub(super) fn resubmit_pending(&self, output: &mut EngineOutput) {
        for batch in self.scheduler.pending_from(self.node_id) {
            output.messages.push(Message::broadcast(
                self.node_id,
                MessagePayload::Submit(batch.clone()),
            ));
        }
    }

    // ========================================================================
    // Slot Admission
    // ========================================================================

    /// Opens slots with this node's proposal, in order, up to
    /// `pipeline_depth` slots past the lowest undecided one.
    ///
    /// A slot is only opened when there is something to agree on: a local
    /// batch waiting for admission, or peer activity at or beyond it. The
    /// proposal is the scheduler head, or empty when nothing is waiting.
    pub(super) fn open_slots(&mut self, output: &mut EngineOutput) -> bool {
        if self.status() != NodeStatus::Member {
            return false;
        }

        let limit = self
            .lowest_undecided
            .saturating_add(self.config.pipeline_depth);
        let mut opened = false;

        while self.next_admitted < limit {
            let sequence = self.next_admitted;
            if sequence <= self.applied_through {
                self.next_admitted = self.applied_through.next();
                continue;
            }
            if !self.scheduler.has_admissible() && self.highest_active < sequence {
                break;
            }

            let phase = self.cache.get_or_create(sequence);
            if !phase.is_decided() && !phase.has_proposed() {
                let batch = self.scheduler.next_to_admit(sequence);
                tracing::debug!(
                    node = %self.node_id,
                    seq = %sequence,
                    batch = ?batch.as_ref().map(|b| b.id),
                    "opening slot"
                );
                phase.set_own_proposal(self.node_id, batch.clone());
                output.messages.push(Message::broadcast(
                    self.node_id,
                    MessagePayload::Proposal { sequence, batch },
                ));
                opened = true;
            }
            self.next_admitted = sequence.next();
        }
        opened
    }

    // ========================================================================
    // Learner Promotion
    // ========================================================================

    /// A synced learner asks to be promoted to voting member.
    ///
    /// Only one promotion is in flight at a time. If it is rejected (for
    /// example because the epoch moved) the next tick retries against the
    /// current epoch.
    pub(super) fn maybe_request_promotion(&mut self, output: &mut EngineOutput) {
        if self.status() != NodeStatus::Learner || self.pending_promotion.is_some() {
            return;
        }
        let reconfig = Reconfiguration {
            change: MembershipChange::PromoteNode(self.node_id),
            expected_epoch: self.view.epoch(),
        };
        let id = self.submit_batch(vec![Command::Reconfigure(reconfig)], self.clock, output);
        self.pending_promotion = Some(id);
        tracing::info!(
            node = %self.node_id,
            batch = %id,
            epoch = %reconfig.expected_epoch,
            "learner requesting promotion"
        );
    }
}
