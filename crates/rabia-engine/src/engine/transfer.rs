//! Catch-up and state transfer.
//!
//! A node that falls behind first asks peers for the decisions it missed
//! ([`MessagePayload::DecisionRequest`]). When a peer has already evicted
//! those slots it answers with a full [`SnapshotTransfer`] instead. Joining
//! nodes always start from a snapshot.

use rabia_types::{Epoch, NodeId, SequenceNumber, StateValue};

use crate::error::EngineError;
use crate::instrumentation::METRICS;
use crate::message::{Message, MessagePayload, SnapshotTransfer};
use crate::observer::Notification;
use crate::state_machine::StateMachine;

use super::{BatchOutcome, ConsensusEngine, EngineOutput, NodeStatus};

impl<S: StateMachine> ConsensusEngine<S> {
    // ========================================================================
    // Heartbeats
    // ========================================================================

    pub(super) fn on_heartbeat(
        mut self,
        from: NodeId,
        applied_through: SequenceNumber,
        epoch: Epoch,
    ) -> (Self, EngineOutput) {
        let mut output = EngineOutput::empty();
        if self.synced && applied_through > self.applied_through {
            tracing::trace!(
                node = %self.node_id,
                peer = %from,
                peer_applied = %applied_through,
                peer_epoch = %epoch,
                "peer is ahead"
            );
            self.request_catch_up(from, applied_through, &mut output);
        }
        (self, output)
    }

    /// Asks `peer` for decisions after `applied_through`, up to
    /// `catch_up_batch` of them. Rate-limited to one request per
    /// retransmission interval.
    pub(super) fn request_catch_up(
        &mut self,
        peer: NodeId,
        peer_progress: SequenceNumber,
        output: &mut EngineOutput,
    ) {
        if !self.synced || self.tick < self.catch_up_not_before {
            return;
        }
        let from = self.applied_through.next();
        let through = peer_progress.min(self.applied_through.saturating_add(self.config.catch_up_batch));
        if through < from {
            return;
        }

        self.catch_up_not_before = self.tick + self.config.retransmit_interval_ticks;
        METRICS.increment_catch_up_requests();
        tracing::debug!(node = %self.node_id, %peer, %from, %through, "requesting catch-up");
        output.messages.push(Message::targeted(
            self.node_id,
            peer,
            MessagePayload::DecisionRequest { from, through },
        ));
    }

    /// Asks every peer for slots that decided `V1` but whose batch never
    /// arrived.
    pub(super) fn request_missing_batches(&self, output: &mut EngineOutput) {
        for sequence in self.cache.sequences() {
            let awaiting = self
                .cache
                .peek(sequence)
                .is_some_and(|phase| phase.awaiting_batch());
            if awaiting {
                output.messages.push(Message::broadcast(
                    self.node_id,
                    MessagePayload::DecisionRequest {
                        from: sequence,
                        through: sequence,
                    },
                ));
            }
        }
    }

    // ========================================================================
    // Serving Decisions
    // ========================================================================

    pub(super) fn on_decision_request(
        mut self,
        requester: NodeId,
        from: SequenceNumber,
        through: SequenceNumber,
    ) -> (Self, EngineOutput) {
        let mut output = EngineOutput::empty();
        if !self.synced {
            return (self, output);
        }
        let last = through.min(from.saturating_add(self.config.catch_up_batch.saturating_sub(1)));

        let mut sequence = from;
        while sequence <= last {
            match self.decision_reply(requester, sequence) {
                Some(reply) => output.messages.push(reply),
                None => {
                    if sequence <= self.applied_through {
                        // Applied but no longer cached.
                        self.send_snapshot(requester, &mut output);
                    }
                    break;
                }
            }
            sequence = sequence.next();
        }
        (self, output)
    }

    /// A `Decision` for `sequence` addressed to `to`, if this node has one
    /// cached.
    pub(super) fn decision_reply(&self, to: NodeId, sequence: SequenceNumber) -> Option<Message> {
        let phase = self.cache.peek(sequence)?;
        let decision = phase.decision()?;
        let batch = match decision.value {
            StateValue::V1 => phase.decided_batch().cloned(),
            _ => None,
        };
        Some(Message::targeted(
            self.node_id,
            to,
            MessagePayload::Decision {
                sequence,
                value: decision.value,
                digest: decision.digest,
                batch,
            },
        ))
    }

    /// Answers a peer still working on a slot this node already applied.
    pub(super) fn answer_settled(
        &mut self,
        peer: NodeId,
        sequence: SequenceNumber,
        output: &mut EngineOutput,
    ) {
        match self.decision_reply(peer, sequence) {
            Some(reply) => output.messages.push(reply),
            None => self.send_snapshot(peer, output),
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Sends a full snapshot to `peer`, at most once per cooldown.
    pub(super) fn send_snapshot(&mut self, peer: NodeId, output: &mut EngineOutput) {
        if !self.synced {
            return;
        }
        if let Some(sent) = self.snapshots_sent.get(&peer) {
            if self.tick < sent + self.config.snapshot_cooldown_ticks {
                return;
            }
        }

        let state = match self.state_machine.snapshot() {
            Ok(state) => state,
            Err(error) => {
                tracing::error!(node = %self.node_id, %peer, %error, "failed to snapshot state machine");
                return;
            }
        };
        let transfer = SnapshotTransfer {
            applied_through: self.applied_through,
            view: self.view.clone(),
            applied_index: self.applied_index.clone(),
            state,
        };

        self.snapshots_sent.insert(peer, self.tick);
        METRICS.increment_snapshots_sent();
        tracing::info!(
            node = %self.node_id,
            %peer,
            applied_through = %self.applied_through,
            bytes = transfer.state.len(),
            "sending snapshot"
        );
        output.messages.push(Message::targeted(
            self.node_id,
            peer,
            MessagePayload::SnapshotResponse(transfer),
        ));
    }

    pub(super) fn request_snapshot_from_seeds(&self, output: &mut EngineOutput) {
        for seed in &self.seeds {
            output.messages.push(Message::targeted(
                self.node_id,
                *seed,
                MessagePayload::SnapshotRequest {
                    applied_through: self.applied_through,
                },
            ));
        }
    }

    /// Serves a snapshot to a node that is part of the view and behind.
    pub(super) fn on_snapshot_request(
        mut self,
        requester: NodeId,
        applied_through: SequenceNumber,
    ) -> (Self, EngineOutput) {
        let mut output = EngineOutput::empty();
        if self.status() != NodeStatus::Member {
            return (self, output);
        }
        if !self.view.contains(requester) {
            tracing::debug!(node = %self.node_id, %requester, "snapshot request from unknown node");
            return (self, output);
        }
        if applied_through < self.applied_through {
            self.send_snapshot(requester, &mut output);
        }
        (self, output)
    }

    /// Installs a snapshot that is ahead of local state.
    pub(super) fn on_snapshot_response(
        mut self,
        from: NodeId,
        transfer: SnapshotTransfer,
    ) -> (Self, EngineOutput) {
        let mut output = EngineOutput::empty();
        if self.synced && transfer.applied_through <= self.applied_through {
            return (self, output);
        }
        if let Err(error) = self.state_machine.restore(&transfer.state) {
            tracing::error!(node = %self.node_id, %from, %error, "failed to restore snapshot");
            return (self, output);
        }

        let applied_through = transfer.applied_through;
        tracing::info!(
            node = %self.node_id,
            %from,
            from_seq = %self.applied_through,
            to_seq = %applied_through,
            view = %transfer.view,
            "installed snapshot"
        );

        self.applied_through = applied_through;
        self.view = transfer.view;
        self.applied_index = transfer.applied_index;
        self.synced = true;
        self.cache.remove_through(applied_through);
        self.lowest_undecided = self.lowest_undecided.max(applied_through.next());
        self.next_admitted = self.next_admitted.max(applied_through.next());
        self.refresh_lowest_undecided();

        let covered = self.scheduler.reconcile(&self.applied_index, applied_through);
        if let Some(pending) = self.pending_promotion {
            if self.applied_index.contains(pending) {
                self.pending_promotion = None;
            }
        }
        output.resolved_via_snapshot = covered
            .into_iter()
            .filter(|id| id.submitter == self.node_id)
            .map(|id| {
                let outcome = match self.applied_index.rejection(id) {
                    Some(error) => Err(EngineError::from(error)),
                    None => Ok(BatchOutcome::Installed),
                };
                (id, outcome)
            })
            .collect();

        METRICS.increment_snapshots_restored();
        output
            .notifications
            .push(Notification::SnapshotRestored { applied_through });
        output.notifications.push(Notification::ViewChanged {
            sequence: applied_through,
            view: self.view.clone(),
        });
        (self, output)
    }
}
