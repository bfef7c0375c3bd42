//! Decisions and in-order application.
//!
//! Slots apply strictly in sequence order, without gaps. A decided `V1`
//! slot whose batch content is still unknown blocks application until the
//! content arrives.

use rabia_types::{Batch, BatchDigest, NodeId, SequenceNumber, StateValue};

use crate::cluster::{ClusterView, ReconfigError};
use crate::error::EngineError;
use crate::instrumentation::METRICS;
use crate::observer::Notification;
use crate::phase::Decision;
use crate::state_machine::StateMachine;

use super::{AppliedSlot, ConsensusEngine, EngineOutput, NodeStatus, SlotResolution};

impl<S: StateMachine> ConsensusEngine<S> {
    // ========================================================================
    // Incoming Decisions
    // ========================================================================

    pub(super) fn on_decision(
        mut self,
        from: NodeId,
        sequence: SequenceNumber,
        value: StateValue,
        digest: Option<BatchDigest>,
        batch: Option<Batch>,
    ) -> (Self, EngineOutput) {
        let mut output = EngineOutput::empty();
        if !self.synced || sequence <= self.applied_through {
            return (self, output);
        }
        if sequence > self.window_end() {
            self.request_catch_up(from, sequence, &mut output);
            return (self, output);
        }
        if !value.is_definite() || (value == StateValue::V1 && digest.is_none()) {
            tracing::warn!(node = %self.node_id, seq = %sequence, %from, %value, "malformed decision");
            return (self, output);
        }

        let phase = self.cache.get_or_create(sequence);
        if let Some(batch) = batch {
            phase.learn_batch(batch);
        }
        if let Some(existing) = phase.decision() {
            if existing.value != value {
                tracing::error!(
                    node = %self.node_id,
                    seq = %sequence,
                    %from,
                    local = %existing.value,
                    remote = %value,
                    "conflicting decision received; ignoring"
                );
            }
            return (self, output);
        }

        phase.decide(value, digest);
        METRICS.increment_decisions(value);
        tracing::debug!(node = %self.node_id, seq = %sequence, %from, %value, "slot decided by peer");
        self.refresh_lowest_undecided();
        (self, output)
    }

    // ========================================================================
    // Application
    // ========================================================================

    /// Applies every decided slot following `applied_through` whose content
    /// is available. Returns true if anything was applied.
    pub(super) fn apply_ready(&mut self, output: &mut EngineOutput) -> bool {
        let mut applied_any = false;
        loop {
            let sequence = self.applied_through.next();
            let Some(phase) = self.cache.peek(sequence) else {
                break;
            };
            let Some(decision) = phase.decision() else {
                break;
            };
            if phase.awaiting_batch() {
                break;
            }
            let batch = phase.decided_batch().cloned();
            let own_proposal = phase.own_proposal().flatten().map(|batch| batch.id);

            self.apply_slot(sequence, decision, batch.as_ref(), output);
            self.applied_through = sequence;
            applied_any = true;

            // Our proposal lost this slot; make it available again.
            if let Some(own) = own_proposal {
                if batch.as_ref().map(|batch| batch.id) != Some(own) {
                    self.scheduler.requeue(own);
                }
            }
        }
        if applied_any {
            self.refresh_lowest_undecided();
        }
        applied_any
    }

    fn apply_slot(
        &mut self,
        sequence: SequenceNumber,
        decision: Decision,
        batch: Option<&Batch>,
        output: &mut EngineOutput,
    ) {
        let resolution = match (decision.value, batch) {
            (StateValue::V1, Some(batch)) => self.apply_batch(sequence, batch, output),
            _ => {
                output
                    .notifications
                    .push(Notification::SlotSkipped { sequence });
                SlotResolution::Skipped
            }
        };

        if let Some(batch_id) = resolution.batch_id() {
            if self.pending_promotion == Some(batch_id) {
                self.pending_promotion = None;
            }
        }
        tracing::trace!(node = %self.node_id, seq = %sequence, ?resolution, "slot applied");
        output.slots.push(AppliedSlot {
            sequence,
            resolution,
        });
    }

    /// Applies one committed batch, all or nothing.
    fn apply_batch(
        &mut self,
        sequence: SequenceNumber,
        batch: &Batch,
        output: &mut EngineOutput,
    ) -> SlotResolution {
        self.scheduler.complete(batch.id);

        if self.applied_index.contains(batch.id) {
            METRICS.increment_batches_duplicate();
            tracing::debug!(node = %self.node_id, seq = %sequence, batch = %batch.id, "duplicate batch skipped");
            output
                .notifications
                .push(Notification::SlotSkipped { sequence });
            return SlotResolution::Duplicate { batch_id: batch.id };
        }

        // Validate every membership change before touching any state.
        let next_view = match self.fold_reconfigurations(batch) {
            Ok(next_view) => next_view,
            Err(error) => {
                self.applied_index.reject(batch.id, error);
                METRICS.increment_batches_rejected();
                tracing::warn!(
                    node = %self.node_id,
                    seq = %sequence,
                    batch = %batch.id,
                    %error,
                    "batch rejected"
                );
                output
                    .notifications
                    .push(Notification::SlotSkipped { sequence });
                return SlotResolution::Rejected {
                    batch_id: batch.id,
                    error: EngineError::from(error),
                };
            }
        };

        self.applied_index.insert(batch.id);
        let results = self.state_machine.apply(sequence, batch);
        METRICS.increment_batches_applied();
        output.notifications.push(Notification::BatchApplied {
            sequence,
            batch_id: batch.id,
        });

        if let Some(view) = next_view {
            self.install_view(sequence, view, output);
        }
        SlotResolution::Committed {
            batch_id: batch.id,
            results,
        }
    }

    /// Applies the batch's membership changes in order to a copy of the
    /// current view. `None` when the batch changes nothing.
    fn fold_reconfigurations(&self, batch: &Batch) -> Result<Option<ClusterView>, ReconfigError> {
        let mut view: Option<ClusterView> = None;
        for reconfig in batch.reconfigurations() {
            let next = view
                .as_ref()
                .unwrap_or(&self.view)
                .apply_reconfiguration(reconfig)?;
            view = Some(next);
        }
        Ok(view)
    }

    /// Makes `view` the membership for every slot after `sequence`.
    fn install_view(&mut self, sequence: SequenceNumber, view: ClusterView, output: &mut EngineOutput) {
        let before = self.status();
        tracing::info!(
            node = %self.node_id,
            seq = %sequence,
            old = %self.view,
            new = %view,
            "membership changed"
        );
        self.view = view;
        let after = self.status();
        if before != after {
            tracing::info!(node = %self.node_id, ?before, ?after, "node role changed");
        }
        if after == NodeStatus::Member && before != NodeStatus::Member {
            // A promoted learner starts proposing from the next slot.
            self.next_admitted = self.next_admitted.max(sequence.next());
        }
        output.notifications.push(Notification::ViewChanged {
            sequence,
            view: self.view.clone(),
        });
    }
}
