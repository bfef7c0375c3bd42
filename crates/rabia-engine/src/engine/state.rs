//! Engine state and the main `process` entry point.

use std::collections::BTreeMap;

use rabia_types::{BatchId, NodeId, SequenceNumber, Timestamp};

use crate::applied::AppliedIndex;
use crate::cache::PhaseCache;
use crate::cluster::ClusterView;
use crate::config::EngineConfig;
use crate::instrumentation::METRICS;
use crate::message::{Message, MessagePayload};
use crate::scheduler::BatchScheduler;
use crate::state_machine::StateMachine;

use super::{EngineHealth, EngineInput, EngineOutput, NodeStatus, PeerLiveness};

/// One node's consensus engine.
///
/// Generic over the replicated [`StateMachine`]. All fields are private;
/// observe progress through the accessors and the outputs of
/// [`ConsensusEngine::process`].
#[derive(Debug)]
pub struct ConsensusEngine<S> {
    // ========================================================================
    // Identity
    // ========================================================================
    pub(super) node_id: NodeId,
    pub(super) config: EngineConfig,

    // ========================================================================
    // Membership
    // ========================================================================
    /// View in effect for slot `applied_through + 1`.
    pub(super) view: ClusterView,

    /// False until a joining node has installed its first snapshot.
    pub(super) synced: bool,

    /// Nodes a joining node asks for a snapshot.
    pub(super) seeds: Vec<NodeId>,

    /// Operator-controlled connectivity flag.
    pub(super) connected: bool,

    // ========================================================================
    // Log Position
    // ========================================================================
    /// Highest slot applied to the state machine. Slots apply gap-free.
    pub(super) applied_through: SequenceNumber,

    /// Smallest slot above `applied_through` not yet decided locally.
    pub(super) lowest_undecided: SequenceNumber,

    /// Next slot this node will open with its own proposal.
    pub(super) next_admitted: SequenceNumber,

    /// Highest slot a peer proposed a batch for or voted on.
    pub(super) highest_active: SequenceNumber,

    // ========================================================================
    // Protocol State
    // ========================================================================
    pub(super) cache: PhaseCache,
    pub(super) scheduler: BatchScheduler,
    pub(super) applied_index: AppliedIndex,
    pub(super) state_machine: S,

    /// Local counter for batch ids. Not persisted.
    pub(super) next_local_sequence: u64,

    /// This node's in-flight `PromoteNode` batch while it is a learner.
    pub(super) pending_promotion: Option<BatchId>,

    // ========================================================================
    // Timers and Rate Limits
    // ========================================================================
    pub(super) tick: u64,
    pub(super) clock: Timestamp,
    pub(super) liveness: PeerLiveness,
    /// Tick before which no new catch-up request is sent.
    pub(super) catch_up_not_before: u64,
    /// Tick each peer last received a snapshot from this node.
    pub(super) snapshots_sent: BTreeMap<NodeId, u64>,
}

impl<S: StateMachine> ConsensusEngine<S> {
    /// Creates an engine for a founding member of `view`.
    pub fn new(node_id: NodeId, view: ClusterView, state_machine: S, config: EngineConfig) -> Self {
        tracing::info!(node = %node_id, %view, "starting consensus engine");
        Self::build(node_id, view, Vec::new(), true, state_machine, config)
    }

    /// Creates an engine for a node that is joining an existing cluster.
    ///
    /// The node stays in [`NodeStatus::Joining`] and periodically asks
    /// `seeds` for a snapshot. Members only answer once an `AddNode` for it
    /// has committed.
    ///
    /// # Panics
    ///
    /// Panics if `seeds` is empty.
    pub fn joining(
        node_id: NodeId,
        seeds: impl IntoIterator<Item = NodeId>,
        state_machine: S,
        config: EngineConfig,
    ) -> Self {
        let seeds: Vec<NodeId> = seeds.into_iter().filter(|id| *id != node_id).collect();
        assert!(!seeds.is_empty(), "a joining node needs at least one seed");
        tracing::info!(node = %node_id, seeds = ?seeds, "starting consensus engine as joiner");
        // Placeholder view until the first snapshot replaces it.
        let view = ClusterView::new(seeds.iter().copied());
        Self::build(node_id, view, seeds, false, state_machine, config)
    }

    fn build(
        node_id: NodeId,
        view: ClusterView,
        seeds: Vec<NodeId>,
        synced: bool,
        state_machine: S,
        config: EngineConfig,
    ) -> Self {
        let cache = PhaseCache::new(config.phase_cache_capacity);
        Self {
            node_id,
            config,
            view,
            synced,
            seeds,
            connected: true,
            applied_through: SequenceNumber::ZERO,
            lowest_undecided: SequenceNumber::FIRST,
            next_admitted: SequenceNumber::FIRST,
            highest_active: SequenceNumber::ZERO,
            cache,
            scheduler: BatchScheduler::new(),
            applied_index: AppliedIndex::new(),
            state_machine,
            next_local_sequence: 0,
            pending_promotion: None,
            tick: 0,
            clock: Timestamp::EPOCH,
            liveness: PeerLiveness::new(),
            catch_up_not_before: 0,
            snapshots_sent: BTreeMap::new(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Membership in effect for the next slot to apply.
    pub fn view(&self) -> &ClusterView {
        &self.view
    }

    pub fn applied_through(&self) -> SequenceNumber {
        self.applied_through
    }

    pub fn lowest_undecided(&self) -> SequenceNumber {
        self.lowest_undecided
    }

    pub fn state_machine(&self) -> &S {
        &self.state_machine
    }

    pub fn applied_index(&self) -> &AppliedIndex {
        &self.applied_index
    }

    pub fn cached_phases(&self) -> usize {
        self.cache.len()
    }

    pub fn pending_batches(&self) -> usize {
        self.scheduler.pending_len()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn status(&self) -> NodeStatus {
        if !self.synced {
            NodeStatus::Joining
        } else if self.view.is_member(self.node_id) {
            NodeStatus::Member
        } else if self.view.is_learner(self.node_id) {
            NodeStatus::Learner
        } else {
            NodeStatus::Removed
        }
    }

    /// Connected and a voting member of the current view.
    pub fn is_active(&self) -> bool {
        self.connected && self.status() == NodeStatus::Member
    }

    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            node_id: self.node_id,
            status: self.status(),
            connected: self.connected,
            epoch: self.view.epoch(),
            applied_through: self.applied_through,
            lowest_undecided: self.lowest_undecided,
            quorum_size: self.view.quorum_size(),
            reachable_members: self.liveness.reachable_members(
                &self.view,
                self.node_id,
                self.tick,
                self.config.peer_timeout_ticks,
            ),
            pending_batches: self.scheduler.pending_len(),
            cached_phases: self.cache.len(),
        }
    }

    // ========================================================================
    // Event Processing (Main Entry Point)
    // ========================================================================

    /// Processes an input and returns the new state and output.
    ///
    /// Every state transition goes through this method. It takes ownership
    /// of `self`; the caller executes the output (sends messages, completes
    /// waiters, dispatches notifications).
    pub fn process(self, input: EngineInput) -> (Self, EngineOutput) {
        let (mut engine, mut output) = match input {
            EngineInput::Submit { commands, now } => self.on_submit(commands, now),
            EngineInput::Reconfigure { change, now } => self.on_reconfigure(change, now),
            EngineInput::Message(msg) => self.on_message(msg),
            EngineInput::Tick { now } => self.on_tick(now),
            EngineInput::Sweep => self.on_sweep(),
            EngineInput::SetConnected(connected) => self.on_set_connected(connected),
        };

        engine.drive(&mut output);
        METRICS.add_messages_sent(output.messages.len() as u64);
        (engine, output)
    }

    /// Handles an incoming message.
    fn on_message(mut self, msg: Message) -> (Self, EngineOutput) {
        if msg.from == self.node_id {
            return (self, EngineOutput::empty());
        }
        if let Some(to) = msg.to {
            if to != self.node_id {
                return (self, EngineOutput::empty());
            }
        }

        METRICS.increment_messages_received();
        self.liveness.heard(msg.from, self.tick);
        let from = msg.from;

        match msg.payload {
            MessagePayload::Submit(batch) => self.on_submit_message(from, batch),
            MessagePayload::Proposal { sequence, batch } => {
                self.on_proposal(from, sequence, batch)
            }
            MessagePayload::Vote {
                sequence,
                attempt,
                round,
                value,
                candidate,
            } => self.on_vote(from, sequence, attempt, round, value, candidate),
            MessagePayload::Decision {
                sequence,
                value,
                digest,
                batch,
            } => self.on_decision(from, sequence, value, digest, batch),
            MessagePayload::Heartbeat {
                applied_through,
                epoch,
            } => self.on_heartbeat(from, applied_through, epoch),
            MessagePayload::DecisionRequest { from: start, through } => {
                self.on_decision_request(from, start, through)
            }
            MessagePayload::SnapshotRequest { applied_through } => {
                self.on_snapshot_request(from, applied_through)
            }
            MessagePayload::SnapshotResponse(transfer) => self.on_snapshot_response(from, transfer),
        }
    }

    /// Handles a periodic tick.
    ///
    /// - Broadcasts heartbeats
    /// - Retransmits proposals and votes of open slots
    /// - Re-broadcasts this node's uncommitted submissions
    /// - Drives joining and promotion
    fn on_tick(mut self, now: Timestamp) -> (Self, EngineOutput) {
        let mut output = EngineOutput::empty();
        self.tick += 1;
        self.clock = self.clock.max(now);

        if self.tick % self.config.heartbeat_interval_ticks == 0 {
            output.messages.push(self.heartbeat());
        }
        if self.tick % self.config.retransmit_interval_ticks == 0 {
            self.retransmit(&mut output);
            self.request_missing_batches(&mut output);
            if !self.synced {
                self.request_snapshot_from_seeds(&mut output);
            }
        }
        if self.tick % self.config.resubmit_interval_ticks == 0 {
            self.resubmit_pending(&mut output);
        }
        self.maybe_request_promotion(&mut output);

        (self, output)
    }

    /// Evicts applied slots beyond the cache capacity.
    fn on_sweep(mut self) -> (Self, EngineOutput) {
        let evicted = self.cache.evict(self.applied_through);
        if !evicted.is_empty() {
            METRICS.add_evictions(evicted.len() as u64);
            tracing::debug!(
                node = %self.node_id,
                evicted = evicted.len(),
                cached = self.cache.len(),
                "evicted applied slots"
            );
        }
        let cooldown = self.config.snapshot_cooldown_ticks;
        let tick = self.tick;
        self.snapshots_sent
            .retain(|_, sent| tick.saturating_sub(*sent) < cooldown);
        self.liveness.retain_view(&self.view);
        (self, EngineOutput::empty())
    }

    fn on_set_connected(mut self, connected: bool) -> (Self, EngineOutput) {
        if self.connected != connected {
            tracing::info!(node = %self.node_id, connected, "connectivity changed");
        }
        self.connected = connected;
        (self, EngineOutput::empty())
    }

    // ========================================================================
    // Progress
    // ========================================================================

    /// Runs every local step that became possible until nothing changes:
    /// applying decided slots, advancing the votable slot, opening new
    /// slots.
    fn drive(&mut self, output: &mut EngineOutput) {
        loop {
            let applied = self.apply_ready(output);
            let advanced = self.advance_votable(output);
            let opened = self.open_slots(output);
            if !(applied || advanced || opened) {
                break;
            }
        }
    }

    /// Moves `lowest_undecided` past slots decided locally.
    pub(super) fn refresh_lowest_undecided(&mut self) {
        let mut sequence = self.lowest_undecided.max(self.applied_through.next());
        while self
            .cache
            .peek(sequence)
            .is_some_and(|phase| phase.is_decided())
        {
            sequence = sequence.next();
        }
        self.lowest_undecided = sequence;
    }

    /// Messages for slots beyond this bound are not cached.
    pub(super) fn window_end(&self) -> SequenceNumber {
        self.lowest_undecided
            .saturating_add(self.config.max_future_slots)
    }

    /// Membership for `sequence`, if this node knows it yet.
    ///
    /// Only the slot right after `applied_through` has a known view; a
    /// committed reconfiguration may change membership for any later one.
    pub(super) fn view_for(&self, sequence: SequenceNumber) -> Option<&ClusterView> {
        (sequence == self.applied_through.next()).then_some(&self.view)
    }

    fn heartbeat(&self) -> Message {
        Message::broadcast(
            self.node_id,
            MessagePayload::Heartbeat {
                applied_through: self.applied_through,
                epoch: self.view.epoch(),
            },
        )
    }
}
