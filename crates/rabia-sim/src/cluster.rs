//! Simulated cluster: engines wired to a [`SimNetwork`] and driven by a
//! discrete tick clock.
//!
//! ```text
//!   tick ──► Tick (and Sweep) to every node
//!         ──► deliver every message due at this tick
//!              └─► outputs: messages back into the network,
//!                           applied slots into the invariant checkers
//! ```
//!
//! Every slot any node applies is fed through the agreement, prefix and
//! integrity checkers; the first violation aborts the run with
//! [`SimError::InvariantViolation`].

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use rabia_engine::{
    BatchOutcome, ClusterView, ConsensusEngine, EngineConfig, EngineError, EngineInput, EngineOutput,
    KvCommand, KvStateMachine, Notification, SlotResolution,
};
use rabia_types::{BatchId, MembershipChange, NodeId, SequenceNumber, Timestamp};

use crate::error::SimError;
use crate::invariants::{AgreementChecker, IntegrityChecker, InvariantResult, PrefixChecker};
use crate::network::{NetworkConfig, NetworkStats, SimNetwork};
use crate::rng::SimRng;

/// Simulated nanoseconds per tick.
const TICK_NANOS: u64 = 1_000_000;

/// Upper bound on deliveries within one tick before the run is declared a
/// message storm.
const MAX_DELIVERIES_PER_TICK: u64 = 500_000;

/// Outcome of a submission, as its submitting node saw it.
pub type SubmissionOutcome = Result<BatchOutcome, EngineError>;

/// Configuration for a simulated cluster.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub nodes: u64,
    pub seed: u64,
    pub engine: EngineConfig,
    pub network: NetworkConfig,
}

impl SimConfig {
    pub fn new(nodes: u64, seed: u64) -> Self {
        Self {
            nodes,
            seed,
            engine: EngineConfig::testing(),
            network: NetworkConfig::default(),
        }
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }
}

/// Summary counters for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimStats {
    pub ticks: u64,
    pub decided_slots: usize,
    pub agreement_checks: u64,
    pub network: NetworkStats,
}

pub struct SimCluster {
    engines: BTreeMap<NodeId, ConsensusEngine<KvStateMachine>>,
    engine_config: EngineConfig,
    network: SimNetwork,
    rng: SimRng,
    tick: u64,
    disconnected: BTreeSet<NodeId>,
    agreement: AgreementChecker,
    prefix: PrefixChecker,
    integrity: IntegrityChecker,
    outcomes: BTreeMap<BatchId, SubmissionOutcome>,
    snapshot_restores: BTreeMap<NodeId, u64>,
}

impl SimCluster {
    pub fn new(config: SimConfig) -> Self {
        let view = ClusterView::new((1..=config.nodes).map(NodeId::new));
        let mut network = SimNetwork::new(config.network);
        let mut engines = BTreeMap::new();
        for id in view.members() {
            network.register_node(id);
            let engine = ConsensusEngine::new(
                id,
                view.clone(),
                KvStateMachine::new(),
                config.engine.clone(),
            );
            engines.insert(id, engine);
        }
        tracing::info!(nodes = config.nodes, seed = config.seed, "starting simulated cluster");

        Self {
            engines,
            engine_config: config.engine,
            network,
            rng: SimRng::new(config.seed),
            tick: 0,
            disconnected: BTreeSet::new(),
            agreement: AgreementChecker::new(),
            prefix: PrefixChecker::new(),
            integrity: IntegrityChecker::new(),
            outcomes: BTreeMap::new(),
            snapshot_restores: BTreeMap::new(),
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.engines.keys().copied()
    }

    pub fn engine(&self, node: NodeId) -> Result<&ConsensusEngine<KvStateMachine>, SimError> {
        self.engines.get(&node).ok_or(SimError::UnknownNode(node))
    }

    /// Reads `key` from a node's state machine.
    pub fn get(&self, node: NodeId, key: &str) -> Option<Bytes> {
        self.engines
            .get(&node)?
            .state_machine()
            .get(key.as_bytes())
            .cloned()
    }

    /// The result the submitting node observed, once the batch resolved.
    pub fn outcome(&self, batch: BatchId) -> Option<&SubmissionOutcome> {
        self.outcomes.get(&batch)
    }

    /// True once every listed node has applied (or skipped as rejected)
    /// `batch`.
    pub fn applied_on(&self, batch: BatchId, nodes: &[NodeId]) -> bool {
        nodes.iter().all(|node| {
            self.engines
                .get(node)
                .is_some_and(|engine| engine.applied_index().contains(batch))
        })
    }

    pub fn applied_through(&self, node: NodeId) -> SequenceNumber {
        self.engines
            .get(&node)
            .map_or(SequenceNumber::ZERO, ConsensusEngine::applied_through)
    }

    /// How many snapshots `node` has restored.
    pub fn snapshot_restores(&self, node: NodeId) -> u64 {
        self.snapshot_restores.get(&node).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> SimStats {
        SimStats {
            ticks: self.tick,
            decided_slots: self.agreement.decided_slots(),
            agreement_checks: self.agreement.checks_performed(),
            network: self.network.stats(),
        }
    }

    pub fn network_mut(&mut self) -> &mut SimNetwork {
        &mut self.network
    }

    // ========================================================================
    // Client Operations
    // ========================================================================

    pub fn submit(&mut self, node: NodeId, commands: Vec<Bytes>) -> Result<BatchId, SimError> {
        let now = self.now();
        let output = self.step(node, EngineInput::Submit { commands, now })?;
        Ok(output?)
    }

    /// Submits a single key/value put.
    pub fn put(&mut self, node: NodeId, key: &str, value: &str) -> Result<BatchId, SimError> {
        let command = KvCommand::put(key.to_owned(), value.to_owned())
            .encode()
            .map_err(|error| SimError::InvariantViolation {
                message: format!("failed to encode kv command: {error}"),
                tick: self.tick,
            })?;
        self.submit(node, vec![command])
    }

    /// Starts `node` as a joiner and submits its addition through `via`.
    ///
    /// The new node restores a snapshot and is promoted automatically once
    /// the addition commits.
    pub fn add_node(&mut self, via: NodeId, node: NodeId) -> Result<BatchId, SimError> {
        if self.engines.contains_key(&node) {
            return Err(SimError::NodeExists(node));
        }
        let seeds: Vec<NodeId> = self.engine(via)?.view().members().collect();
        let joiner = ConsensusEngine::joining(
            node,
            seeds,
            KvStateMachine::new(),
            self.engine_config.clone(),
        );
        self.network.register_node(node);
        self.engines.insert(node, joiner);
        tracing::info!(%node, %via, tick = self.tick, "adding node");

        self.reconfigure(via, MembershipChange::AddNode(node))
    }

    pub fn remove_node(&mut self, via: NodeId, node: NodeId) -> Result<BatchId, SimError> {
        tracing::info!(%node, %via, tick = self.tick, "removing node");
        self.reconfigure(via, MembershipChange::RemoveNode(node))
    }

    fn reconfigure(&mut self, via: NodeId, change: MembershipChange) -> Result<BatchId, SimError> {
        let now = self.now();
        let accepted = self.step(via, EngineInput::Reconfigure { change, now })?;
        Ok(accepted?)
    }

    // ========================================================================
    // Faults
    // ========================================================================

    /// Cuts `node` off the network and tells its engine it is disconnected.
    pub fn disconnect(&mut self, node: NodeId) -> Result<(), SimError> {
        self.network.isolate(node);
        self.disconnected.insert(node);
        self.step(node, EngineInput::SetConnected(false))?;
        Ok(())
    }

    pub fn reconnect(&mut self, node: NodeId) -> Result<(), SimError> {
        self.disconnected.remove(&node);
        // Keep partitions involving other disconnected nodes in place.
        self.network.reconnect(node);
        for other in self.disconnected.clone() {
            self.network.isolate(other);
        }
        self.step(node, EngineInput::SetConnected(true))?;
        Ok(())
    }

    pub fn partition(&mut self, group_a: &[NodeId], group_b: &[NodeId]) {
        self.network.partition(group_a, group_b);
    }

    /// Removes every partition, including disconnections.
    pub fn heal(&mut self) -> Result<(), SimError> {
        self.network.heal();
        for node in std::mem::take(&mut self.disconnected) {
            self.step(node, EngineInput::SetConnected(true))?;
        }
        Ok(())
    }

    // ========================================================================
    // Execution
    // ========================================================================

    pub fn run_ticks(&mut self, ticks: u64) -> Result<(), SimError> {
        for _ in 0..ticks {
            self.advance()?;
        }
        Ok(())
    }

    /// Runs until `condition` holds, for at most `max_ticks`.
    ///
    /// Returns the number of ticks it took.
    pub fn run_until(
        &mut self,
        max_ticks: u64,
        description: &str,
        condition: impl Fn(&Self) -> bool,
    ) -> Result<u64, SimError> {
        for elapsed in 0..=max_ticks {
            if condition(self) {
                return Ok(elapsed);
            }
            if elapsed < max_ticks {
                self.advance()?;
            }
        }
        Err(SimError::Stalled {
            description: description.to_owned(),
            ticks: max_ticks,
        })
    }

    fn now(&self) -> Timestamp {
        Timestamp::from_nanos(self.tick * TICK_NANOS)
    }

    /// One tick: timers on every node, then every due delivery.
    fn advance(&mut self) -> Result<(), SimError> {
        self.tick += 1;
        let now = self.now();
        let sweep = self.tick % self.engine_config.sweep_interval_ticks == 0;

        let nodes: Vec<NodeId> = self.engines.keys().copied().collect();
        for node in nodes {
            self.step(node, EngineInput::Tick { now })?;
            if sweep {
                self.step(node, EngineInput::Sweep)?;
            }
        }

        let mut deliveries = 0_u64;
        while let Some((to, message)) = self.network.next_ready(self.tick) {
            deliveries += 1;
            if deliveries > MAX_DELIVERIES_PER_TICK {
                return Err(SimError::InvariantViolation {
                    message: format!("message storm: over {MAX_DELIVERIES_PER_TICK} deliveries"),
                    tick: self.tick,
                });
            }
            if self.engines.contains_key(&to) {
                self.step(to, EngineInput::Message(message))?;
            }
        }

        self.check(self.prefix.check())
    }

    /// Feeds one input to a node and routes its output.
    ///
    /// Returns the submission verdict for `Submit` and `Reconfigure`.
    fn step(
        &mut self,
        node: NodeId,
        input: EngineInput,
    ) -> Result<Result<BatchId, EngineError>, SimError> {
        let engine = self.engines.remove(&node).ok_or(SimError::UnknownNode(node))?;
        let (engine, output) = engine.process(input);
        self.engines.insert(node, engine);
        self.route(node, output)
    }

    fn route(
        &mut self,
        node: NodeId,
        output: EngineOutput,
    ) -> Result<Result<BatchId, EngineError>, SimError> {
        for notification in &output.notifications {
            if let Notification::SnapshotRestored { applied_through } = notification {
                self.prefix.record_snapshot(node, *applied_through);
                *self.snapshot_restores.entry(node).or_insert(0) += 1;
            }
        }

        for slot in &output.slots {
            let agreement = self.agreement.record(node, slot);
            self.check(agreement)?;
            let prefix = self.prefix.record(node, slot);
            self.check(prefix)?;
            let integrity = self.integrity.record(node, slot);
            self.check(integrity)?;

            let outcome = match &slot.resolution {
                SlotResolution::Committed { batch_id, results } => {
                    Some((*batch_id, Ok(BatchOutcome::Applied(results.clone()))))
                }
                SlotResolution::Rejected { batch_id, error } => {
                    Some((*batch_id, Err(error.clone())))
                }
                SlotResolution::Duplicate { .. } | SlotResolution::Skipped => None,
            };
            if let Some((batch_id, result)) = outcome {
                if batch_id.submitter == node {
                    self.outcomes.entry(batch_id).or_insert(result);
                }
            }
        }
        for (batch_id, result) in output.resolved_via_snapshot {
            self.outcomes.entry(batch_id).or_insert(result);
        }

        for message in output.messages {
            self.network.send(message, self.tick, &mut self.rng);
        }

        Ok(output.accepted.unwrap_or(Err(EngineError::NodeInactive)))
    }

    fn check(&self, result: InvariantResult) -> Result<(), SimError> {
        match result {
            InvariantResult::Ok => Ok(()),
            InvariantResult::Violated { invariant, message } => {
                tracing::error!(invariant, %message, tick = self.tick, "invariant violated");
                Err(SimError::InvariantViolation {
                    message: format!("{invariant}: {message}"),
                    tick: self.tick,
                })
            }
        }
    }
}
