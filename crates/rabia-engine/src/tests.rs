//! Integration tests for rabia-engine.
//!
//! These tests drive several engines through an in-memory message queue
//! and exercise the protocol end to end: submission, voting, application,
//! catch-up, snapshots and membership changes.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use bytes::Bytes;
use rabia_types::{
    Batch, BatchId, Command, Epoch, MembershipChange, NodeId, Reconfiguration, SequenceNumber,
    StateValue, Timestamp,
};

use crate::{
    AppliedSlot, BatchOutcome, ClusterView, ConsensusEngine, EngineConfig, EngineError, EngineInput,
    EngineOutput, KvCommand, KvStateMachine, Message, MessagePayload, NodeStatus, Notification,
    SlotResolution,
};

// ============================================================================
// Helper Functions
// ============================================================================

fn node(id: u64) -> NodeId {
    NodeId::new(id)
}

fn seq(n: u64) -> SequenceNumber {
    SequenceNumber::new(n)
}

fn put(key: &str, value: &str) -> Bytes {
    KvCommand::put(key.to_owned(), value.to_owned())
        .encode()
        .expect("encode kv command")
}

fn kv_batch(submitter: u64, local: u64, key: &str, value: &str) -> Batch {
    Batch::new(
        BatchId::new(node(submitter), local),
        Timestamp::from_nanos(local + 1),
        vec![Command::Opaque(put(key, value))],
    )
}

fn decision(from: u64, sequence: u64, batch: Option<Batch>) -> EngineInput {
    let (value, digest) = match &batch {
        Some(batch) => (StateValue::V1, Some(batch.digest())),
        None => (StateValue::V0, None),
    };
    EngineInput::Message(Message::targeted(
        node(from),
        node(1),
        MessagePayload::Decision {
            sequence: seq(sequence),
            value,
            digest,
            batch,
        },
    ))
}

fn single_engine(config: EngineConfig) -> ConsensusEngine<KvStateMachine> {
    let view = ClusterView::new((1..=3).map(NodeId::new));
    ConsensusEngine::new(node(1), view, KvStateMachine::new(), config)
}

fn feed(
    engine: ConsensusEngine<KvStateMachine>,
    input: EngineInput,
) -> (ConsensusEngine<KvStateMachine>, EngineOutput) {
    engine.process(input)
}

/// In-memory cluster: FIFO delivery, optional node outages.
struct Harness {
    engines: BTreeMap<NodeId, ConsensusEngine<KvStateMachine>>,
    queue: VecDeque<Message>,
    down: BTreeSet<NodeId>,
    applied: BTreeMap<NodeId, Vec<AppliedSlot>>,
    now: u64,
    ticks: u64,
}

impl Harness {
    fn new(size: u64) -> Self {
        let view = ClusterView::new((1..=size).map(NodeId::new));
        let engines = (1..=size)
            .map(|id| {
                let engine = ConsensusEngine::new(
                    node(id),
                    view.clone(),
                    KvStateMachine::new(),
                    EngineConfig::testing(),
                );
                (node(id), engine)
            })
            .collect();
        Self {
            engines,
            queue: VecDeque::new(),
            down: BTreeSet::new(),
            applied: BTreeMap::new(),
            now: 0,
            ticks: 0,
        }
    }

    fn step(&mut self, id: NodeId, input: EngineInput) -> EngineOutput {
        let engine = self.engines.remove(&id).expect("node exists");
        let (engine, output) = engine.process(input);
        self.engines.insert(id, engine);
        self.applied
            .entry(id)
            .or_default()
            .extend(output.slots.iter().cloned());
        self.queue.extend(output.messages.iter().cloned());
        output
    }

    fn submit(&mut self, id: u64, key: &str, value: &str) -> Result<BatchId, EngineError> {
        self.now += 1;
        let output = self.step(
            node(id),
            EngineInput::Submit {
                commands: vec![put(key, value)],
                now: Timestamp::from_nanos(self.now),
            },
        );
        output.accepted.expect("submission is answered")
    }

    fn deliver_all(&mut self) {
        let mut budget = 200_000_u32;
        while let Some(msg) = self.queue.pop_front() {
            budget -= 1;
            assert!(budget > 0, "message storm");
            if self.down.contains(&msg.from) {
                continue;
            }
            let targets: Vec<NodeId> = match msg.to {
                Some(to) => vec![to],
                None => self
                    .engines
                    .keys()
                    .copied()
                    .filter(|id| *id != msg.from)
                    .collect(),
            };
            for target in targets {
                if self.down.contains(&target) || !self.engines.contains_key(&target) {
                    continue;
                }
                self.step(target, EngineInput::Message(msg.clone()));
            }
        }
    }

    fn run(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.ticks += 1;
            self.now += 1;
            let ids: Vec<NodeId> = self.engines.keys().copied().collect();
            for id in ids {
                self.step(
                    id,
                    EngineInput::Tick {
                        now: Timestamp::from_nanos(self.now),
                    },
                );
                if self.ticks % 5 == 0 {
                    self.step(id, EngineInput::Sweep);
                }
            }
            self.deliver_all();
        }
    }

    fn engine(&self, id: u64) -> &ConsensusEngine<KvStateMachine> {
        &self.engines[&node(id)]
    }

    fn value(&self, id: u64, key: &str) -> Option<Bytes> {
        self.engine(id).state_machine().get(key.as_bytes()).cloned()
    }

    fn committed(&self, id: u64) -> Vec<(SequenceNumber, BatchId)> {
        self.applied
            .get(&node(id))
            .into_iter()
            .flatten()
            .filter_map(|slot| match &slot.resolution {
                SlotResolution::Committed { batch_id, .. } => Some((slot.sequence, *batch_id)),
                _ => None,
            })
            .collect()
    }
}

// ============================================================================
// Normal Operation
// ============================================================================

#[test]
fn three_nodes_commit_a_single_batch() {
    let mut h = Harness::new(3);
    let id = h.submit(1, "x", "1").expect("accepted");
    h.deliver_all();

    for n in 1..=3 {
        assert_eq!(h.value(n, "x"), Some(Bytes::from("1")), "node {n}");
        assert_eq!(h.committed(n), vec![(seq(1), id)], "node {n}");
        assert_eq!(h.engine(n).applied_through(), seq(1));
    }
}

#[test]
fn concurrent_submissions_commit_exactly_once_in_one_order() {
    let mut h = Harness::new(3);
    let a = h.submit(1, "a", "1").expect("accepted");
    let b = h.submit(2, "b", "2").expect("accepted");
    let c = h.submit(3, "c", "3").expect("accepted");
    h.deliver_all();
    h.run(40);

    let reference = h.committed(1);
    let ids: BTreeSet<BatchId> = reference.iter().map(|(_, id)| *id).collect();
    assert_eq!(ids, BTreeSet::from([a, b, c]));
    assert_eq!(ids.len(), reference.len(), "each batch committed once");
    for n in 2..=3 {
        assert_eq!(h.committed(n), reference, "node {n} diverged");
    }
    for (n, key) in [(1, "a"), (2, "b"), (3, "c")] {
        assert!(h.value(n, key).is_some());
    }
}

#[test]
fn resolutions_agree_on_every_node() {
    let mut h = Harness::new(5);
    for i in 0..6 {
        let submitter = (i % 5) + 1;
        h.submit(submitter, &format!("k{i}"), "v").expect("accepted");
    }
    h.deliver_all();
    h.run(60);

    let reference = &h.applied[&node(1)];
    assert!(!reference.is_empty());
    for n in 2..=5 {
        assert_eq!(&h.applied[&node(n)], reference, "node {n} diverged");
    }
    for window in reference.windows(2) {
        assert_eq!(window[1].sequence, window[0].sequence.next(), "gap in applied log");
    }
}

#[test]
fn health_reports_quorum_after_heartbeats() {
    let mut h = Harness::new(3);
    h.run(10);
    let health = h.engine(1).health();
    assert_eq!(health.status, NodeStatus::Member);
    assert_eq!(health.quorum_size, 2);
    assert_eq!(health.reachable_members, 3);
    assert!(health.quorum_available());
}

#[test]
fn health_is_reported_per_engine() {
    let ahead = single_engine(EngineConfig::testing());
    let behind = single_engine(EngineConfig::testing());
    let batch = reconfig_batch(0, MembershipChange::AddNode(node(4)), Epoch::INITIAL, None);
    let (ahead, _) = feed(ahead, decision(2, 1, Some(batch)));

    // Both engines live in this process; neither sees the other's state.
    let (ahead, behind) = (ahead.health(), behind.health());
    assert_eq!(ahead.applied_through, seq(1));
    assert_eq!(ahead.epoch, Epoch::INITIAL.next());
    assert_eq!(behind.applied_through, SequenceNumber::ZERO);
    assert_eq!(behind.epoch, Epoch::INITIAL);
    assert_eq!(behind.cached_phases, 0);
}

// ============================================================================
// Node Status
// ============================================================================

#[test]
fn submission_rejected_when_disconnected() {
    let mut h = Harness::new(3);
    h.step(node(1), EngineInput::SetConnected(false));
    assert_eq!(h.submit(1, "x", "1"), Err(EngineError::NodeInactive));
    assert!(!h.engine(1).is_active());

    h.step(node(1), EngineInput::SetConnected(true));
    assert!(h.submit(1, "x", "1").is_ok());
}

#[test]
fn joining_node_rejects_submissions() {
    let engine = ConsensusEngine::joining(
        node(4),
        [node(1)],
        KvStateMachine::new(),
        EngineConfig::testing(),
    );
    assert_eq!(engine.status(), NodeStatus::Joining);
    let (_, output) = feed(
        engine,
        EngineInput::Submit {
            commands: vec![put("x", "1")],
            now: Timestamp::from_nanos(1),
        },
    );
    assert_eq!(output.accepted, Some(Err(EngineError::NodeInactive)));
}

// ============================================================================
// Application
// ============================================================================

#[test]
fn decisions_apply_in_order_without_gaps() {
    let engine = single_engine(EngineConfig::testing());
    let first = kv_batch(2, 0, "x", "1");
    let second = kv_batch(2, 1, "y", "2");

    let (engine, output) = feed(engine, decision(2, 2, Some(second.clone())));
    assert!(output.slots.is_empty(), "slot 2 waits for slot 1");
    assert_eq!(engine.applied_through(), SequenceNumber::ZERO);

    let (engine, output) = feed(engine, decision(2, 1, Some(first.clone())));
    let sequences: Vec<SequenceNumber> = output.slots.iter().map(|s| s.sequence).collect();
    assert_eq!(sequences, vec![seq(1), seq(2)]);
    assert_eq!(engine.applied_through(), seq(2));
    assert_eq!(engine.state_machine().get(b"y"), Some(&Bytes::from("2")));
}

#[test]
fn duplicate_batch_is_applied_once() {
    let engine = single_engine(EngineConfig::testing());
    let batch = kv_batch(2, 0, "x", "1");

    let (engine, _) = feed(engine, decision(2, 1, Some(batch.clone())));
    let (engine, output) = feed(engine, decision(3, 2, Some(batch.clone())));
    assert_eq!(
        output.slots,
        vec![AppliedSlot {
            sequence: seq(2),
            resolution: SlotResolution::Duplicate { batch_id: batch.id },
        }]
    );
    assert_eq!(engine.state_machine().last_applied(), seq(1));
}

#[test]
fn null_decision_skips_slot() {
    let engine = single_engine(EngineConfig::testing());
    let (engine, output) = feed(engine, decision(2, 1, None));
    assert_eq!(output.slots[0].resolution, SlotResolution::Skipped);
    assert_eq!(
        output.notifications,
        vec![Notification::SlotSkipped { sequence: seq(1) }]
    );
    assert_eq!(engine.applied_through(), seq(1));
}

#[test]
fn decided_batch_waits_for_content() {
    let engine = single_engine(EngineConfig::testing());
    let batch = kv_batch(2, 0, "x", "1");
    let without_content = EngineInput::Message(Message::targeted(
        node(2),
        node(1),
        MessagePayload::Decision {
            sequence: seq(1),
            value: StateValue::V1,
            digest: Some(batch.digest()),
            batch: None,
        },
    ));

    let (engine, output) = feed(engine, without_content);
    assert!(output.slots.is_empty());

    // The next retransmission tick asks peers for the missing content.
    let mut engine = engine;
    let mut asked = false;
    for tick in 1..=EngineConfig::testing().retransmit_interval_ticks {
        let (next, output) = feed(
            engine,
            EngineInput::Tick {
                now: Timestamp::from_nanos(tick),
            },
        );
        engine = next;
        asked |= output.messages.iter().any(|m| {
            matches!(m.payload, MessagePayload::DecisionRequest { from, through }
                if from == seq(1) && through == seq(1))
        });
    }
    assert!(asked);

    let (engine, output) = feed(engine, decision(3, 1, Some(batch)));
    assert_eq!(output.slots.len(), 1);
    assert_eq!(engine.applied_through(), seq(1));
}

// ============================================================================
// Reconfiguration
// ============================================================================

fn reconfig_batch(local: u64, change: MembershipChange, epoch: Epoch, extra: Option<Bytes>) -> Batch {
    let mut commands = Vec::new();
    if let Some(extra) = extra {
        commands.push(Command::Opaque(extra));
    }
    commands.push(Command::Reconfigure(Reconfiguration {
        change,
        expected_epoch: epoch,
    }));
    Batch::new(
        BatchId::new(node(2), local),
        Timestamp::from_nanos(local + 1),
        commands,
    )
}

#[test]
fn reconfiguration_changes_view_from_next_slot() {
    let engine = single_engine(EngineConfig::testing());
    let batch = reconfig_batch(0, MembershipChange::AddNode(node(4)), Epoch::INITIAL, None);

    let (engine, output) = feed(engine, decision(2, 1, Some(batch)));
    assert!(matches!(
        output.slots[0].resolution,
        SlotResolution::Committed { .. }
    ));
    assert_eq!(engine.view().epoch(), Epoch::INITIAL.next());
    assert!(engine.view().is_learner(node(4)));
    assert_eq!(engine.view().quorum_size(), 2, "learners do not count");
    assert!(
        output
            .notifications
            .iter()
            .any(|n| matches!(n, Notification::ViewChanged { sequence, .. } if *sequence == seq(1)))
    );
}

#[test]
fn stale_reconfiguration_rejects_whole_batch() {
    let engine = single_engine(EngineConfig::testing());
    let batch = reconfig_batch(
        0,
        MembershipChange::AddNode(node(4)),
        Epoch::new(7),
        Some(put("x", "1")),
    );
    let id = batch.id;

    let (engine, output) = feed(engine, decision(2, 1, Some(batch)));
    assert_eq!(
        output.slots[0].resolution,
        SlotResolution::Rejected {
            batch_id: id,
            error: EngineError::ReconfigurationConflict {
                expected: Epoch::new(7),
                actual: Epoch::INITIAL,
            },
        }
    );
    assert!(engine.state_machine().is_empty(), "no partial commit");
    assert_eq!(engine.view().epoch(), Epoch::INITIAL);
    assert!(engine.applied_index().contains(id));
}

#[test]
fn removed_node_becomes_inactive() {
    let engine = single_engine(EngineConfig::testing());
    let batch = reconfig_batch(0, MembershipChange::RemoveNode(node(1)), Epoch::INITIAL, None);
    let (engine, _) = feed(engine, decision(2, 1, Some(batch)));
    assert_eq!(engine.status(), NodeStatus::Removed);
    assert!(!engine.is_active());
}

// ============================================================================
// Catch-up
// ============================================================================

#[test]
fn stale_vote_is_answered_with_decision() {
    let engine = single_engine(EngineConfig::testing());
    let (engine, _) = feed(engine, decision(2, 1, None));

    let late_vote = EngineInput::Message(Message::broadcast(
        node(3),
        MessagePayload::Vote {
            sequence: seq(1),
            attempt: rabia_types::Attempt::FIRST,
            round: rabia_types::Round::One,
            value: StateValue::V0,
            candidate: None,
        },
    ));
    let (_, output) = feed(engine, late_vote);
    assert!(output.messages.iter().any(|m| m.to == Some(node(3))
        && matches!(m.payload, MessagePayload::Decision { sequence, value, .. }
            if sequence == seq(1) && value == StateValue::V0)));
}

#[test]
fn evicted_slots_are_served_as_snapshot_with_cooldown() {
    let config = EngineConfig {
        phase_cache_capacity: 2,
        ..EngineConfig::testing()
    };
    let mut engine = single_engine(config);
    for n in 1..=6 {
        engine = feed(engine, decision(2, n, None)).0;
    }
    let (engine, _) = feed(engine, EngineInput::Sweep);
    assert_eq!(engine.cached_phases(), 2);

    let request = || {
        EngineInput::Message(Message::targeted(
            node(3),
            node(1),
            MessagePayload::DecisionRequest {
                from: seq(1),
                through: seq(4),
            },
        ))
    };
    let (engine, output) = feed(engine, request());
    let snapshots: Vec<&Message> = output
        .messages
        .iter()
        .filter(|m| matches!(m.payload, MessagePayload::SnapshotResponse(_)))
        .collect();
    assert_eq!(snapshots.len(), 1);
    match &snapshots[0].payload {
        MessagePayload::SnapshotResponse(transfer) => {
            assert_eq!(transfer.applied_through, seq(6));
        }
        other => panic!("unexpected payload {}", other.name()),
    }

    let (_, output) = feed(engine, request());
    assert!(
        output
            .messages
            .iter()
            .all(|m| !matches!(m.payload, MessagePayload::SnapshotResponse(_))),
        "cooldown suppresses repeated snapshots"
    );
}

#[test]
fn snapshot_restores_lagging_node_and_completes_its_batches() {
    // Node 2 submits a batch but misses the slot that committed it.
    let view = ClusterView::new((1..=3).map(NodeId::new));
    let lagging = ConsensusEngine::new(node(2), view, KvStateMachine::new(), EngineConfig::testing());
    let (lagging, output) = feed(
        lagging,
        EngineInput::Submit {
            commands: vec![put("x", "1")],
            now: Timestamp::from_nanos(1),
        },
    );
    let own = output.accepted.expect("answered").expect("accepted");
    let submitted = output
        .messages
        .iter()
        .find_map(|m| match &m.payload {
            MessagePayload::Submit(batch) => Some(batch.clone()),
            _ => None,
        })
        .expect("submission forwarded");

    let ahead = single_engine(EngineConfig::testing());
    let (ahead, _) = feed(ahead, decision(3, 1, Some(submitted)));
    let (_, output) = feed(
        ahead,
        EngineInput::Message(Message::targeted(
            node(2),
            node(1),
            MessagePayload::SnapshotRequest {
                applied_through: SequenceNumber::ZERO,
            },
        )),
    );
    let transfer = output
        .messages
        .into_iter()
        .find(|m| matches!(m.payload, MessagePayload::SnapshotResponse(_)))
        .expect("snapshot sent");

    let (lagging, output) = feed(lagging, EngineInput::Message(transfer));
    assert_eq!(lagging.applied_through(), seq(1));
    assert_eq!(lagging.state_machine().get(b"x"), Some(&Bytes::from("1")));
    assert_eq!(
        output.resolved_via_snapshot,
        vec![(own, Ok(BatchOutcome::Installed))]
    );
    assert!(output.notifications.contains(&Notification::SnapshotRestored {
        applied_through: seq(1)
    }));
    assert_eq!(lagging.pending_batches(), 0);
}

#[test]
fn snapshot_reports_rejected_reconfiguration_to_its_submitter() {
    // Node 2 issues a change against epoch 0 that the others reject after
    // an earlier change moved them to epoch 1.
    let view = ClusterView::new((1..=3).map(NodeId::new));
    let lagging = ConsensusEngine::new(node(2), view, KvStateMachine::new(), EngineConfig::testing());
    let (lagging, output) = feed(
        lagging,
        EngineInput::Reconfigure {
            change: MembershipChange::RemoveNode(node(3)),
            now: Timestamp::from_nanos(1),
        },
    );
    let own = output.accepted.expect("answered").expect("accepted");
    let stale = output
        .messages
        .iter()
        .find_map(|m| match &m.payload {
            MessagePayload::Submit(batch) => Some(batch.clone()),
            _ => None,
        })
        .expect("submission forwarded");

    let earlier = Batch::new(
        BatchId::new(node(3), 0),
        Timestamp::from_nanos(1),
        vec![Command::Reconfigure(Reconfiguration {
            change: MembershipChange::AddNode(node(4)),
            expected_epoch: Epoch::INITIAL,
        })],
    );
    let ahead = single_engine(EngineConfig::testing());
    let (ahead, _) = feed(ahead, decision(3, 1, Some(earlier)));
    let (ahead, output) = feed(ahead, decision(3, 2, Some(stale)));
    assert!(matches!(
        output.slots[0].resolution,
        SlotResolution::Rejected { batch_id, .. } if batch_id == own
    ));
    let (_, output) = feed(
        ahead,
        EngineInput::Message(Message::targeted(
            node(2),
            node(1),
            MessagePayload::SnapshotRequest {
                applied_through: SequenceNumber::ZERO,
            },
        )),
    );
    let transfer = output
        .messages
        .into_iter()
        .find(|m| matches!(m.payload, MessagePayload::SnapshotResponse(_)))
        .expect("snapshot sent");

    let (lagging, output) = feed(lagging, EngineInput::Message(transfer));
    assert_eq!(lagging.applied_through(), seq(2));
    assert_eq!(
        output.resolved_via_snapshot,
        vec![(
            own,
            Err(EngineError::ReconfigurationConflict {
                expected: Epoch::INITIAL,
                actual: Epoch::INITIAL.next(),
            })
        )]
    );
    assert!(lagging.view().is_member(node(3)), "rejected change never applied");
    assert_eq!(lagging.pending_batches(), 0);
}

#[test]
fn quorum_loss_halts_and_recovery_resumes() {
    let mut h = Harness::new(3);
    h.down.extend([node(2), node(3)]);
    h.run(30);
    h.submit(1, "x", "1").expect("accepted while connected");
    h.run(30);

    assert_eq!(h.value(1, "x"), None, "no progress without quorum");
    assert!(!h.engine(1).health().quorum_available());

    h.down.clear();
    h.run(40);
    for n in 1..=3 {
        assert_eq!(h.value(n, "x"), Some(Bytes::from("1")), "node {n}");
    }
}

#[test]
fn lagging_member_catches_up_after_reconnect() {
    let mut h = Harness::new(3);
    h.down.insert(node(3));
    for i in 0..5 {
        h.submit(1, &format!("k{i}"), "v").expect("accepted");
    }
    h.deliver_all();
    h.run(20);
    assert_eq!(h.engine(1).applied_through(), seq(5));
    assert_eq!(h.engine(3).applied_through(), SequenceNumber::ZERO);

    h.down.clear();
    h.run(30);
    assert_eq!(h.engine(3).applied_through(), seq(5));
    assert_eq!(h.value(3, "k4"), Some(Bytes::from("v")));
}

#[test]
fn learner_joins_and_is_promoted() {
    let mut h = Harness::new(3);
    let joiner = ConsensusEngine::joining(
        node(4),
        [node(1), node(2)],
        KvStateMachine::new(),
        EngineConfig::testing(),
    );
    h.engines.insert(node(4), joiner);
    h.submit(1, "x", "1").expect("accepted");
    h.deliver_all();

    h.now += 1;
    let output = h.step(
        node(1),
        EngineInput::Reconfigure {
            change: MembershipChange::AddNode(node(4)),
            now: Timestamp::from_nanos(h.now),
        },
    );
    assert!(matches!(output.accepted, Some(Ok(_))));
    h.deliver_all();
    h.run(80);

    assert_eq!(h.engine(4).status(), NodeStatus::Member);
    for n in 1..=4 {
        assert_eq!(h.engine(n).view().member_count(), 4, "node {n}");
        assert_eq!(h.engine(n).view().quorum_size(), 3);
    }
    assert_eq!(h.value(4, "x"), Some(Bytes::from("1")));

    h.submit(4, "y", "2").expect("promoted node accepts submissions");
    h.deliver_all();
    h.run(10);
    for n in 1..=4 {
        assert_eq!(h.value(n, "y"), Some(Bytes::from("2")), "node {n}");
    }
}
