//! Consensus safety invariants checked while a simulation runs.
//!
//! ## Safety Properties
//!
//! 1. **Agreement**: no two nodes resolve the same slot differently
//! 2. **Prefix**: every node's resolved slots are gap-free and agree with
//!    every other node on common positions
//! 3. **Integrity**: a batch is committed at most once per node

use std::collections::{BTreeMap, BTreeSet};

use rabia_engine::{AppliedSlot, SlotResolution};
use rabia_types::{BatchId, NodeId, SequenceNumber};

/// Outcome of a single invariant check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Ok,
    Violated {
        invariant: &'static str,
        message: String,
    },
}

impl InvariantResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, InvariantResult::Ok)
    }
}

/// What a slot resolved to, comparable across nodes.
///
/// `Duplicate` and `Rejected` resolutions still name the decided batch;
/// they differ from `Committed` only in local effect.
fn decided_batch(resolution: &SlotResolution) -> Option<BatchId> {
    resolution.batch_id()
}

// ============================================================================
// Agreement
// ============================================================================

/// Verifies that every node resolves a slot to the same decided value.
#[derive(Debug, Default)]
pub struct AgreementChecker {
    /// First resolution seen per slot, with the node that reported it.
    decided: BTreeMap<SequenceNumber, (NodeId, Option<BatchId>)>,
    checks_performed: u64,
}

impl AgreementChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, node: NodeId, slot: &AppliedSlot) -> InvariantResult {
        self.checks_performed += 1;
        let value = decided_batch(&slot.resolution);
        match self.decided.get(&slot.sequence) {
            Some((first, existing)) if *existing != value => InvariantResult::Violated {
                invariant: "agreement",
                message: format!(
                    "nodes {first} and {node} decided slot {} differently: {existing:?} vs {value:?}",
                    slot.sequence
                ),
            },
            Some(_) => InvariantResult::Ok,
            None => {
                self.decided.insert(slot.sequence, (node, value));
                InvariantResult::Ok
            }
        }
    }

    pub fn checks_performed(&self) -> u64 {
        self.checks_performed
    }

    /// Slots decided by at least one node.
    pub fn decided_slots(&self) -> usize {
        self.decided.len()
    }
}

// ============================================================================
// Prefix
// ============================================================================

/// Verifies that resolved slots form gap-free logs that never fork.
///
/// A node restored from a snapshot jumps forward; the jump is recorded
/// with [`PrefixChecker::record_snapshot`] and is not a gap.
#[derive(Debug, Default)]
pub struct PrefixChecker {
    logs: BTreeMap<NodeId, BTreeMap<SequenceNumber, Option<BatchId>>>,
    /// Highest slot each node has resolved or restored through.
    heads: BTreeMap<NodeId, SequenceNumber>,
}

impl PrefixChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, node: NodeId, slot: &AppliedSlot) -> InvariantResult {
        let head = self.heads.entry(node).or_insert(SequenceNumber::ZERO);
        if slot.sequence != head.next() {
            return InvariantResult::Violated {
                invariant: "prefix",
                message: format!(
                    "node {node} resolved slot {} after {}",
                    slot.sequence, *head
                ),
            };
        }
        *head = slot.sequence;
        self.logs
            .entry(node)
            .or_default()
            .insert(slot.sequence, decided_batch(&slot.resolution));
        InvariantResult::Ok
    }

    pub fn record_snapshot(&mut self, node: NodeId, applied_through: SequenceNumber) {
        let head = self.heads.entry(node).or_insert(SequenceNumber::ZERO);
        *head = (*head).max(applied_through);
    }

    /// Compares every pair of logs on their common positions.
    pub fn check(&self) -> InvariantResult {
        let nodes: Vec<&NodeId> = self.logs.keys().collect();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                let (log_a, log_b) = (&self.logs[*a], &self.logs[*b]);
                for (sequence, value) in log_a {
                    if let Some(other) = log_b.get(sequence) {
                        if other != value {
                            return InvariantResult::Violated {
                                invariant: "prefix",
                                message: format!(
                                    "nodes {a} and {b} diverge at slot {sequence}"
                                ),
                            };
                        }
                    }
                }
            }
        }
        InvariantResult::Ok
    }

    pub fn head(&self, node: NodeId) -> SequenceNumber {
        self.heads.get(&node).copied().unwrap_or(SequenceNumber::ZERO)
    }
}

// ============================================================================
// Integrity
// ============================================================================

/// Verifies that no node commits the same batch twice.
#[derive(Debug, Default)]
pub struct IntegrityChecker {
    committed: BTreeMap<NodeId, BTreeSet<BatchId>>,
}

impl IntegrityChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, node: NodeId, slot: &AppliedSlot) -> InvariantResult {
        let SlotResolution::Committed { batch_id, .. } = &slot.resolution else {
            return InvariantResult::Ok;
        };
        if self.committed.entry(node).or_default().insert(*batch_id) {
            InvariantResult::Ok
        } else {
            InvariantResult::Violated {
                invariant: "integrity",
                message: format!(
                    "node {node} committed batch {batch_id} twice (again at slot {})",
                    slot.sequence
                ),
            }
        }
    }

    pub fn committed(&self, node: NodeId) -> usize {
        self.committed.get(&node).map_or(0, BTreeSet::len)
    }
}
