//! Consensus engine.
//!
//! [`ConsensusEngine`] is a pure, deterministic state machine: it takes an
//! [`EngineInput`] and returns itself plus an [`EngineOutput`]. It performs
//! no I/O and never reads a clock, so the same inputs always produce the
//! same outputs. The tokio runtime ([`crate::runtime`]) and the simulator
//! drive it.
//!
//! # Protocol Overview
//!
//! Every member proposes once per slot. Round 1 votes `V1` when a quorum
//! of members proposed the same batch, `V0` otherwise; round 2 repeats a
//! value that reached a majority or says `?`. A quorum of identical
//! definite round-2 votes decides; otherwise the next attempt starts from
//! an adopted value or the common coin.
//!
//! ```text
//! Client ──Submit──► Any node ──Submit──► All
//!                                 │
//!   each member: ──Proposal(S)──► All
//!                                 │ quorum of proposals
//!   each member: ──Vote(S,a,r1)─► All
//!                                 │ quorum of round-1 votes
//!   each member: ──Vote(S,a,r2)─► All
//!                                 │ quorum agrees ──► decide, apply in order
//!                                 └ otherwise ─────► attempt a+1
//! ```
//!
//! # Views and Pipelining
//!
//! A committed membership change takes effect for the very next slot, so a
//! node only votes on slot `applied_through + 1`, the one slot whose view
//! it knows. Proposals are exchanged up to `pipeline_depth` slots ahead,
//! and votes for later slots are buffered in their [`PhaseState`] until
//! the slot becomes votable.
//!
//! [`PhaseState`]: crate::phase::PhaseState

mod admission;
mod apply;
mod liveness;
mod rounds;
mod state;
mod transfer;

pub use liveness::PeerLiveness;
pub use state::ConsensusEngine;

use bytes::Bytes;
use rabia_types::{BatchId, Epoch, MembershipChange, NodeId, SequenceNumber, Timestamp};

use crate::error::EngineError;
use crate::message::Message;
use crate::observer::Notification;

// ============================================================================
// Engine Input
// ============================================================================

/// Events that drive the engine.
#[derive(Debug, Clone)]
pub enum EngineInput {
    /// A client batch of opaque commands submitted at this node.
    Submit { commands: Vec<Bytes>, now: Timestamp },

    /// A membership change submitted at this node.
    Reconfigure {
        change: MembershipChange,
        now: Timestamp,
    },

    /// A message from another node.
    Message(Message),

    /// Periodic timer. Drives heartbeats, retransmission and catch-up.
    Tick { now: Timestamp },

    /// Fast-lane housekeeping: cache eviction.
    Sweep,

    /// The hosting process noticed the node lost (or regained) its network.
    SetConnected(bool),
}

// ============================================================================
// Engine Output
// ============================================================================

/// How an applied slot resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotResolution {
    /// The batch was applied. One result per opaque command.
    Committed { batch_id: BatchId, results: Vec<Bytes> },
    /// The batch had already been applied in an earlier slot.
    Duplicate { batch_id: BatchId },
    /// The batch failed validation and was applied nowhere.
    Rejected { batch_id: BatchId, error: EngineError },
    /// The slot decided to commit nothing.
    Skipped,
}

/// What a submitter learns about its own batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Applied in a local slot. One result per opaque command.
    Applied(Vec<Bytes>),
    /// Committed by the cluster and installed here through a snapshot, so
    /// per-command results are not available.
    Installed,
}

impl BatchOutcome {
    /// Per-command results, when the batch was applied locally.
    pub fn results(&self) -> Option<&[Bytes]> {
        match self {
            BatchOutcome::Applied(results) => Some(results),
            BatchOutcome::Installed => None,
        }
    }
}

impl SlotResolution {
    pub fn batch_id(&self) -> Option<BatchId> {
        match self {
            SlotResolution::Committed { batch_id, .. }
            | SlotResolution::Duplicate { batch_id }
            | SlotResolution::Rejected { batch_id, .. } => Some(*batch_id),
            SlotResolution::Skipped => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedSlot {
    pub sequence: SequenceNumber,
    pub resolution: SlotResolution,
}

/// Output produced by processing one input.
///
/// The caller is responsible for:
/// 1. Sending `messages` via the transport
/// 2. Completing waiters for batches in `slots` and `resolved_via_snapshot`
/// 3. Dispatching `notifications` to observers (off the critical path)
#[derive(Debug, Default)]
pub struct EngineOutput {
    pub messages: Vec<Message>,

    /// Set for `Submit` and `Reconfigure` inputs.
    pub accepted: Option<Result<BatchId, EngineError>>,

    /// Slots applied while processing this input, in sequence order.
    pub slots: Vec<AppliedSlot>,

    /// Own batches a snapshot covered, with how the cluster resolved them.
    /// Rejected batches carry their error.
    pub resolved_via_snapshot: Vec<(BatchId, Result<BatchOutcome, EngineError>)>,

    pub notifications: Vec<Notification>,
}

impl EngineOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.accepted.is_none()
            && self.slots.is_empty()
            && self.resolved_via_snapshot.is_empty()
            && self.notifications.is_empty()
    }

    /// Merges another output into this one.
    pub fn merge(&mut self, other: EngineOutput) {
        self.messages.extend(other.messages);
        if other.accepted.is_some() {
            self.accepted = other.accepted;
        }
        self.slots.extend(other.slots);
        self.resolved_via_snapshot
            .extend(other.resolved_via_snapshot);
        self.notifications.extend(other.notifications);
    }
}

// ============================================================================
// Status and Health
// ============================================================================

/// Role of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    /// Started with `joining` and has not received a snapshot yet.
    Joining,
    /// Part of the view but not counted toward quorum.
    Learner,
    /// Voting member.
    Member,
    /// No longer part of the view.
    Removed,
}

/// Point-in-time health report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineHealth {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub connected: bool,
    pub epoch: Epoch,
    pub applied_through: SequenceNumber,
    pub lowest_undecided: SequenceNumber,
    pub quorum_size: usize,
    /// Members heard from within `peer_timeout_ticks`, self included.
    pub reachable_members: usize,
    pub pending_batches: usize,
    /// Slots held in the phase cache.
    pub cached_phases: usize,
}

impl EngineHealth {
    pub fn quorum_available(&self) -> bool {
        self.reachable_members >= self.quorum_size
    }

    pub fn is_active(&self) -> bool {
        self.connected && self.status == NodeStatus::Member
    }
}

