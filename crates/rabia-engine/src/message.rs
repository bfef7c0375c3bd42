//! Protocol messages.
//!
//! ## Submission
//! - [`MessagePayload::Submit`] - Any → All: a client batch to schedule
//!
//! ## Per-slot Voting
//! - [`MessagePayload::Proposal`] - Member → All: what I want in slot S
//! - [`MessagePayload::Vote`] - Member → All: my vote for (S, attempt, round)
//! - [`MessagePayload::Decision`] - Any → Requester: slot S is decided
//!
//! ## Catch-up
//! - [`MessagePayload::Heartbeat`] - Any → All: liveness and progress
//! - [`MessagePayload::DecisionRequest`] - Lagging → Peer: send decisions for a range
//! - [`MessagePayload::SnapshotRequest`] - Lagging/Joining → Peer: send full state
//! - [`MessagePayload::SnapshotResponse`] - Peer → Requester: full state
//!
//! The transport owns the wire encoding. Messages derive serde so any
//! format will do; tests and the in-process network pass them by value.

use bytes::Bytes;
use rabia_types::{
    Attempt, Batch, BatchDigest, Epoch, NodeId, Round, SequenceNumber, StateValue,
};
use serde::{Deserialize, Serialize};

use crate::applied::AppliedIndex;
use crate::cluster::ClusterView;

// ============================================================================
// Message Envelope
// ============================================================================

/// A protocol message with routing information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The node that sent this message.
    pub from: NodeId,

    /// The intended recipient. `None` for broadcast messages.
    pub to: Option<NodeId>,

    pub payload: MessagePayload,
}

impl Message {
    pub fn targeted(from: NodeId, to: NodeId, payload: MessagePayload) -> Self {
        Self {
            from,
            to: Some(to),
            payload,
        }
    }

    pub fn broadcast(from: NodeId, payload: MessagePayload) -> Self {
        Self {
            from,
            to: None,
            payload,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePayload {
    Submit(Batch),

    Proposal {
        sequence: SequenceNumber,
        /// `None` when the sender had nothing to propose.
        batch: Option<Batch>,
    },

    Vote {
        sequence: SequenceNumber,
        attempt: Attempt,
        round: Round,
        value: StateValue,
        /// Batch a `V1` vote stands for.
        candidate: Option<BatchDigest>,
    },

    Decision {
        sequence: SequenceNumber,
        value: StateValue,
        digest: Option<BatchDigest>,
        /// Included when the sender has the content.
        batch: Option<Batch>,
    },

    Heartbeat {
        applied_through: SequenceNumber,
        epoch: Epoch,
    },

    /// Asks for decisions in `from..=through`.
    DecisionRequest {
        from: SequenceNumber,
        through: SequenceNumber,
    },

    SnapshotRequest {
        applied_through: SequenceNumber,
    },

    SnapshotResponse(SnapshotTransfer),
}

impl MessagePayload {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            MessagePayload::Submit(_) => "Submit",
            MessagePayload::Proposal { .. } => "Proposal",
            MessagePayload::Vote { .. } => "Vote",
            MessagePayload::Decision { .. } => "Decision",
            MessagePayload::Heartbeat { .. } => "Heartbeat",
            MessagePayload::DecisionRequest { .. } => "DecisionRequest",
            MessagePayload::SnapshotRequest { .. } => "SnapshotRequest",
            MessagePayload::SnapshotResponse(_) => "SnapshotResponse",
        }
    }

    /// Slot the payload refers to, if it is slot-scoped.
    pub fn sequence(&self) -> Option<SequenceNumber> {
        match self {
            MessagePayload::Proposal { sequence, .. }
            | MessagePayload::Vote { sequence, .. }
            | MessagePayload::Decision { sequence, .. } => Some(*sequence),
            _ => None,
        }
    }
}

/// Full committed state up to `applied_through`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTransfer {
    pub applied_through: SequenceNumber,
    /// Membership in effect for `applied_through + 1`.
    pub view: ClusterView,
    pub applied_index: AppliedIndex,
    /// Opaque state machine snapshot.
    pub state: Bytes,
}
