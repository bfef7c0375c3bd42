//! # rabia-types: Core types for the Rabia consensus engine
//!
//! This crate contains the identifiers and payload types shared by the
//! consensus engine, its runtime and the simulation harness:
//!
//! - Entity IDs: [`NodeId`], [`SequenceNumber`], [`Epoch`], [`Attempt`]
//! - Voting domain: [`StateValue`], [`Round`]
//! - Payloads: [`Batch`], [`Command`], [`Reconfiguration`]
//! - Content addressing: [`BatchDigest`]
//!
//! All IDs are `Copy` newtypes around fixed-width integers so they can be
//! passed by value through the hot path.

use std::{
    fmt::{Debug, Display},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ============================================================================
// Entity IDs - All Copy (cheap 8-byte values)
// ============================================================================

/// Identifier of a node participating in the cluster.
///
/// Node IDs are opaque and totally ordered. The ordering is used for
/// deterministic tie-breaking (scheduler order, iteration order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<NodeId> for u64 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

/// Position of a slot in the global decided order.
///
/// Sequence numbers start at 1. [`SequenceNumber::ZERO`] is used as the
/// "nothing applied yet" watermark.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);
    pub const FIRST: SequenceNumber = SequenceNumber(1);

    pub fn new(seq: u64) -> Self {
        Self(seq)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the following sequence number.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the preceding sequence number, saturating at zero.
    pub fn prev(&self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Adds an offset, saturating at `u64::MAX`.
    pub fn saturating_add(&self, offset: u64) -> Self {
        Self(self.0.saturating_add(offset))
    }

    /// Number of slots between `self` and `other` (absolute distance).
    pub fn distance_to(&self, other: SequenceNumber) -> u64 {
        self.0.abs_diff(other.0)
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SequenceNumber> for u64 {
    fn from(seq: SequenceNumber) -> Self {
        seq.0
    }
}

/// Monotonic version of the cluster membership.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Epoch(u64);

impl Epoch {
    pub const INITIAL: Epoch = Epoch(0);

    pub fn new(epoch: u64) -> Self {
        Self(epoch)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

impl From<u64> for Epoch {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Attempt counter within one slot. Starts at 1 and grows on every retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Attempt(u32);

impl Attempt {
    pub const FIRST: Attempt = Attempt(1);

    pub fn new(attempt: u32) -> Self {
        Self(attempt)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Display for Attempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Attempt {
    fn default() -> Self {
        Self::FIRST
    }
}

/// Nanoseconds since the Unix epoch.
///
/// The engine never reads the clock itself; timestamps are supplied by the
/// caller so simulation runs stay deterministic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Reads the system wall clock.
    ///
    /// Clamps to [`Timestamp::EPOCH`] if the clock is before 1970.
    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self(nanos)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

// ============================================================================
// Voting Domain
// ============================================================================

/// Value carried by a vote.
///
/// `V1` means "commit the slot's candidate batch", `V0` means "commit
/// nothing in this slot". `Undecided` only appears in round 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StateValue {
    V0,
    V1,
    Undecided,
}

impl StateValue {
    /// All values, in tally bucket order.
    pub const ALL: [StateValue; 3] = [StateValue::V0, StateValue::V1, StateValue::Undecided];

    /// Returns true for `V0` and `V1`.
    pub fn is_definite(&self) -> bool {
        !matches!(self, StateValue::Undecided)
    }

    pub fn from_bit(bit: bool) -> Self {
        if bit { StateValue::V1 } else { StateValue::V0 }
    }

    /// Index into a three-bucket tally array.
    pub fn bucket(&self) -> usize {
        match self {
            StateValue::V0 => 0,
            StateValue::V1 => 1,
            StateValue::Undecided => 2,
        }
    }
}

impl Display for StateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateValue::V0 => write!(f, "V0"),
            StateValue::V1 => write!(f, "V1"),
            StateValue::Undecided => write!(f, "?"),
        }
    }
}

/// One of the two voting sub-steps of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Round {
    One,
    Two,
}

impl Display for Round {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Round::One => write!(f, "r1"),
            Round::Two => write!(f, "r2"),
        }
    }
}

// ============================================================================
// Batches and Commands
// ============================================================================

/// Globally unique batch identity: the submitting node plus its local counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchId {
    pub submitter: NodeId,
    pub local_sequence: u64,
}

impl BatchId {
    pub fn new(submitter: NodeId, local_sequence: u64) -> Self {
        Self {
            submitter,
            local_sequence,
        }
    }
}

impl Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.submitter, self.local_sequence)
    }
}

/// Membership changes that flow through the ordinary consensus pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MembershipChange {
    /// Adds a node as a learner. It does not count toward quorum yet.
    AddNode(NodeId),
    /// Removes a member or a learner.
    RemoveNode(NodeId),
    /// Promotes a caught-up learner to a voting member.
    PromoteNode(NodeId),
}

impl MembershipChange {
    pub fn target(&self) -> NodeId {
        match self {
            MembershipChange::AddNode(id)
            | MembershipChange::RemoveNode(id)
            | MembershipChange::PromoteNode(id) => *id,
        }
    }
}

impl Display for MembershipChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MembershipChange::AddNode(id) => write!(f, "add({id})"),
            MembershipChange::RemoveNode(id) => write!(f, "remove({id})"),
            MembershipChange::PromoteNode(id) => write!(f, "promote({id})"),
        }
    }
}

/// A membership change guarded by the epoch it was issued against.
///
/// Two changes issued against the same epoch conflict: whichever commits
/// first wins and the other is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reconfiguration {
    pub change: MembershipChange,
    pub expected_epoch: Epoch,
}

/// A single command inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Opaque payload handed to the replicated state machine.
    Opaque(Bytes),
    /// Cluster membership change, interpreted by the engine itself.
    Reconfigure(Reconfiguration),
}

/// A client-submitted group of commands proposed for a single slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub submitted_at: Timestamp,
    pub commands: Vec<Command>,
}

impl Batch {
    pub fn new(id: BatchId, submitted_at: Timestamp, commands: Vec<Command>) -> Self {
        Self {
            id,
            submitted_at,
            commands,
        }
    }

    /// Content digest used to compare proposals across nodes.
    ///
    /// BLAKE3 over the canonical `postcard` encoding, so identical batches
    /// produce identical digests on every node.
    pub fn digest(&self) -> BatchDigest {
        let encoded = postcard::to_allocvec(self)
            .expect("Batch serialization should never fail (all fields are serializable)");
        BatchDigest(*blake3::hash(&encoded).as_bytes())
    }

    /// Iterates over the opaque payloads in order.
    pub fn opaque_commands(&self) -> impl Iterator<Item = &Bytes> {
        self.commands.iter().filter_map(|c| match c {
            Command::Opaque(bytes) => Some(bytes),
            Command::Reconfigure(_) => None,
        })
    }

    /// Iterates over the membership changes in order.
    pub fn reconfigurations(&self) -> impl Iterator<Item = &Reconfiguration> {
        self.commands.iter().filter_map(|c| match c {
            Command::Reconfigure(reconfig) => Some(reconfig),
            Command::Opaque(_) => None,
        })
    }

    pub fn is_reconfiguration(&self) -> bool {
        self.reconfigurations().next().is_some()
    }
}

/// BLAKE3 digest of a batch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchDigest([u8; 32]);

impl BatchDigest {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Debug for BatchDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BatchDigest({self})")
    }
}

impl Display for BatchDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
