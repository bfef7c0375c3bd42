//! Cluster membership views.
//!
//! A [`ClusterView`] is an immutable, versioned snapshot of who votes.
//! Views are never mutated: a committed membership change produces a new
//! view with the next epoch, and the old one stays valid for every slot
//! decided before the change.
//!
//! # Learners
//!
//! A node added to the cluster starts as a *learner*. Learners receive
//! decisions and can request a snapshot, but they are absent from quorum
//! computation until a `PromoteNode` change for them commits. This keeps an
//! unsynced node from weakening quorum intersection while it catches up.

use std::collections::BTreeSet;
use std::fmt::Display;

use rabia_types::{Epoch, MembershipChange, NodeId, Reconfiguration};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Reconfiguration Errors
// ============================================================================

/// Why a membership change cannot apply to a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ReconfigError {
    /// The change was issued against an older (or newer) epoch.
    #[error("change issued against epoch {expected} but view is at {actual}")]
    EpochConflict { expected: Epoch, actual: Epoch },

    #[error("{0} is already part of the cluster")]
    AlreadyPresent(NodeId),

    #[error("{0} is not part of the cluster")]
    NotPresent(NodeId),

    #[error("{0} is not a learner")]
    NotLearner(NodeId),

    #[error("removing {0} would leave the cluster without members")]
    WouldBeEmpty(NodeId),
}

// ============================================================================
// Cluster View
// ============================================================================

/// Immutable snapshot of cluster membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    epoch: Epoch,
    members: BTreeSet<NodeId>,
    learners: BTreeSet<NodeId>,
}

impl ClusterView {
    /// Creates the founding view of a cluster.
    ///
    /// # Panics
    ///
    /// Panics if `members` is empty.
    pub fn new(members: impl IntoIterator<Item = NodeId>) -> Self {
        let members: BTreeSet<NodeId> = members.into_iter().collect();
        assert!(!members.is_empty(), "cluster must have at least one member");
        Self {
            epoch: Epoch::INITIAL,
            members,
            learners: BTreeSet::new(),
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Voting members, in ascending order.
    pub fn members(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().copied()
    }

    pub fn learners(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.learners.iter().copied()
    }

    /// Members and learners.
    pub fn all_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.union(&self.learners).copied()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// `floor(|members| / 2) + 1`.
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Members that may be unreachable while quorum still forms.
    pub fn max_failures(&self) -> usize {
        self.members.len() - self.quorum_size()
    }

    pub fn is_member(&self, id: NodeId) -> bool {
        self.members.contains(&id)
    }

    pub fn is_learner(&self, id: NodeId) -> bool {
        self.learners.contains(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.is_member(id) || self.is_learner(id)
    }

    /// Returns true if the given nodes include a quorum of members.
    ///
    /// Non-members and duplicates are ignored.
    pub fn has_quorum<'a>(&self, nodes: impl IntoIterator<Item = &'a NodeId>) -> bool {
        let present: BTreeSet<&NodeId> = nodes
            .into_iter()
            .filter(|id| self.members.contains(id))
            .collect();
        present.len() >= self.quorum_size()
    }

    /// Produces the view that results from committing `reconfig`.
    ///
    /// The receiver is left untouched.
    pub fn apply_reconfiguration(
        &self,
        reconfig: &Reconfiguration,
    ) -> Result<ClusterView, ReconfigError> {
        if reconfig.expected_epoch != self.epoch {
            return Err(ReconfigError::EpochConflict {
                expected: reconfig.expected_epoch,
                actual: self.epoch,
            });
        }

        let mut next = self.clone();
        next.epoch = self.epoch.next();

        match reconfig.change {
            MembershipChange::AddNode(id) => {
                if self.contains(id) {
                    return Err(ReconfigError::AlreadyPresent(id));
                }
                next.learners.insert(id);
            }
            MembershipChange::RemoveNode(id) => {
                if self.is_learner(id) {
                    next.learners.remove(&id);
                } else if self.is_member(id) {
                    if self.members.len() == 1 {
                        return Err(ReconfigError::WouldBeEmpty(id));
                    }
                    next.members.remove(&id);
                } else {
                    return Err(ReconfigError::NotPresent(id));
                }
            }
            MembershipChange::PromoteNode(id) => {
                if !self.is_learner(id) {
                    return Err(ReconfigError::NotLearner(id));
                }
                next.learners.remove(&id);
                next.members.insert(id);
            }
        }

        Ok(next)
    }
}

impl Display for ClusterView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[", self.epoch)?;
        for (i, id) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{id}")?;
        }
        if !self.learners.is_empty() {
            write!(f, " +")?;
            for id in &self.learners {
                write!(f, " {id}")?;
            }
        }
        write!(f, "]")
    }
}
