//! State-change notifications.
//!
//! The engine emits a [`Notification`] for every applied slot, view change
//! and snapshot restore. Delivery is at-least-once: a notification can be
//! repeated (for example when a snapshot replays state an observer already
//! saw), so observers must tolerate duplicates.
//!
//! Notifications are produced on the critical path but dispatched off it;
//! a slow observer delays other observers, never consensus.

use rabia_types::{BatchId, SequenceNumber};

use crate::cluster::ClusterView;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A batch was applied to the state machine at `sequence`.
    BatchApplied {
        sequence: SequenceNumber,
        batch_id: BatchId,
    },
    /// The slot decided to commit nothing (or a batch that was already
    /// applied or rejected).
    SlotSkipped { sequence: SequenceNumber },
    /// A committed membership change produced a new view.
    ViewChanged {
        sequence: SequenceNumber,
        view: ClusterView,
    },
    /// State was replaced by a snapshot covering `applied_through`.
    SnapshotRestored { applied_through: SequenceNumber },
}

impl Notification {
    pub fn sequence(&self) -> SequenceNumber {
        match self {
            Notification::BatchApplied { sequence, .. }
            | Notification::SlotSkipped { sequence }
            | Notification::ViewChanged { sequence, .. } => *sequence,
            Notification::SnapshotRestored { applied_through } => *applied_through,
        }
    }
}

/// Receives notifications. Implementations must be idempotent.
pub trait StateObserver: Send + Sync + 'static {
    fn notify(&self, notification: &Notification);
}

impl<F> StateObserver for F
where
    F: Fn(&Notification) + Send + Sync + 'static,
{
    fn notify(&self, notification: &Notification) {
        self(notification);
    }
}
