//! Error types surfaced to callers of the consensus engine.
//!
//! Protocol-internal faults (lost, duplicated or reordered votes) are
//! recovered by retransmission and idempotent vote recording. They never
//! show up here. Only conditions a caller can act on are surfaced.

use rabia_types::Epoch;
use thiserror::Error;

use crate::cluster::ReconfigError;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Caller-visible failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The local node is disconnected or not a voting member of the current
    /// view. Submissions are rejected immediately instead of hanging.
    #[error("node is not active (disconnected or not a voting member)")]
    NodeInactive,

    /// Too few members are reachable to form a quorum.
    ///
    /// Reported when a caller deadline expires while quorum is missing; the
    /// submission itself stays queued in case quorum returns.
    #[error("quorum unavailable: {reachable} reachable, {required} required")]
    QuorumUnavailable { reachable: usize, required: usize },

    /// A membership change was issued against an epoch that has since moved.
    #[error("reconfiguration conflict: expected epoch {expected}, cluster is at {actual}")]
    ReconfigurationConflict { expected: Epoch, actual: Epoch },

    /// A membership change that can never apply to the current view.
    #[error("invalid reconfiguration: {0}")]
    InvalidReconfiguration(ReconfigError),

    /// The caller's deadline elapsed. The slot may still decide later.
    #[error("deadline elapsed before the batch was decided")]
    Timeout,

    /// The engine shut down before the request completed.
    #[error("engine shut down")]
    Shutdown,
}

impl From<ReconfigError> for EngineError {
    fn from(error: ReconfigError) -> Self {
        match error {
            ReconfigError::EpochConflict { expected, actual } => {
                EngineError::ReconfigurationConflict { expected, actual }
            }
            other => EngineError::InvalidReconfiguration(other),
        }
    }
}
