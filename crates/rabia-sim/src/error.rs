//! Simulation failures.

use rabia_engine::EngineError;
use rabia_types::NodeId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    /// A safety invariant was violated.
    #[error("invariant violated at tick {tick}: {message}")]
    InvariantViolation { message: String, tick: u64 },

    /// A condition did not become true within the allotted ticks.
    #[error("condition not reached within {ticks} ticks: {description}")]
    Stalled { description: String, ticks: u64 },

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("node {0} already exists")]
    NodeExists(NodeId),

    /// The engine refused a submission.
    #[error(transparent)]
    Engine(#[from] EngineError),
}
