//! # rabia-engine: Randomized Multi-Value Consensus
//!
//! A crash-fault-tolerant replication engine in the style of Rabia. Any
//! node accepts client batches; every voting member proposes for each log
//! slot, and a two-round binary vote with a shared common coin decides
//! whether the slot commits the majority proposal or nothing. There is no
//! leader and no view change.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  runtime (tokio)           EngineHandle ◄── callers          │
//! │    ├── Transport  ◄──────── messages                         │
//! │    └── observer task ◄──── notifications                     │
//! │                                                              │
//! │  engine (pure)             ConsensusEngine::process          │
//! │    ├── scheduler   batch admission order                     │
//! │    ├── phase       per-slot rounds and votes                 │
//! │    ├── cache       bounded slot retention (LRU)              │
//! │    ├── cluster     membership views and epochs               │
//! │    └── applied     batch dedup index                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine core is a pure state machine (inputs in, outputs out) so
//! the same code runs under the tokio [`runtime`] and under the
//! deterministic simulator in `rabia-sim`.
//!
//! # Guarantees
//!
//! - **Agreement**: no two nodes decide different values for a slot
//! - **Integrity**: a batch is applied at most once per node
//! - **Order**: every node applies slots in the same gap-free order
//! - **Termination**: with probability 1 while a quorum of members is
//!   connected

pub mod applied;
pub mod cache;
pub mod cluster;
pub mod coin;
pub mod config;
pub mod engine;
pub mod error;
pub mod instrumentation;
pub mod message;
pub mod observer;
pub mod phase;
pub mod runtime;
pub mod scheduler;
pub mod state_machine;
pub mod tally;

#[cfg(kani)]
mod kani_proofs;

#[cfg(test)]
mod tests;

pub use applied::AppliedIndex;
pub use cluster::{ClusterView, ReconfigError};
pub use config::{ConfigError, ConfigLoader, EngineConfig};
pub use engine::{
    AppliedSlot, BatchOutcome, ConsensusEngine, EngineHealth, EngineInput, EngineOutput, NodeStatus,
    PeerLiveness, SlotResolution,
};
pub use error::{EngineError, Result};
pub use message::{Message, MessagePayload, SnapshotTransfer};
pub use observer::{Notification, StateObserver};
pub use runtime::{
    ChannelNetwork, EngineHandle, FaultConfig, Transport, spawn,
};
pub use state_machine::{KvCommand, KvStateMachine, StateMachine, StateMachineError};

pub use rabia_types::{
    Attempt, Batch, BatchDigest, BatchId, Command, Epoch, MembershipChange, NodeId,
    Reconfiguration, Round, SequenceNumber, StateValue, Timestamp,
};
