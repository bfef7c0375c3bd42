//! # rabia-sim: Deterministic Simulation Testing for `rabia-engine`
//!
//! Runs whole clusters of [`ConsensusEngine`]s in a single thread on a
//! discrete tick clock. Every random choice comes from one seed, so a
//! failing run replays exactly.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     SimCluster                             │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐     │
//! │  │ engine n1    │  │ engine n2    │  │ engine n3    │ ... │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘     │
//! │         └─────────────────┼─────────────────┘             │
//! │                   ┌───────▼────────┐                      │
//! │                   │   SimNetwork   │ ◄── delay, loss,     │
//! │                   └───────┬────────┘     duplication,     │
//! │                           │              partitions       │
//! │                   ┌───────▼────────┐                      │
//! │                   │   Invariants   │ agreement, prefix,   │
//! │                   └────────────────┘ integrity            │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use rabia_sim::{SimCluster, SimConfig};
//! use rabia_types::NodeId;
//!
//! let mut sim = SimCluster::new(SimConfig::new(5, 12345));
//! let batch = sim.put(NodeId::new(1), "x", "1").expect("accepted");
//! sim.run_until(100, "x committed", |s| s.outcome(batch).is_some())
//!     .expect("no invariant violations");
//! ```
//!
//! [`ConsensusEngine`]: rabia_engine::ConsensusEngine

mod cluster;
mod error;
pub mod invariants;
mod network;
mod rng;

pub use cluster::{SimCluster, SimConfig, SimStats, SubmissionOutcome};
pub use error::SimError;
pub use invariants::{AgreementChecker, IntegrityChecker, InvariantResult, PrefixChecker};
pub use network::{NetworkConfig, NetworkStats, SimNetwork};
pub use rng::SimRng;
