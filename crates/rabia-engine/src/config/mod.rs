//! Engine configuration.
//!
//! All protocol timers are expressed in ticks so the pure engine never
//! reads a clock. The runtime turns ticks into wall time with
//! `tick_interval_ms`; the simulator advances ticks directly.
//!
//! Configuration is loaded with the following precedence:
//! 1. Environment variables (`RABIA_*` prefix)
//! 2. An optional TOML file
//! 3. Built-in defaults (lowest precedence)

use std::time::Duration;

use serde::{Deserialize, Serialize};

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::ConfigLoader;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of per-slot states kept in memory.
    pub phase_cache_capacity: usize,
    /// How many slots past the lowest undecided one a node may open.
    pub pipeline_depth: u64,
    /// Messages for slots further ahead than this are not cached; they
    /// trigger catch-up instead.
    pub max_future_slots: u64,
    /// Ticks between retransmissions of proposals and votes.
    pub retransmit_interval_ticks: u64,
    pub heartbeat_interval_ticks: u64,
    /// A member not heard from for this long counts as unreachable.
    pub peer_timeout_ticks: u64,
    /// Maximum decisions requested per catch-up round trip.
    pub catch_up_batch: u64,
    /// Minimum ticks between snapshots sent to the same peer.
    pub snapshot_cooldown_ticks: u64,
    /// Ticks between cache eviction sweeps.
    pub sweep_interval_ticks: u64,
    /// Ticks between re-broadcasts of this node's uncommitted submissions.
    pub resubmit_interval_ticks: u64,
    /// Wall-clock length of one tick in the runtime.
    pub tick_interval_ms: u64,
    /// Default deadline for `EngineHandle::apply`.
    pub apply_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            phase_cache_capacity: 1000,
            pipeline_depth: 4,
            max_future_slots: 256,
            retransmit_interval_ticks: 5,
            heartbeat_interval_ticks: 5,
            peer_timeout_ticks: 50,
            catch_up_batch: 64,
            snapshot_cooldown_ticks: 20,
            sweep_interval_ticks: 10,
            resubmit_interval_ticks: 20,
            tick_interval_ms: 10,
            apply_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// Configuration for tests: short timers, small windows.
    pub fn testing() -> Self {
        Self {
            phase_cache_capacity: 64,
            pipeline_depth: 2,
            max_future_slots: 64,
            retransmit_interval_ticks: 3,
            heartbeat_interval_ticks: 4,
            peer_timeout_ticks: 20,
            catch_up_batch: 16,
            snapshot_cooldown_ticks: 8,
            sweep_interval_ticks: 5,
            resubmit_interval_ticks: 12,
            tick_interval_ms: 2,
            apply_timeout_ms: 2_000,
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.phase_cache_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "phase_cache_capacity must be positive".into(),
            ));
        }
        if self.pipeline_depth == 0 || self.pipeline_depth > self.max_future_slots {
            return Err(ConfigError::ValidationError(format!(
                "pipeline_depth must be in 1..={} (max_future_slots)",
                self.max_future_slots
            )));
        }
        if self.phase_cache_capacity < self.max_future_slots as usize {
            return Err(ConfigError::ValidationError(
                "phase_cache_capacity must cover max_future_slots".into(),
            ));
        }
        let timers = [
            ("retransmit_interval_ticks", self.retransmit_interval_ticks),
            ("heartbeat_interval_ticks", self.heartbeat_interval_ticks),
            ("sweep_interval_ticks", self.sweep_interval_ticks),
            ("resubmit_interval_ticks", self.resubmit_interval_ticks),
            ("tick_interval_ms", self.tick_interval_ms),
            ("catch_up_batch", self.catch_up_batch),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ValidationError(format!("{name} must be positive")));
        }
        if self.peer_timeout_ticks <= self.heartbeat_interval_ticks {
            return Err(ConfigError::ValidationError(
                "peer_timeout_ticks must exceed heartbeat_interval_ticks".into(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }
}
