//! The replicated state machine the engine feeds decided batches into.
//!
//! The engine owns one [`StateMachine`] per node and applies decided
//! batches strictly in sequence order. Only [`Command::Opaque`] payloads
//! reach the state machine; membership changes are interpreted by the
//! engine.
//!
//! [`KvStateMachine`] is a small in-memory key/value store used by the
//! simulation harness and the runtime tests.
//!
//! [`Command::Opaque`]: rabia_types::Command::Opaque

use std::collections::BTreeMap;

use bytes::Bytes;
use rabia_types::{Batch, SequenceNumber};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("failed to encode state: {0}")]
    Encode(#[source] postcard::Error),

    #[error("failed to decode state: {0}")]
    Decode(#[source] postcard::Error),
}

/// Deterministic application logic replicated on every node.
pub trait StateMachine: Send + 'static {
    /// Applies the opaque commands of a decided batch.
    ///
    /// Returns one result per opaque command, in order.
    fn apply(&mut self, sequence: SequenceNumber, batch: &Batch) -> Vec<Bytes>;

    /// Serializes the full state.
    fn snapshot(&self) -> Result<Bytes, StateMachineError>;

    /// Replaces the full state with a snapshot.
    fn restore(&mut self, snapshot: &[u8]) -> Result<(), StateMachineError>;
}

// ============================================================================
// Key/Value State Machine
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Put { key: Bytes, value: Bytes },
    Delete { key: Bytes },
}

impl KvCommand {
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        KvCommand::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Bytes>) -> Self {
        KvCommand::Delete { key: key.into() }
    }

    pub fn encode(&self) -> Result<Bytes, StateMachineError> {
        postcard::to_allocvec(self)
            .map(Bytes::from)
            .map_err(StateMachineError::Encode)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvStateMachine {
    entries: BTreeMap<Bytes, Bytes>,
    /// Highest sequence applied, for diagnostics.
    last_applied: SequenceNumber,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Bytes> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_applied(&self) -> SequenceNumber {
        self.last_applied
    }
}

#[derive(Serialize, Deserialize)]
struct KvSnapshot {
    last_applied: SequenceNumber,
    entries: Vec<(Bytes, Bytes)>,
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, sequence: SequenceNumber, batch: &Batch) -> Vec<Bytes> {
        assert!(
            sequence > self.last_applied,
            "state machine applied out of order: {sequence} after {}",
            self.last_applied
        );
        self.last_applied = sequence;

        batch
            .opaque_commands()
            .map(|raw| match postcard::from_bytes::<KvCommand>(raw) {
                Ok(KvCommand::Put { key, value }) => {
                    self.entries.insert(key, value).unwrap_or_default()
                }
                Ok(KvCommand::Delete { key }) => self.entries.remove(&key).unwrap_or_default(),
                Err(error) => {
                    tracing::warn!(
                        seq = %sequence,
                        batch = %batch.id,
                        %error,
                        "skipping undecodable kv command"
                    );
                    Bytes::new()
                }
            })
            .collect()
    }

    fn snapshot(&self) -> Result<Bytes, StateMachineError> {
        let snapshot = KvSnapshot {
            last_applied: self.last_applied,
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        postcard::to_allocvec(&snapshot)
            .map(Bytes::from)
            .map_err(StateMachineError::Encode)
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<(), StateMachineError> {
        let snapshot: KvSnapshot =
            postcard::from_bytes(snapshot).map_err(StateMachineError::Decode)?;
        self.last_applied = snapshot.last_applied;
        self.entries = snapshot.entries.into_iter().collect();
        Ok(())
    }
}
