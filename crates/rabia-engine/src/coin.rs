//! Common coin.
//!
//! A pseudo-random bit every node computes identically from `(sequence,
//! attempt)`, so it never has to be transmitted. It only breaks ties after a
//! round 2 with no definite value; safety never depends on it.

use rabia_types::{Attempt, SequenceNumber, StateValue};

/// Fixed key for the keyed hash. Changing it changes every coin flip.
const COIN_KEY: [u8; 32] = *b"rabia-common-coin-v1-domain-key!";

/// Flips the shared coin for `sequence` at `attempt`.
pub fn common_coin(sequence: SequenceNumber, attempt: Attempt) -> StateValue {
    let mut input = [0u8; 12];
    input[..8].copy_from_slice(&sequence.as_u64().to_le_bytes());
    input[8..].copy_from_slice(&attempt.as_u32().to_le_bytes());
    let hash = blake3::keyed_hash(&COIN_KEY, &input);
    StateValue::from_bit(hash.as_bytes()[0] & 1 == 1)
}
