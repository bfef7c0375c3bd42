//! Bounded retention of per-slot state.
//!
//! [`PhaseCache`] stores [`PhaseState`]s in an arena (`Vec` of slots plus a
//! free list) with a sequence → index map and an LRU index keyed by a
//! monotonically increasing touch stamp. Eviction walks the LRU index from
//! the oldest stamp and only removes slots that are decided *and* applied;
//! everything else is pinned, in particular the lowest undecided slot.
//!
//! Once a slot is evicted, requests for it can no longer be answered from
//! memory and the engine falls back to a snapshot transfer.

use std::collections::{BTreeMap, HashMap};

use rabia_types::SequenceNumber;

use crate::phase::PhaseState;

#[derive(Debug, Clone)]
struct Entry {
    phase: PhaseState,
    stamp: u64,
}

#[derive(Debug, Clone)]
pub struct PhaseCache {
    capacity: usize,
    arena: Vec<Option<Entry>>,
    free: Vec<usize>,
    index: HashMap<SequenceNumber, usize>,
    lru: BTreeMap<u64, SequenceNumber>,
    next_stamp: u64,
}

impl PhaseCache {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "phase cache capacity must be positive");
        Self {
            capacity,
            arena: Vec::with_capacity(capacity),
            free: Vec::new(),
            index: HashMap::with_capacity(capacity),
            lru: BTreeMap::new(),
            next_stamp: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, sequence: SequenceNumber) -> bool {
        self.index.contains_key(&sequence)
    }

    /// Returns the slot's state, creating it if absent. Touches the entry.
    pub fn get_or_create(&mut self, sequence: SequenceNumber) -> &mut PhaseState {
        let stamp = self.bump_stamp();
        let idx = if let Some(&idx) = self.index.get(&sequence) {
            self.retouch(idx, stamp);
            idx
        } else {
            let entry = Entry {
                phase: PhaseState::new(sequence),
                stamp,
            };
            let idx = match self.free.pop() {
                Some(idx) => {
                    self.arena[idx] = Some(entry);
                    idx
                }
                None => {
                    self.arena.push(Some(entry));
                    self.arena.len() - 1
                }
            };
            self.index.insert(sequence, idx);
            self.lru.insert(stamp, sequence);
            idx
        };
        &mut self.entry_mut(idx).phase
    }

    /// Mutable access to an existing slot. Touches the entry.
    pub fn get_mut(&mut self, sequence: SequenceNumber) -> Option<&mut PhaseState> {
        let idx = *self.index.get(&sequence)?;
        let stamp = self.bump_stamp();
        self.retouch(idx, stamp);
        Some(&mut self.entry_mut(idx).phase)
    }

    /// Read access without affecting recency.
    pub fn peek(&self, sequence: SequenceNumber) -> Option<&PhaseState> {
        let idx = *self.index.get(&sequence)?;
        self.arena[idx].as_ref().map(|entry| &entry.phase)
    }

    /// Open slots in ascending sequence order.
    pub fn sequences(&self) -> Vec<SequenceNumber> {
        let mut sequences: Vec<SequenceNumber> = self.index.keys().copied().collect();
        sequences.sort_unstable();
        sequences
    }

    /// Evicts least-recently-touched slots that are decided and applied
    /// (`<= applied_through`) until the cache is within capacity.
    ///
    /// Returns the evicted sequence numbers.
    pub fn evict(&mut self, applied_through: SequenceNumber) -> Vec<SequenceNumber> {
        let mut evicted = Vec::new();
        if self.len() <= self.capacity {
            return evicted;
        }

        let candidates: Vec<(u64, SequenceNumber)> = self
            .lru
            .iter()
            .filter(|(_, seq)| **seq <= applied_through)
            .map(|(stamp, seq)| (*stamp, *seq))
            .collect();

        for (stamp, sequence) in candidates {
            if self.len() <= self.capacity {
                break;
            }
            let evictable = self
                .peek(sequence)
                .is_some_and(|phase| phase.is_decided() && !phase.awaiting_batch());
            if !evictable {
                continue;
            }
            self.lru.remove(&stamp);
            self.release(sequence);
            evicted.push(sequence);
        }
        evicted
    }

    /// Drops every slot at or below `through`, regardless of recency.
    ///
    /// Used after a snapshot restore made those slots irrelevant.
    pub fn remove_through(&mut self, through: SequenceNumber) -> usize {
        let doomed: Vec<(u64, SequenceNumber)> = self
            .lru
            .iter()
            .filter(|(_, seq)| **seq <= through)
            .map(|(stamp, seq)| (*stamp, *seq))
            .collect();
        for (stamp, sequence) in &doomed {
            self.lru.remove(stamp);
            self.release(*sequence);
        }
        doomed.len()
    }

    fn release(&mut self, sequence: SequenceNumber) {
        if let Some(idx) = self.index.remove(&sequence) {
            self.arena[idx] = None;
            self.free.push(idx);
        }
    }

    fn bump_stamp(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }

    fn retouch(&mut self, idx: usize, stamp: u64) {
        let entry = self.entry_mut(idx);
        let old = entry.stamp;
        entry.stamp = stamp;
        let sequence = entry.phase.sequence();
        self.lru.remove(&old);
        self.lru.insert(stamp, sequence);
    }

    fn entry_mut(&mut self, idx: usize) -> &mut Entry {
        self.arena[idx]
            .as_mut()
            .expect("phase cache index points at a live arena slot")
    }
}
