//! Simulated network with tick-based latency, loss, duplication and
//! partitions.
//!
//! Messages are queued with a delivery tick drawn from the configured
//! delay range. Different delays reorder messages; equal delivery ticks
//! keep send order, so a run is fully determined by the seed.

use std::collections::{BTreeMap, BTreeSet};

use rabia_engine::Message;
use rabia_types::NodeId;

use crate::rng::SimRng;

/// Configuration for the simulated network.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    /// Minimum delivery delay in ticks (0 = same tick).
    pub min_delay_ticks: u64,
    /// Maximum delivery delay in ticks.
    pub max_delay_ticks: u64,
    /// Probability (0.0 - 1.0) that a delivery is dropped.
    pub drop_probability: f64,
    /// Probability (0.0 - 1.0) that a delivery is duplicated.
    pub duplicate_probability: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            min_delay_ticks: 0,
            max_delay_ticks: 0,
            drop_probability: 0.0,
            duplicate_probability: 0.0,
        }
    }
}

impl NetworkConfig {
    /// Delays, reordering, 10% loss and 5% duplication.
    pub fn lossy() -> Self {
        Self {
            min_delay_ticks: 0,
            max_delay_ticks: 3,
            drop_probability: 0.1,
            duplicate_probability: 0.05,
        }
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
    /// Deliveries refused because of a partition.
    pub blocked: u64,
}

#[derive(Debug, Clone)]
struct InFlight {
    to: NodeId,
    message: Message,
}

/// Simulated network for deterministic message delivery.
#[derive(Debug)]
pub struct SimNetwork {
    config: NetworkConfig,
    nodes: BTreeSet<NodeId>,
    /// If (a, b) is present, messages from a to b are dropped.
    partitions: BTreeSet<(NodeId, NodeId)>,
    /// Keyed by (delivery tick, enqueue order).
    in_flight: BTreeMap<(u64, u64), InFlight>,
    next_id: u64,
    stats: NetworkStats,
}

impl SimNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            nodes: BTreeSet::new(),
            partitions: BTreeSet::new(),
            in_flight: BTreeMap::new(),
            next_id: 0,
            stats: NetworkStats::default(),
        }
    }

    pub fn register_node(&mut self, node: NodeId) {
        self.nodes.insert(node);
    }

    /// Detaches a node. Messages already in flight to it are discarded.
    pub fn unregister_node(&mut self, node: NodeId) {
        self.nodes.remove(&node);
        self.in_flight.retain(|_, flight| flight.to != node);
        self.partitions
            .retain(|(from, to)| *from != node && *to != node);
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: NetworkConfig) {
        self.config = config;
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    // ─── Partition Management ───

    pub fn is_partitioned(&self, from: NodeId, to: NodeId) -> bool {
        self.partitions.contains(&(from, to))
    }

    /// Blocks traffic between the two groups in both directions.
    pub fn partition(&mut self, group_a: &[NodeId], group_b: &[NodeId]) {
        for &a in group_a {
            for &b in group_b {
                self.partitions.insert((a, b));
                self.partitions.insert((b, a));
            }
        }
    }

    /// Blocks traffic from `from` to `to` only.
    pub fn partition_unidirectional(&mut self, from: NodeId, to: NodeId) {
        self.partitions.insert((from, to));
    }

    pub fn isolate(&mut self, node: NodeId) {
        let others: Vec<NodeId> = self.nodes.iter().copied().filter(|n| *n != node).collect();
        self.partition(&[node], &others);
    }

    pub fn reconnect(&mut self, node: NodeId) {
        self.partitions
            .retain(|(from, to)| *from != node && *to != node);
    }

    pub fn heal(&mut self) {
        self.partitions.clear();
    }

    // ─── Sending and Delivery ───

    /// Queues `message` for its target, or for every other registered
    /// node when it is a broadcast.
    pub fn send(&mut self, message: Message, now: u64, rng: &mut SimRng) {
        let targets: Vec<NodeId> = match message.to {
            Some(to) => vec![to],
            None => self
                .nodes
                .iter()
                .copied()
                .filter(|n| *n != message.from)
                .collect(),
        };

        for to in targets {
            self.stats.sent += 1;
            if !self.nodes.contains(&to) {
                self.stats.dropped += 1;
                continue;
            }
            if self.is_partitioned(message.from, to) {
                self.stats.blocked += 1;
                continue;
            }
            if rng.next_bool_with_probability(self.config.drop_probability) {
                self.stats.dropped += 1;
                continue;
            }
            let copies = if rng.next_bool_with_probability(self.config.duplicate_probability) {
                self.stats.duplicated += 1;
                2
            } else {
                1
            };
            for _ in 0..copies {
                let delay = rng.next_u64_inclusive(
                    self.config.min_delay_ticks,
                    self.config.max_delay_ticks.max(self.config.min_delay_ticks),
                );
                self.enqueue(now + delay, to, message.clone());
            }
        }
    }

    fn enqueue(&mut self, deliver_at: u64, to: NodeId, message: Message) {
        let id = self.next_id;
        self.next_id += 1;
        self.in_flight.insert((deliver_at, id), InFlight { to, message });
    }

    /// Removes and returns the next message due at or before `now`.
    ///
    /// Partitions are checked again at delivery so a partition also cuts
    /// messages that were already in flight.
    pub fn next_ready(&mut self, now: u64) -> Option<(NodeId, Message)> {
        loop {
            let key = *self.in_flight.keys().next()?;
            if key.0 > now {
                return None;
            }
            let flight = self.in_flight.remove(&key)?;
            if self.is_partitioned(flight.message.from, flight.to) {
                self.stats.blocked += 1;
                continue;
            }
            self.stats.delivered += 1;
            return Some((flight.to, flight.message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rabia_engine::MessagePayload;
    use rabia_types::{Epoch, SequenceNumber};

    fn heartbeat(from: u64) -> Message {
        Message::broadcast(
            NodeId::new(from),
            MessagePayload::Heartbeat {
                applied_through: SequenceNumber::ZERO,
                epoch: Epoch::INITIAL,
            },
        )
    }

    fn network(config: NetworkConfig, size: u64) -> SimNetwork {
        let mut net = SimNetwork::new(config);
        for id in 1..=size {
            net.register_node(NodeId::new(id));
        }
        net
    }

    #[test]
    fn test_broadcast_fans_out_to_peers() {
        let mut net = network(NetworkConfig::default(), 3);
        let mut rng = SimRng::new(1);
        net.send(heartbeat(1), 0, &mut rng);

        let mut targets = Vec::new();
        while let Some((to, _)) = net.next_ready(0) {
            targets.push(to);
        }
        assert_eq!(targets, vec![NodeId::new(2), NodeId::new(3)]);
        assert_eq!(net.stats().delivered, 2);
    }

    #[test]
    fn test_delayed_messages_wait_for_their_tick() {
        let config = NetworkConfig {
            min_delay_ticks: 2,
            max_delay_ticks: 2,
            ..NetworkConfig::default()
        };
        let mut net = network(config, 2);
        let mut rng = SimRng::new(1);
        net.send(heartbeat(1), 10, &mut rng);

        assert!(net.next_ready(11).is_none());
        assert!(net.next_ready(12).is_some());
    }

    #[test]
    fn test_partition_blocks_in_flight_messages() {
        let config = NetworkConfig {
            min_delay_ticks: 1,
            max_delay_ticks: 1,
            ..NetworkConfig::default()
        };
        let mut net = network(config, 2);
        let mut rng = SimRng::new(1);
        net.send(heartbeat(1), 0, &mut rng);
        net.isolate(NodeId::new(2));

        assert!(net.next_ready(5).is_none());
        assert_eq!(net.stats().blocked, 1);

        net.reconnect(NodeId::new(2));
        net.send(heartbeat(1), 5, &mut rng);
        assert!(net.next_ready(6).is_some());
    }

    #[test]
    fn test_unidirectional_partition() {
        let mut net = network(NetworkConfig::default(), 2);
        let mut rng = SimRng::new(1);
        net.partition_unidirectional(NodeId::new(1), NodeId::new(2));
        net.send(heartbeat(1), 0, &mut rng);
        net.send(heartbeat(2), 0, &mut rng);

        let delivered: Vec<_> = std::iter::from_fn(|| net.next_ready(0)).collect();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, NodeId::new(1));
    }

    #[test]
    fn test_same_seed_same_schedule() {
        let run = |seed| {
            let mut net = network(NetworkConfig::lossy(), 5);
            let mut rng = SimRng::new(seed);
            for from in 1..=5 {
                net.send(heartbeat(from), 0, &mut rng);
            }
            let mut order = Vec::new();
            for tick in 0..=3 {
                while let Some((to, msg)) = net.next_ready(tick) {
                    order.push((tick, msg.from, to));
                }
            }
            (order, net.stats())
        };
        assert_eq!(run(99), run(99));
    }
}
