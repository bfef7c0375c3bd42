//! In-process network for running several engines in one process.
//!
//! Every node registers an inbound channel; [`ChannelNetwork::send`]
//! routes a message to its target (or to every other node for broadcasts).
//!
//! Supports:
//! - Probabilistic loss and duplication
//! - Random delivery delay (which also reorders messages)
//! - Directional partitions between node pairs and whole-node isolation

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rabia_types::NodeId;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use crate::message::Message;

use super::Transport;

/// Fault injection settings. The default delivers everything immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultConfig {
    /// Probability (0.0 - 1.0) that a delivery is dropped.
    pub loss_probability: f64,
    /// Probability (0.0 - 1.0) that a delivery happens twice.
    pub duplicate_probability: f64,
    /// Upper bound of the random delay added to each delivery.
    pub max_delay: Duration,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            loss_probability: 0.0,
            duplicate_probability: 0.0,
            max_delay: Duration::ZERO,
        }
    }
}

impl FaultConfig {
    /// Lossy, duplicating, reordering network.
    pub fn chaotic() -> Self {
        Self {
            loss_probability: 0.1,
            duplicate_probability: 0.05,
            max_delay: Duration::from_millis(5),
        }
    }
}

#[derive(Debug)]
struct NetworkState {
    routes: BTreeMap<NodeId, mpsc::UnboundedSender<Message>>,
    faults: FaultConfig,
    /// If (a, b) is present, messages from a to b are dropped.
    partitions: BTreeSet<(NodeId, NodeId)>,
    rng: SmallRng,
}

/// Cloneable handle to a shared in-process network.
#[derive(Debug, Clone)]
pub struct ChannelNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl ChannelNetwork {
    pub fn new(faults: FaultConfig) -> Self {
        Self::with_rng(faults, SmallRng::from_entropy())
    }

    /// Network whose fault decisions follow `seed`.
    pub fn seeded(faults: FaultConfig, seed: u64) -> Self {
        Self::with_rng(faults, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(faults: FaultConfig, rng: SmallRng) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                routes: BTreeMap::new(),
                faults,
                partitions: BTreeSet::new(),
                rng,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches a node and returns its inbound channel.
    ///
    /// Registering an id again replaces the previous channel.
    pub fn register(&self, node: NodeId) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().routes.insert(node, tx);
        rx
    }

    pub fn unregister(&self, node: NodeId) {
        self.lock().routes.remove(&node);
    }

    pub fn set_faults(&self, faults: FaultConfig) {
        self.lock().faults = faults;
    }

    // ─── Partition Management ───

    /// Drops all traffic to and from `node`.
    pub fn isolate(&self, node: NodeId) {
        let mut state = self.lock();
        let others: Vec<NodeId> = state.routes.keys().copied().filter(|id| *id != node).collect();
        for other in others {
            state.partitions.insert((node, other));
            state.partitions.insert((other, node));
        }
    }

    /// Restores all traffic to and from `node`.
    pub fn reconnect(&self, node: NodeId) {
        self.lock()
            .partitions
            .retain(|(from, to)| *from != node && *to != node);
    }

    /// Drops all traffic between `group_a` and `group_b`, both directions.
    pub fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        let mut state = self.lock();
        for &a in group_a {
            for &b in group_b {
                state.partitions.insert((a, b));
                state.partitions.insert((b, a));
            }
        }
    }

    pub fn heal(&self) {
        self.lock().partitions.clear();
    }

    pub fn is_partitioned(&self, from: NodeId, to: NodeId) -> bool {
        self.lock().partitions.contains(&(from, to))
    }

    // ─── Routing ───

    fn route(&self, message: Message) {
        let mut state = self.lock();
        let targets: Vec<NodeId> = match message.to {
            Some(to) => vec![to],
            None => state
                .routes
                .keys()
                .copied()
                .filter(|id| *id != message.from)
                .collect(),
        };

        for target in targets {
            if state.partitions.contains(&(message.from, target)) {
                continue;
            }
            let Some(route) = state.routes.get(&target).cloned() else {
                continue;
            };
            let faults = state.faults.clone();
            if faults.loss_probability > 0.0 && state.rng.gen_bool(faults.loss_probability) {
                tracing::trace!(from = %message.from, to = %target, "dropping message");
                continue;
            }
            let copies = if faults.duplicate_probability > 0.0
                && state.rng.gen_bool(faults.duplicate_probability)
            {
                2
            } else {
                1
            };
            for _ in 0..copies {
                let delay = if faults.max_delay.is_zero() {
                    Duration::ZERO
                } else {
                    let max = faults.max_delay.as_micros() as u64;
                    Duration::from_micros(state.rng.gen_range(0..=max))
                };
                deliver(route.clone(), message.clone(), delay);
            }
        }
    }
}

impl Transport for ChannelNetwork {
    fn send(&self, message: Message) {
        self.route(message);
    }
}

fn deliver(route: mpsc::UnboundedSender<Message>, message: Message, delay: Duration) {
    if delay.is_zero() {
        // A closed channel means the node shut down.
        let _ = route.send(message);
        return;
    }
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = route.send(message);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessagePayload;
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

    #[tokio::test]
    async fn test_broadcast_reaches_every_other_node() {
        let network = ChannelNetwork::seeded(FaultConfig::default(), 1);
        let mut rx1 = network.register(NodeId::new(1));
        let mut rx2 = network.register(NodeId::new(2));
        let mut rx3 = network.register(NodeId::new(3));

        network.send(heartbeat(1));
        assert_eq!(rx2.recv().await.map(|m| m.from), Some(NodeId::new(1)));
        assert_eq!(rx3.recv().await.map(|m| m.from), Some(NodeId::new(1)));
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_isolation_drops_both_directions() {
        let network = ChannelNetwork::seeded(FaultConfig::default(), 1);
        let mut rx1 = network.register(NodeId::new(1));
        let mut rx2 = network.register(NodeId::new(2));

        network.isolate(NodeId::new(2));
        network.send(heartbeat(1));
        network.send(heartbeat(2));
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());

        network.reconnect(NodeId::new(2));
        network.send(heartbeat(1));
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_total_loss_drops_everything() {
        let faults = FaultConfig {
            loss_probability: 1.0,
            ..FaultConfig::default()
        };
        let network = ChannelNetwork::seeded(faults, 7);
        let _rx1 = network.register(NodeId::new(1));
        let mut rx2 = network.register(NodeId::new(2));
        for _ in 0..10 {
            network.send(heartbeat(1));
        }
        assert!(rx2.try_recv().is_err());
    }
}
