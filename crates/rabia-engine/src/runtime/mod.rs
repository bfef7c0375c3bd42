//! Tokio runtime for a [`ConsensusEngine`].
//!
//! [`spawn`] moves an engine onto its own task and returns an
//! [`EngineHandle`]. The task owns the engine exclusively; callers talk to
//! it through channels, so the engine itself never needs a lock.
//!
//! ```text
//!   EngineHandle ──requests──┐
//!   Transport    ──inbound───┼──► engine task ──► Transport::send
//!   interval     ──ticks─────┘         │
//!                                      └──notifications──► observer task
//! ```
//!
//! Observers run on a separate task: a slow observer delays other
//! observers, never consensus.

mod network;

pub use network::{ChannelNetwork, FaultConfig};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rabia_types::{BatchId, MembershipChange, NodeId, Timestamp};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};

use crate::engine::{
    BatchOutcome, ConsensusEngine, EngineHealth, EngineInput, EngineOutput, SlotResolution,
};
use crate::error::{EngineError, Result};
use crate::message::Message;
use crate::observer::{Notification, StateObserver};
use crate::state_machine::StateMachine;

/// Outbound message delivery.
///
/// Delivery is best-effort: implementations may drop, duplicate, delay or
/// reorder messages. The engine retransmits until it makes progress.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, message: Message);
}

// ============================================================================
// Requests
// ============================================================================

enum Request {
    Apply {
        commands: Vec<Bytes>,
        reply: oneshot::Sender<Result<BatchOutcome>>,
    },
    Reconfigure {
        change: MembershipChange,
        reply: oneshot::Sender<Result<BatchOutcome>>,
    },
    SetConnected(bool),
    Health(oneshot::Sender<EngineHealth>),
    RegisterObserver(Arc<dyn StateObserver>),
    Shutdown(oneshot::Sender<()>),
}

enum ObserverEvent {
    Register(Arc<dyn StateObserver>),
    Notify(Notification),
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    node_id: NodeId,
    requests: mpsc::UnboundedSender<Request>,
    default_timeout: Duration,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl EngineHandle {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Submits opaque commands and waits until they are applied.
    ///
    /// Uses the configured `apply_timeout_ms`. Returns one result per
    /// command, or [`BatchOutcome::Installed`] when this node learned of
    /// the commit through a snapshot.
    pub async fn apply(&self, commands: Vec<Bytes>) -> Result<BatchOutcome> {
        self.apply_with_timeout(commands, self.default_timeout).await
    }

    pub async fn apply_with_timeout(
        &self,
        commands: Vec<Bytes>,
        timeout: Duration,
    ) -> Result<BatchOutcome> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Apply { commands, reply })?;
        self.await_reply(rx, timeout).await
    }

    /// Adds `node` as a learner. It is promoted once it has caught up.
    pub async fn add_node(&self, node: NodeId) -> Result<()> {
        self.reconfigure(MembershipChange::AddNode(node)).await
    }

    pub async fn remove_node(&self, node: NodeId) -> Result<()> {
        self.reconfigure(MembershipChange::RemoveNode(node)).await
    }

    async fn reconfigure(&self, change: MembershipChange) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Reconfigure { change, reply })?;
        self.await_reply(rx, self.default_timeout).await.map(|_| ())
    }

    pub fn set_connected(&self, connected: bool) -> Result<()> {
        self.request(Request::SetConnected(connected))
    }

    pub async fn health(&self) -> Result<EngineHealth> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Health(reply))?;
        rx.await.map_err(|_| EngineError::Shutdown)
    }

    /// Registers an observer for state-change notifications.
    ///
    /// Observers see notifications produced after registration.
    pub fn register_observer(&self, observer: impl StateObserver) -> Result<()> {
        self.request(Request::RegisterObserver(Arc::new(observer)))
    }

    /// Stops the engine. Pending callers fail with [`EngineError::Shutdown`].
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Shutdown(reply))?;
        rx.await.map_err(|_| EngineError::Shutdown)
    }

    fn request(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| EngineError::Shutdown)
    }

    async fn await_reply(
        &self,
        rx: oneshot::Receiver<Result<BatchOutcome>>,
        timeout: Duration,
    ) -> Result<BatchOutcome> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::Shutdown),
            Err(_) => {
                let health = self.health().await?;
                if health.quorum_available() {
                    Err(EngineError::Timeout)
                } else {
                    Err(EngineError::QuorumUnavailable {
                        reachable: health.reachable_members,
                        required: health.quorum_size,
                    })
                }
            }
        }
    }
}

// ============================================================================
// Spawning
// ============================================================================

/// Runs `engine` on a new tokio task.
///
/// `inbound` carries messages addressed to this node; outbound messages go
/// through `transport`. Must be called within a tokio runtime.
pub fn spawn<S, T>(
    engine: ConsensusEngine<S>,
    transport: Arc<T>,
    inbound: mpsc::UnboundedReceiver<Message>,
) -> EngineHandle
where
    S: StateMachine,
    T: Transport + ?Sized,
{
    let node_id = engine.node_id();
    let default_timeout = engine.config().apply_timeout();
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (observer_tx, observer_rx) = mpsc::unbounded_channel();

    tokio::spawn(run_observers(observer_rx));
    let driver = Driver {
        transport,
        waiters: BTreeMap::new(),
        observers: observer_tx,
    };
    tokio::spawn(run_engine(engine, driver, inbound, requests_rx));

    EngineHandle {
        node_id,
        requests: requests_tx,
        default_timeout,
    }
}

// ============================================================================
// Engine Task
// ============================================================================

/// Executes engine outputs: sends messages, completes waiters, forwards
/// notifications.
struct Driver<T: ?Sized> {
    transport: Arc<T>,
    waiters: BTreeMap<BatchId, oneshot::Sender<Result<BatchOutcome>>>,
    observers: mpsc::UnboundedSender<ObserverEvent>,
}

impl<T: Transport + ?Sized> Driver<T> {
    fn execute(&mut self, output: EngineOutput) {
        for message in output.messages {
            self.transport.send(message);
        }
        for slot in output.slots {
            let (batch_id, result) = match slot.resolution {
                SlotResolution::Committed { batch_id, results } => {
                    (batch_id, Ok(BatchOutcome::Applied(results)))
                }
                SlotResolution::Rejected { batch_id, error } => (batch_id, Err(error)),
                SlotResolution::Duplicate { .. } | SlotResolution::Skipped => continue,
            };
            self.complete(batch_id, result);
        }
        for (batch_id, result) in output.resolved_via_snapshot {
            self.complete(batch_id, result);
        }
        for notification in output.notifications {
            // The observer task only stops once the engine task is gone.
            let _ = self.observers.send(ObserverEvent::Notify(notification));
        }
    }

    fn complete(&mut self, batch_id: BatchId, result: Result<BatchOutcome>) {
        if let Some(waiter) = self.waiters.remove(&batch_id) {
            let _ = waiter.send(result);
        }
    }

    /// Registers the caller of a submission, or answers it right away if
    /// the engine refused it.
    fn accept(
        &mut self,
        accepted: Option<Result<BatchId>>,
        reply: oneshot::Sender<Result<BatchOutcome>>,
    ) {
        match accepted {
            Some(Ok(batch_id)) => {
                self.waiters.insert(batch_id, reply);
            }
            Some(Err(error)) => {
                let _ = reply.send(Err(error));
            }
            None => {
                let _ = reply.send(Err(EngineError::NodeInactive));
            }
        }
    }

    fn fail_all(&mut self, error: &EngineError) {
        for (_, waiter) in std::mem::take(&mut self.waiters) {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

enum Event {
    Input(EngineInput),
    Request(Request),
    Tick,
}

async fn run_engine<S, T>(
    mut engine: ConsensusEngine<S>,
    mut driver: Driver<T>,
    mut inbound: mpsc::UnboundedReceiver<Message>,
    mut requests: mpsc::UnboundedReceiver<Request>,
) where
    S: StateMachine,
    T: Transport + ?Sized,
{
    let node_id = engine.node_id();
    let sweep_every = engine.config().sweep_interval_ticks;
    let mut ticker = interval(engine.config().tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks: u64 = 0;
    let mut shutdown_reply = None;

    tracing::info!(node = %node_id, "engine task started");

    loop {
        let event = tokio::select! {
            biased;
            Some(message) = inbound.recv() => Event::Input(EngineInput::Message(message)),
            request = requests.recv() => match request {
                Some(request) => Event::Request(request),
                None => break,
            },
            _ = ticker.tick() => Event::Tick,
        };

        match event {
            Event::Input(input) => {
                let (next, output) = engine.process(input);
                engine = next;
                driver.execute(output);
            }
            Event::Tick => {
                ticks += 1;
                let (next, output) = engine.process(EngineInput::Tick {
                    now: Timestamp::now(),
                });
                engine = next;
                driver.execute(output);

                if ticks % sweep_every == 0 {
                    let (next, output) = engine.process(EngineInput::Sweep);
                    engine = next;
                    driver.execute(output);
                    driver.waiters.retain(|_, waiter| !waiter.is_closed());
                }
            }
            Event::Request(Request::Apply { commands, reply }) => {
                let (next, mut output) = engine.process(EngineInput::Submit {
                    commands,
                    now: Timestamp::now(),
                });
                engine = next;
                driver.accept(output.accepted.take(), reply);
                driver.execute(output);
            }
            Event::Request(Request::Reconfigure { change, reply }) => {
                let (next, mut output) = engine.process(EngineInput::Reconfigure {
                    change,
                    now: Timestamp::now(),
                });
                engine = next;
                driver.accept(output.accepted.take(), reply);
                driver.execute(output);
            }
            Event::Request(Request::SetConnected(connected)) => {
                let (next, output) = engine.process(EngineInput::SetConnected(connected));
                engine = next;
                driver.execute(output);
            }
            Event::Request(Request::Health(reply)) => {
                let _ = reply.send(engine.health());
            }
            Event::Request(Request::RegisterObserver(observer)) => {
                let _ = driver.observers.send(ObserverEvent::Register(observer));
            }
            Event::Request(Request::Shutdown(reply)) => {
                shutdown_reply = Some(reply);
                break;
            }
        }
    }

    driver.fail_all(&EngineError::Shutdown);
    tracing::info!(
        node = %node_id,
        applied_through = %engine.applied_through(),
        "engine task stopped"
    );
    if let Some(reply) = shutdown_reply {
        let _ = reply.send(());
    }
}

async fn run_observers(mut events: mpsc::UnboundedReceiver<ObserverEvent>) {
    let mut observers: Vec<Arc<dyn StateObserver>> = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            ObserverEvent::Register(observer) => observers.push(observer),
            ObserverEvent::Notify(notification) => {
                for observer in &observers {
                    observer.notify(&notification);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterView;
    use crate::config::EngineConfig;
    use crate::state_machine::{KvCommand, KvStateMachine};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn put(key: &str, value: &str) -> Bytes {
        KvCommand::put(key.to_owned(), value.to_owned())
            .encode()
            .expect("encode")
    }

    fn start_cluster(size: u64, network: &ChannelNetwork) -> Vec<EngineHandle> {
        let view = ClusterView::new((1..=size).map(NodeId::new));
        let transport = Arc::new(network.clone());
        (1..=size)
            .map(|id| {
                let node = NodeId::new(id);
                let inbound = network.register(node);
                let engine = ConsensusEngine::new(
                    node,
                    view.clone(),
                    KvStateMachine::new(),
                    EngineConfig::testing(),
                );
                spawn(engine, Arc::clone(&transport), inbound)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_apply_returns_results_on_every_node() {
        let network = ChannelNetwork::seeded(FaultConfig::default(), 3);
        let handles = start_cluster(3, &network);

        let outcome = handles[0]
            .apply(vec![put("x", "1"), put("x", "2")])
            .await
            .expect("applied");
        // Put returns the previous value.
        assert_eq!(
            outcome,
            BatchOutcome::Applied(vec![Bytes::new(), Bytes::from("1")])
        );

        let outcome = handles[2].apply(vec![put("x", "3")]).await.expect("applied");
        assert_eq!(outcome.results(), Some(&[Bytes::from("2")][..]));

        for handle in &handles {
            handle.shutdown().await.expect("shutdown");
        }
    }

    #[tokio::test]
    async fn test_observers_receive_applied_batches() {
        let network = ChannelNetwork::seeded(FaultConfig::default(), 4);
        let handles = start_cluster(3, &network);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        handles[1]
            .register_observer(move |notification: &Notification| {
                if let Notification::BatchApplied { batch_id, .. } = notification {
                    sink.lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .push(*batch_id);
                }
            })
            .expect("registered");

        handles[0].apply(vec![put("k", "v")]).await.expect("applied");
        // Node 2 applies independently; give it a moment.
        for _ in 0..100 {
            if !seen.lock().expect("lock").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_node_rejects_immediately() {
        let network = ChannelNetwork::seeded(FaultConfig::default(), 5);
        let handles = start_cluster(3, &network);

        handles[0].set_connected(false).expect("sent");
        let result = handles[0].apply(vec![put("x", "1")]).await;
        assert_eq!(result, Err(EngineError::NodeInactive));
    }

    #[tokio::test]
    async fn test_timeout_reports_quorum_unavailable() {
        let network = ChannelNetwork::seeded(FaultConfig::default(), 6);
        let handles = start_cluster(3, &network);
        network.isolate(NodeId::new(1));

        let result = handles[0]
            .apply_with_timeout(vec![put("x", "1")], Duration::from_millis(200))
            .await;
        assert_eq!(
            result,
            Err(EngineError::QuorumUnavailable {
                reachable: 1,
                required: 2
            })
        );
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_callers() {
        let network = ChannelNetwork::seeded(FaultConfig::default(), 8);
        let handles = start_cluster(3, &network);
        network.isolate(NodeId::new(1));

        let pending = {
            let handle = handles[0].clone();
            tokio::spawn(async move { handle.apply(vec![put("x", "1")]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        handles[0].shutdown().await.expect("shutdown");

        let result = pending.await.expect("task joined");
        assert_eq!(result, Err(EngineError::Shutdown));
        assert_eq!(
            handles[0].apply(vec![put("y", "1")]).await,
            Err(EngineError::Shutdown)
        );
    }

    #[tokio::test]
    async fn test_lossy_network_still_commits() {
        let network = ChannelNetwork::seeded(FaultConfig::chaotic(), 9);
        let handles = start_cluster(5, &network);
        let applied = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&applied);
        handles[4]
            .register_observer(move |notification: &Notification| {
                if matches!(notification, Notification::BatchApplied { .. }) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .expect("registered");

        for i in 0..5 {
            let handle = &handles[i % 5];
            handle
                .apply(vec![put(&format!("k{i}"), "v")])
                .await
                .expect("applied despite faults");
        }
        for _ in 0..200 {
            if applied.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(applied.load(Ordering::SeqCst), 5);
    }
}
