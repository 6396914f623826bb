//! Offline coordinator: owns the device connection state and buffers
//! outbound operations while the broker is unreachable.
//!
//! A single task runs [`OfflineCoordinator::run`]. Engines talk to it
//! through [`OfflineChannel`], which implements [`Channel`] by sending
//! commands to that task. Connection changes arrive from the event loop
//! driver as [`ConnectionEvent`]s.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::QoS;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use iotdev_protocol::{IotError, IotResult};

use crate::backoff::Backoff;
use crate::channel::{Channel, ConnectionEvent};
use crate::config::OfflineConfig;
use crate::queue::BoundedQueue;
use crate::router::Router;

/// Connection lifecycle as seen by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Inactive,
    Established,
    Stable,
    Terminating,
}

impl DeviceState {
    pub fn is_online(self) -> bool {
        matches!(self, Self::Established | Self::Stable)
    }
}

/// Called with the disconnect reason when an online connection drops.
pub type ConnectionLostHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone)]
struct QueuedPublish {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
}

#[derive(Debug, Clone)]
enum SubscriptionOp {
    Subscribe(Vec<(String, QoS)>),
    Unsubscribe(Vec<String>),
}

enum Command {
    Publish {
        msg: QueuedPublish,
        reply: oneshot::Sender<IotResult<()>>,
    },
    Subscription {
        op: SubscriptionOp,
        reply: oneshot::Sender<IotResult<()>>,
    },
    Terminate {
        reply: oneshot::Sender<()>,
    },
}

/// Single-consumer state machine over the underlying channel.
pub struct OfflineCoordinator {
    channel: Arc<dyn Channel>,
    config: OfflineConfig,
    backoff: Arc<dyn Backoff>,
    state: DeviceState,
    state_tx: watch::Sender<DeviceState>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    publishes: BoundedQueue<QueuedPublish>,
    subscriptions: BoundedQueue<SubscriptionOp>,
    active: BTreeMap<String, QoS>,
    established_at: Option<Instant>,
    on_connection_lost: Option<ConnectionLostHook>,
}

impl OfflineCoordinator {
    /// Build a coordinator over `channel`.
    ///
    /// Returns the coordinator (to be run in its own task), the handle
    /// engines publish through, and the sender the event loop driver
    /// reports connection changes on.
    pub fn new(
        channel: Arc<dyn Channel>,
        config: OfflineConfig,
        backoff: Arc<dyn Backoff>,
    ) -> (Self, OfflineChannel, mpsc::UnboundedSender<ConnectionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(DeviceState::Inactive);

        let handle = OfflineChannel {
            commands: cmd_tx,
            inner: channel.clone(),
            state: state_rx,
        };

        let coordinator = Self {
            publishes: BoundedQueue::new(config.publish_queue_size, config.drop_policy),
            subscriptions: BoundedQueue::new(config.subscribe_queue_size, config.drop_policy),
            channel,
            config,
            backoff,
            state: DeviceState::Inactive,
            state_tx,
            commands: cmd_rx,
            events: event_rx,
            active: BTreeMap::new(),
            established_at: None,
            on_connection_lost: None,
        };

        (coordinator, handle, event_tx)
    }

    /// Install a hook invoked when an online connection is lost.
    pub fn on_connection_lost<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_connection_lost = Some(Arc::new(hook));
        self
    }

    /// Run until terminated or every [`OfflineChannel`] is dropped.
    pub async fn run(mut self) {
        let mut events_open = true;
        loop {
            let stable_at = self
                .established_at
                .filter(|_| self.state == DeviceState::Established)
                .map(|at| at + self.config.min_stable());

            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Terminate { reply }) => {
                        self.terminate().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.terminate().await;
                        break;
                    }
                },
                event = self.events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => events_open = false,
                },
                _ = stable_timer(stable_at) => self.enter_stable(),
            }
        }
        tracing::info!("offline coordinator stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Publish { msg, reply } => {
                let result = self.publish(msg).await;
                let _ = reply.send(result);
            }
            Command::Subscription { op, reply } => {
                let result = self.subscription(op).await;
                let _ = reply.send(result);
            }
            Command::Terminate { .. } => {}
        }
    }

    async fn publish(&mut self, msg: QueuedPublish) -> IotResult<()> {
        match self.state {
            DeviceState::Established | DeviceState::Stable => {
                if let Err(e) = self.send_publish(&msg).await {
                    tracing::warn!(topic = %msg.topic, error = %e, "publish failed, re-queueing");
                    self.enqueue_publish(msg);
                }
                Ok(())
            }
            DeviceState::Terminating => Err(IotError::Connection("device is terminating".into())),
            DeviceState::Inactive if self.config.queue_offline => {
                self.enqueue_publish(msg);
                Ok(())
            }
            DeviceState::Inactive => {
                tracing::debug!(topic = %msg.topic, "offline, publish dropped");
                Err(IotError::Connection(
                    "offline and queueing is disabled".into(),
                ))
            }
        }
    }

    async fn subscription(&mut self, op: SubscriptionOp) -> IotResult<()> {
        match self.state {
            DeviceState::Established | DeviceState::Stable => {
                if let Err(e) = self.apply_subscription(&op).await {
                    tracing::warn!(error = %e, "subscription change failed, re-queueing");
                    self.enqueue_subscription(op);
                }
                Ok(())
            }
            DeviceState::Terminating => Err(IotError::Connection("device is terminating".into())),
            DeviceState::Inactive if self.config.queue_offline => {
                self.enqueue_subscription(op);
                Ok(())
            }
            DeviceState::Inactive => Err(IotError::Connection(
                "offline and queueing is disabled".into(),
            )),
        }
    }

    async fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { session_present } => {
                if self.state == DeviceState::Terminating {
                    return;
                }
                self.state = DeviceState::Established;
                self.established_at = Some(Instant::now());

                if self.config.resubscribe_on_reconnect && !session_present {
                    self.resubscribe().await;
                }
                self.drain().await;

                tracing::info!(
                    session_present,
                    queued_publishes = self.publishes.len(),
                    "connection established"
                );
                self.state_tx.send_replace(DeviceState::Established);
            }
            ConnectionEvent::Disconnected { reason } => {
                if !self.state.is_online() {
                    return;
                }
                self.state = DeviceState::Inactive;
                self.established_at = None;
                self.state_tx.send_replace(DeviceState::Inactive);
                tracing::warn!(reason = %reason, "connection lost");
                if let Some(hook) = &self.on_connection_lost {
                    hook(&reason);
                }
            }
        }
    }

    fn enter_stable(&mut self) {
        self.state = DeviceState::Stable;
        self.backoff.reset();
        self.state_tx.send_replace(DeviceState::Stable);
        tracing::debug!("connection stable, backoff reset");
    }

    async fn resubscribe(&mut self) {
        if self.active.is_empty() {
            return;
        }
        let filters: Vec<(String, QoS)> =
            self.active.iter().map(|(f, q)| (f.clone(), *q)).collect();
        if let Err(e) = self.channel.subscribe_many(&filters).await {
            tracing::warn!(error = %e, count = filters.len(), "resubscribe failed");
        }
    }

    /// Submit queued subscription changes, then queued publishes, in FIFO
    /// order. The first failure goes back to the tail and stops the drain.
    async fn drain(&mut self) {
        while let Some(op) = self.subscriptions.pop() {
            if let Err(e) = self.apply_subscription(&op).await {
                tracing::warn!(error = %e, "queued subscription failed");
                self.enqueue_subscription(op);
                return;
            }
        }
        while let Some(msg) = self.publishes.pop() {
            if let Err(e) = self.send_publish(&msg).await {
                tracing::warn!(topic = %msg.topic, error = %e, "queued publish failed");
                self.enqueue_publish(msg);
                return;
            }
        }
    }

    async fn terminate(&mut self) {
        let was_online = self.state.is_online();
        self.state = DeviceState::Terminating;
        self.state_tx.send_replace(DeviceState::Terminating);

        if self.config.flush_on_terminate && was_online {
            while let Some(msg) = self.publishes.pop() {
                if let Err(e) = self.send_publish(&msg).await {
                    tracing::warn!(topic = %msg.topic, error = %e, "flush on terminate failed");
                    break;
                }
            }
        }

        let dropped = self.publishes.clear();
        let dropped_subs = self.subscriptions.clear();
        if dropped > 0 || dropped_subs > 0 {
            tracing::info!(
                publishes = dropped,
                subscriptions = dropped_subs,
                "dropping queued operations on terminate"
            );
        }

        match tokio::time::timeout(self.config.terminate_grace(), self.channel.disconnect()).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "disconnect failed"),
            Err(_) => tracing::warn!("disconnect exceeded grace window"),
        }
    }

    async fn send_publish(&self, msg: &QueuedPublish) -> IotResult<()> {
        self.channel
            .publish_with(&msg.topic, &msg.payload, msg.qos, msg.retain)
            .await
    }

    async fn apply_subscription(&mut self, op: &SubscriptionOp) -> IotResult<()> {
        match op {
            SubscriptionOp::Subscribe(filters) => {
                self.channel.subscribe_many(filters).await?;
                for (filter, qos) in filters {
                    self.active.insert(filter.clone(), *qos);
                }
            }
            SubscriptionOp::Unsubscribe(filters) => {
                self.channel.unsubscribe_many(filters).await?;
                for filter in filters {
                    self.active.remove(filter);
                }
            }
        }
        Ok(())
    }

    fn enqueue_publish(&mut self, msg: QueuedPublish) {
        if let Some(dropped) = self.publishes.enqueue(msg) {
            tracing::warn!(topic = %dropped.topic, "publish queue full, dropped message");
        }
    }

    fn enqueue_subscription(&mut self, op: SubscriptionOp) {
        if let Some(dropped) = self.subscriptions.enqueue(op) {
            tracing::warn!(op = ?dropped, "subscription queue full, dropped operation");
        }
    }
}

async fn stable_timer(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Engine-facing handle onto the coordinator.
#[derive(Clone)]
pub struct OfflineChannel {
    commands: mpsc::Sender<Command>,
    inner: Arc<dyn Channel>,
    state: watch::Receiver<DeviceState>,
}

impl OfflineChannel {
    pub fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<DeviceState> {
        self.state.clone()
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<IotResult<()>>) -> Command,
    ) -> IotResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| IotError::Connection("offline coordinator stopped".into()))?;
        rx.await
            .map_err(|_| IotError::Connection("offline coordinator stopped".into()))?
    }
}

#[async_trait]
impl Channel for OfflineChannel {
    async fn publish_with(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> IotResult<()> {
        let msg = QueuedPublish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        };
        self.request(|reply| Command::Publish { msg, reply }).await
    }

    async fn subscribe_many(&self, filters: &[(String, QoS)]) -> IotResult<()> {
        let op = SubscriptionOp::Subscribe(filters.to_vec());
        self.request(|reply| Command::Subscription { op, reply })
            .await
    }

    async fn unsubscribe_many(&self, filters: &[String]) -> IotResult<()> {
        let op = SubscriptionOp::Unsubscribe(filters.to_vec());
        self.request(|reply| Command::Subscription { op, reply })
            .await
    }

    /// Move to `Terminating` and wait for the coordinator to exit.
    async fn disconnect(&self) -> IotResult<()> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Terminate { reply: tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    fn handle(&self, router: Arc<Router>) {
        self.inner.handle(router);
    }

    fn thing_name(&self) -> &str {
        self.inner.thing_name()
    }
}
