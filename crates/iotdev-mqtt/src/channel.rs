//! MQTT channel: the device's handle on the broker connection.
//!
//! Wraps `rumqttc::AsyncClient` behind the [`Channel`] trait so engines can
//! run against the real broker, the offline coordinator, or a mock.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeFilter,
};
use tokio::sync::mpsc;

use iotdev_protocol::{IotError, IotResult};

use crate::backoff::Backoff;
use crate::config::{MqttConfig, TransportKind};
use crate::presign::UrlSigner;
use crate::router::{Handler, Message, Router};
use crate::tls;

// ── Channel trait ─────────────────────────────────────────────

/// Abstraction for MQTT message publishing and subscribing.
///
/// Enables mocking in tests without a real MQTT broker.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Publish a raw payload to a topic.
    async fn publish_with(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> IotResult<()>;

    /// Subscribe to a set of topic filters.
    async fn subscribe_many(&self, filters: &[(String, QoS)]) -> IotResult<()>;

    async fn unsubscribe_many(&self, filters: &[String]) -> IotResult<()>;

    async fn disconnect(&self) -> IotResult<()>;

    /// Install the dispatcher for inbound publishes.
    fn handle(&self, router: Arc<Router>);

    fn thing_name(&self) -> &str;

    /// Publish a non-retained payload.
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> IotResult<()> {
        self.publish_with(topic, payload, qos, false).await
    }

    /// Subscribe to a single topic filter.
    async fn subscribe(&self, filter: &str, qos: QoS) -> IotResult<()> {
        self.subscribe_many(&[(filter.to_string(), qos)]).await
    }

    /// Route `filters` to `handler`, then subscribe to them at QoS 1.
    ///
    /// A failed subscribe removes the routes again so the call can be
    /// retried.
    async fn subscribe_routed(
        &self,
        router: &Router,
        filters: &[String],
        handler: Handler,
    ) -> IotResult<()> {
        router.register_all(filters, handler)?;
        let subscriptions: Vec<(String, QoS)> = filters
            .iter()
            .map(|f| (f.clone(), QoS::AtLeastOnce))
            .collect();
        if let Err(e) = self.subscribe_many(&subscriptions).await {
            router.unregister_all(filters);
            return Err(e);
        }
        Ok(())
    }
}

/// Connection state changes reported by the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { session_present: bool },
    Disconnected { reason: String },
}

type RouterSlot = Arc<RwLock<Option<Arc<Router>>>>;

// ── MqttChannel ───────────────────────────────────────────────

/// MQTT channel connected to AWS IoT Core.
///
/// Owns the `AsyncClient` for publishing/subscribing. The event loop is
/// returned separately as an [`EventLoopDriver`] which the caller must run
/// in a spawned task.
pub struct MqttChannel {
    client: AsyncClient,
    thing_name: String,
    router: RouterSlot,
}

impl MqttChannel {
    /// Create a channel for the configured `mqtts` or `tcp` transport.
    pub fn new(
        config: &MqttConfig,
        thing_name: impl Into<String>,
    ) -> IotResult<(Self, EventLoopDriver)> {
        let mut options =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        match config.transport {
            TransportKind::Mqtts => options.set_transport(tls::load_tls_transport(config)?),
            TransportKind::Tcp => options.set_transport(tls::plaintext_transport()),
            TransportKind::Wss => {
                return Err(IotError::Invalid(
                    "wss transport needs a presigned URL, use MqttChannel::new_websocket".into(),
                ));
            }
        };
        Ok(Self::with_options(config, options, thing_name.into()))
    }

    /// Create a channel that dials a presigned `wss://` URL.
    ///
    /// `signer` is asked for a new URL before every reconnect.
    pub async fn new_websocket(
        config: &MqttConfig,
        signer: Arc<dyn UrlSigner>,
        thing_name: impl Into<String>,
    ) -> IotResult<(Self, EventLoopDriver)> {
        let url = signer.sign().await?;
        let (channel, mut driver) =
            Self::with_options(config, websocket_options(config, &url), thing_name.into());
        driver.resign = Some(Resign {
            signer,
            config: config.clone(),
        });
        Ok((channel, driver))
    }

    fn with_options(
        config: &MqttConfig,
        mut options: MqttOptions,
        thing_name: String,
    ) -> (Self, EventLoopDriver) {
        apply_session(config, &mut options);

        let (client, eventloop) = AsyncClient::new(options, 64);
        let router: RouterSlot = Arc::new(RwLock::new(None));

        (
            Self {
                client,
                thing_name,
                router: router.clone(),
            },
            EventLoopDriver {
                eventloop,
                router,
                resign: None,
            },
        )
    }
}

fn apply_session(config: &MqttConfig, options: &mut MqttOptions) {
    options.set_keep_alive(Duration::from_secs(config.keepalive_secs.into()));
    options.set_clean_session(config.clean_session);
}

fn websocket_options(config: &MqttConfig, url: &str) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, url, 443);
    options.set_transport(tls::websocket_transport());
    apply_session(config, &mut options);
    options
}

#[async_trait]
impl Channel for MqttChannel {
    async fn publish_with(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> IotResult<()> {
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| IotError::Publish(e.to_string()))
    }

    async fn subscribe_many(&self, filters: &[(String, QoS)]) -> IotResult<()> {
        let filters = filters
            .iter()
            .map(|(path, qos)| SubscribeFilter::new(path.clone(), *qos));
        self.client
            .subscribe_many(filters)
            .await
            .map_err(|e| IotError::Subscribe(e.to_string()))
    }

    async fn unsubscribe_many(&self, filters: &[String]) -> IotResult<()> {
        for filter in filters {
            self.client
                .unsubscribe(filter.as_str())
                .await
                .map_err(|e| IotError::Subscribe(e.to_string()))?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> IotResult<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| IotError::Connection(e.to_string()))
    }

    fn handle(&self, router: Arc<Router>) {
        *self.router.write().unwrap_or_else(|e| e.into_inner()) = Some(router);
    }

    fn thing_name(&self) -> &str {
        &self.thing_name
    }
}

// ── Event loop ────────────────────────────────────────────────

/// Drives the rumqttc event loop: dispatches inbound publishes to the
/// installed router and reports connection state changes.
pub struct EventLoopDriver {
    eventloop: EventLoop,
    router: RouterSlot,
    resign: Option<Resign>,
}

struct Resign {
    signer: Arc<dyn UrlSigner>,
    config: MqttConfig,
}

impl EventLoopDriver {
    /// Run until the client disconnects or is dropped.
    ///
    /// After a connection error the loop waits `backoff.next_wait()` before
    /// polling again, which makes rumqttc reconnect.
    pub async fn run(
        mut self,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        backoff: Arc<dyn Backoff>,
    ) {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    tracing::info!(session_present = ack.session_present, "mqtt connected");
                    let _ = events.send(ConnectionEvent::Connected {
                        session_present: ack.session_present,
                    });
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let msg = Message::new(publish.topic, publish.payload);
                    let router = self
                        .router
                        .read()
                        .unwrap_or_else(|e| e.into_inner())
                        .clone();
                    match router {
                        Some(router) => {
                            router.dispatch(&msg);
                        }
                        None => tracing::debug!(topic = %msg.topic, "no router installed"),
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    tracing::info!("mqtt disconnect sent, stopping event loop");
                    let _ = events.send(ConnectionEvent::Disconnected {
                        reason: "client disconnect".into(),
                    });
                    return;
                }
                Ok(_) => {} // SubAck, PubAck, PingResp, etc.
                Err(ConnectionError::RequestsDone) => {
                    tracing::info!("mqtt client dropped, stopping event loop");
                    return;
                }
                Err(e) => {
                    let wait = backoff.next_wait();
                    tracing::error!(error = %e, wait_ms = wait.as_millis() as u64, "mqtt event loop error, reconnecting");
                    let _ = events.send(ConnectionEvent::Disconnected {
                        reason: e.to_string(),
                    });
                    tokio::time::sleep(wait).await;
                    self.refresh_url().await;
                }
            }
        }
    }

    /// Point the next websocket dial at a freshly signed URL. A signing
    /// failure keeps the previous URL.
    async fn refresh_url(&mut self) {
        let Some(resign) = &self.resign else {
            return;
        };
        match resign.signer.sign().await {
            Ok(url) => self.eventloop.mqtt_options = websocket_options(&resign.config, &url),
            Err(e) => tracing::warn!(error = %e, "re-signing broker URL failed, keeping previous URL"),
        }
    }
}
