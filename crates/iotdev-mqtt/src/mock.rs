//! Mock MQTT channel for testing without a real broker.
//!
//! Records all published messages and subscription filters for
//! assertion in tests, and can play the broker's side of a
//! request/response exchange through the installed router.

use async_trait::async_trait;
use rumqttc::QoS;
use std::sync::{Arc, Mutex};

use iotdev_protocol::{IotError, IotResult};

use crate::channel::Channel;
use crate::router::{Message, Router};

/// A recorded publish call.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

type Responder = Arc<dyn Fn(&PublishedMessage) -> Vec<(String, Vec<u8>)> + Send + Sync>;

/// Mock implementation of the `Channel` trait.
///
/// Stores all publishes and subscriptions in memory for test verification.
/// Thread-safe via `Mutex` (fine for test contexts).
pub struct MockChannel {
    thing_name: String,
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    unsubscriptions: Mutex<Vec<String>>,
    fail_publishes: Mutex<u32>,
    fail_subscribes: Mutex<u32>,
    disconnected: Mutex<bool>,
    router: Mutex<Option<Arc<Router>>>,
    responder: Mutex<Option<Responder>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::with_thing_name("thing1")
    }

    pub fn with_thing_name(thing_name: impl Into<String>) -> Self {
        Self {
            thing_name: thing_name.into(),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            unsubscriptions: Mutex::new(Vec::new()),
            fail_publishes: Mutex::new(0),
            fail_subscribes: Mutex::new(0),
            disconnected: Mutex::new(false),
            router: Mutex::new(None),
            responder: Mutex::new(None),
        }
    }

    /// Get all published messages.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap().clone()
    }

    /// Get all subscription filters.
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        self.unsubscriptions.lock().unwrap().clone()
    }

    /// Get the last published message.
    pub fn last_published(&self) -> Option<PublishedMessage> {
        self.published.lock().unwrap().last().cloned()
    }

    /// Get published messages for a specific topic.
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Check whether a subscription was made to the given filter.
    pub fn is_subscribed_to(&self, filter: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .any(|(f, _)| f == filter)
    }

    pub fn disconnected(&self) -> bool {
        *self.disconnected.lock().unwrap()
    }

    /// Make the next `n` publishes fail with a publish error.
    pub fn fail_next_publishes(&self, n: u32) {
        *self.fail_publishes.lock().unwrap() = n;
    }

    /// Make the next `n` subscribe calls fail.
    pub fn fail_next_subscribes(&self, n: u32) {
        *self.fail_subscribes.lock().unwrap() = n;
    }

    /// Answer every successful publish with the returned `(topic, payload)`
    /// messages, dispatched through the installed router.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&PublishedMessage) -> Vec<(String, Vec<u8>)> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Arc::new(responder));
    }

    /// Deliver an inbound message as if the broker had sent it.
    ///
    /// Returns whether a route handled it.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let router = self.router.lock().unwrap().clone();
        match router {
            Some(router) => router.dispatch(&Message::new(topic, payload.into())),
            None => false,
        }
    }

    /// Clear all recorded state.
    pub fn reset(&self) {
        self.published.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
        self.unsubscriptions.lock().unwrap().clear();
        *self.disconnected.lock().unwrap() = false;
    }

    fn take_failure(counter: &Mutex<u32>) -> bool {
        let mut n = counter.lock().unwrap();
        if *n > 0 {
            *n -= 1;
            true
        } else {
            false
        }
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn publish_with(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> IotResult<()> {
        if Self::take_failure(&self.fail_publishes) {
            return Err(IotError::Publish("mock publish failure".into()));
        }
        let msg = PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        };
        self.published.lock().unwrap().push(msg.clone());

        let responder = self.responder.lock().unwrap().clone();
        if let Some(responder) = responder {
            for (topic, payload) in responder(&msg) {
                self.inject(&topic, payload);
            }
        }
        Ok(())
    }

    async fn subscribe_many(&self, filters: &[(String, QoS)]) -> IotResult<()> {
        if Self::take_failure(&self.fail_subscribes) {
            return Err(IotError::Subscribe("mock subscribe failure".into()));
        }
        self.subscriptions
            .lock()
            .unwrap()
            .extend(filters.iter().cloned());
        Ok(())
    }

    async fn unsubscribe_many(&self, filters: &[String]) -> IotResult<()> {
        self.unsubscriptions
            .lock()
            .unwrap()
            .extend(filters.iter().cloned());
        Ok(())
    }

    async fn disconnect(&self) -> IotResult<()> {
        *self.disconnected.lock().unwrap() = true;
        Ok(())
    }

    fn handle(&self, router: Arc<Router>) {
        *self.router.lock().unwrap() = Some(router);
    }

    fn thing_name(&self) -> &str {
        &self.thing_name
    }
}
