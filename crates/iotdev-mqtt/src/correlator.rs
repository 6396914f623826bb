//! Request/response correlation over publish/subscribe.
//!
//! A caller reserves a key with [`TokenBroker::begin`], publishes its
//! request, and awaits the returned [`Pending`]. Topic handlers hand
//! responses to [`TokenBroker::deliver`], which never blocks: a response
//! for a key nobody is waiting on is dropped.
//!
//! Keys are either client tokens from a [`TokenGenerator`] or fixed slot
//! names for protocols that echo no token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rumqttc::QoS;
use tokio::sync::mpsc;

use iotdev_protocol::{IotError, IotResult};

use crate::channel::Channel;

struct Slot<R> {
    generation: u64,
    tx: mpsc::Sender<R>,
}

/// One-shot response slots keyed by token or slot name.
pub struct TokenBroker<R> {
    slots: Mutex<HashMap<String, Slot<R>>>,
    generation: AtomicU64,
}

impl<R: Send + 'static> TokenBroker<R> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    /// Reserve `key`. Fails if a caller is already waiting on it.
    pub fn begin(self: &Arc<Self>, key: impl Into<String>) -> IotResult<Pending<R>> {
        let key = key.into();
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.contains_key(&key) {
            return Err(IotError::AlreadyPending(key));
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);
        slots.insert(key.clone(), Slot { generation, tx });
        Ok(Pending {
            key,
            generation,
            rx,
            broker: self.clone(),
        })
    }

    /// Release `key`. Idempotent.
    pub fn end(&self, key: &str) {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    fn end_generation(&self, key: &str, generation: u64) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.get(key).is_some_and(|s| s.generation == generation) {
            slots.remove(key);
        }
    }

    /// Hand `response` to the caller waiting on `key`.
    ///
    /// Unknown keys and full slots hand the response back instead of
    /// blocking.
    pub fn deliver(&self, key: &str, response: R) -> Result<(), R> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get(key) {
            Some(slot) => slot.tx.try_send(response).map_err(|e| {
                tracing::debug!(key, "response slot full, dropping");
                e.into_inner()
            }),
            None => {
                tracing::debug!(key, "no caller waiting, dropping response");
                Err(response)
            }
        }
    }

    /// Deliver by client token; responses carrying no token are ignored.
    pub fn deliver_token(&self, token: Option<&str>, response: R) -> Result<(), R> {
        match token {
            Some(token) => self.deliver(token, response),
            None => {
                tracing::debug!("response without client token ignored");
                Err(response)
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// A reserved slot. Dropping it releases the key, so abandoning the
/// future that awaits [`Pending::wait`] (timeout, `select!`) cleans up.
pub struct Pending<R: Send + 'static> {
    key: String,
    generation: u64,
    rx: mpsc::Receiver<R>,
    broker: Arc<TokenBroker<R>>,
}

impl<R: Send + 'static> Pending<R> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the response. Fails with `Cancelled` if the slot was
    /// released from elsewhere.
    pub async fn wait(mut self) -> IotResult<R> {
        self.rx.recv().await.ok_or(IotError::Cancelled)
    }
}

impl<R: Send + 'static> Drop for Pending<R> {
    fn drop(&mut self) {
        self.broker.end_generation(&self.key, self.generation);
    }
}

/// Monotonic hex client tokens.
#[derive(Debug, Default)]
pub struct TokenGenerator {
    next: AtomicU64,
}

impl TokenGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_token(&self) -> String {
        format!("{:x}", self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Reserve `key`, publish `payload` to `topic` at QoS 1 and await the
/// correlated response.
pub async fn request<R: Send + 'static>(
    broker: &Arc<TokenBroker<R>>,
    key: &str,
    channel: &dyn Channel,
    topic: &str,
    payload: &[u8],
) -> IotResult<R> {
    let pending = broker.begin(key)?;
    channel.publish(topic, payload, QoS::AtLeastOnce).await?;
    pending.wait().await
}
