//! Device shadow client.
//!
//! Keeps a local copy of one (classic or named) shadow in sync with the
//! service: responses on `get`, `update` and `delete` are merged into the
//! document in version order, and `update/delta` notifications are passed
//! to the delta callback.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use iotdev_mqtt::correlator;
use iotdev_mqtt::{Channel, Message, Router, TokenBroker, TokenGenerator};
use iotdev_protocol::service::reply_token;
use iotdev_protocol::shadow_state::state_diff;
use iotdev_protocol::{
    ErrorResponse, IotError, IotResult, ResultExt, ShadowMessage, ShadowTokenRequest,
    ShadowUpdateRequest, StateMap, ThingDocument, UpdateState, topics,
};

pub type DeltaCallback = Arc<dyn Fn(&StateMap) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&IotError) + Send + Sync>;

type Reply = IotResult<ShadowMessage>;

#[derive(Default)]
struct Shared {
    document: ThingDocument,
    on_delta: Option<DeltaCallback>,
    on_error: Option<ErrorCallback>,
}

/// State shared with the router handlers.
struct Inner {
    prefix: String,
    shared: Mutex<Shared>,
    broker: Arc<TokenBroker<Reply>>,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle(&self, msg: &Message) {
        let Some(op) = msg
            .topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return;
        };

        match op {
            "get/accepted" | "update/accepted" | "delete/accepted" => {
                let reply = serde_json::from_slice::<ShadowMessage>(&msg.payload)
                    .map_err(IotError::from)
                    .and_then(|m| self.apply(op, m));
                self.settle(&msg.payload, reply);
            }
            "update/delta" => {
                if let Err(e) = self.apply_delta(&msg.payload) {
                    self.report(IotError::wrap("applying shadow delta", e));
                }
            }
            "get/rejected" | "update/rejected" | "delete/rejected" => {
                match serde_json::from_slice::<ErrorResponse>(&msg.payload) {
                    Ok(rejection) => {
                        tracing::debug!(topic = %msg.topic, %rejection, "shadow request rejected");
                        self.settle(&msg.payload, Err(IotError::Rejected(rejection)));
                    }
                    Err(e) => self.report(IotError::wrap("decoding shadow rejection", e)),
                }
            }
            other => tracing::debug!(op = other, "ignoring shadow message"),
        }
    }

    /// Apply an accepted response; stale versions leave the document as is.
    fn apply(&self, op: &str, msg: ShadowMessage) -> Reply {
        let (delta, callback) = {
            let mut shared = self.lock();
            let doc = &mut shared.document;
            let delta = match op {
                "get/accepted" => {
                    if doc.replace(&msg)? {
                        doc.state.delta.clone()
                    } else {
                        None
                    }
                }
                "update/accepted" => {
                    doc.merge_accepted(&msg)?;
                    None
                }
                _ => {
                    doc.clear(&msg);
                    None
                }
            };
            (delta, shared.on_delta.clone())
        };

        if let (Some(delta), Some(callback)) = (delta, callback) {
            callback(&delta);
        }
        Ok(msg)
    }

    fn apply_delta(&self, payload: &[u8]) -> IotResult<()> {
        let msg: ShadowMessage = serde_json::from_slice(payload)?;
        let (delta, callback) = {
            let mut shared = self.lock();
            if !shared.document.apply_delta(&msg)? {
                tracing::debug!(version = msg.version, "stale shadow delta dropped");
                return Ok(());
            }
            (shared.document.state.delta.clone(), shared.on_delta.clone())
        };

        if let (Some(delta), Some(callback)) = (delta, callback) {
            callback(&delta);
        }
        Ok(())
    }

    /// Hand a reply to the waiting caller; failures nobody waits for go to
    /// the error callback.
    fn settle(&self, payload: &[u8], reply: Reply) {
        let token = reply_token(&reply, payload);
        if let Err(Err(e)) = self.broker.deliver_token(token.as_deref(), reply) {
            self.report(e);
        }
    }

    fn report(&self, err: IotError) {
        let callback = self.lock().on_error.clone();
        match callback {
            Some(callback) => callback(&err),
            None => tracing::warn!(error = %err, "shadow error"),
        }
    }
}

/// Client for one thing shadow.
pub struct ShadowClient {
    channel: Arc<dyn Channel>,
    thing_name: String,
    shadow_name: Option<String>,
    tokens: TokenGenerator,
    inner: Arc<Inner>,
}

impl ShadowClient {
    /// Register the response routes on `router` and subscribe to them.
    ///
    /// `shadow_name` selects a named shadow; `None` is the classic shadow.
    pub async fn start(
        channel: Arc<dyn Channel>,
        router: &Router,
        shadow_name: Option<String>,
    ) -> IotResult<Self> {
        let thing_name = channel.thing_name().to_string();
        let name = shadow_name.as_deref();
        let inner = Arc::new(Inner {
            prefix: topics::shadow_prefix(&thing_name, name),
            shared: Mutex::new(Shared::default()),
            broker: TokenBroker::new(),
        });

        let filters = [
            topics::shadow_get(&thing_name, name),
            topics::shadow_update(&thing_name, name),
            topics::shadow_delete(&thing_name, name),
        ]
        .map(|t| format!("{t}/+"));

        let handler = inner.clone();
        channel
            .subscribe_routed(router, &filters, Arc::new(move |m| handler.handle(m)))
            .await
            .wrap_err("subscribing to shadow topics")?;

        tracing::info!(thing = %thing_name, shadow = ?shadow_name, "shadow client started");
        Ok(Self {
            channel,
            thing_name,
            shadow_name,
            tokens: TokenGenerator::new(),
            inner,
        })
    }

    pub fn shadow_name(&self) -> Option<&str> {
        self.shadow_name.as_deref()
    }

    /// Fetch the full document from the service and install it.
    pub async fn get(&self) -> IotResult<ThingDocument> {
        let token = self.tokens.next_token();
        let body = ShadowTokenRequest {
            client_token: Some(token.clone()),
        };
        let topic = topics::shadow_get(&self.thing_name, self.shadow_name());
        self.request(&token, &topic, &body)
            .await
            .wrap_err("getting shadow")?;
        Ok(self.document())
    }

    /// Merge `state` into the reported section.
    pub async fn report(&self, state: Value) -> IotResult<ThingDocument> {
        self.update(UpdateState {
            reported: Some(state),
            ..UpdateState::default()
        })
        .await
        .wrap_err("reporting shadow state")
    }

    /// Merge `state` into the desired section.
    pub async fn desire(&self, state: Value) -> IotResult<ThingDocument> {
        self.update(UpdateState {
            desired: Some(state),
            ..UpdateState::default()
        })
        .await
        .wrap_err("updating desired shadow state")
    }

    /// Delete the shadow; the local document is cleared on acceptance.
    pub async fn delete(&self) -> IotResult<()> {
        let token = self.tokens.next_token();
        let body = ShadowTokenRequest {
            client_token: Some(token.clone()),
        };
        let topic = topics::shadow_delete(&self.thing_name, self.shadow_name());
        self.request(&token, &topic, &body)
            .await
            .wrap_err("deleting shadow")?;
        Ok(())
    }

    /// Snapshot of the local document.
    pub fn document(&self) -> ThingDocument {
        self.inner.lock().document.clone()
    }

    /// Desired keys that differ from, or are missing in, the reported state.
    pub fn drift(&self) -> Option<Value> {
        let shared = self.inner.lock();
        let state = &shared.document.state;
        let reported = Value::Object(state.reported.clone().unwrap_or_default());
        let desired = Value::Object(state.desired.clone()?);
        state_diff(&reported, &desired)
    }

    pub fn on_delta<F>(&self, callback: F)
    where
        F: Fn(&StateMap) + Send + Sync + 'static,
    {
        self.inner.lock().on_delta = Some(Arc::new(callback));
    }

    /// Errors not tied to an in-flight request (malformed payloads,
    /// rejections nobody waits for).
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&IotError) + Send + Sync + 'static,
    {
        self.inner.lock().on_error = Some(Arc::new(callback));
    }

    async fn update(&self, state: UpdateState) -> IotResult<ThingDocument> {
        let token = self.tokens.next_token();
        let body = ShadowUpdateRequest {
            state,
            version: None,
            client_token: Some(token.clone()),
        };
        let topic = topics::shadow_update(&self.thing_name, self.shadow_name());
        self.request(&token, &topic, &body).await?;
        Ok(self.document())
    }

    async fn request<T: serde::Serialize>(
        &self,
        token: &str,
        topic: &str,
        body: &T,
    ) -> IotResult<ShadowMessage> {
        let payload = serde_json::to_vec(body)?;
        correlator::request(
            &self.inner.broker,
            token,
            self.channel.as_ref(),
            topic,
            &payload,
        )
        .await?
    }
}
