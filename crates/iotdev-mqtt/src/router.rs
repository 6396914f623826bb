//! Inbound message router.
//!
//! Engines register topic filters with a handler; the MQTT event loop hands
//! every incoming publish to [`Router::dispatch`]. Handlers run inline on the
//! event loop task and must not block.

use std::sync::{Arc, RwLock};

use bytes::Bytes;

use iotdev_protocol::topics;
use iotdev_protocol::{IotError, IotResult};

/// An inbound publish.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

struct Route {
    filter: String,
    handler: Handler,
}

/// Maps topic filters (with `+`/`#` wildcards) to handlers.
///
/// When several filters match, the one with the longest literal prefix wins.
#[derive(Default)]
pub struct Router {
    routes: RwLock<Vec<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Registering the same filter twice is an error.
    pub fn register<F>(&self, filter: impl Into<String>, handler: F) -> IotResult<()>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let filter = filter.into();
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        if routes.iter().any(|r| r.filter == filter) {
            return Err(IotError::Invalid(format!(
                "filter '{filter}' is already registered"
            )));
        }
        routes.push(Route {
            filter,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    /// Register one handler under every filter in `filters`, or none of
    /// them if any is already taken.
    pub fn register_all(&self, filters: &[String], handler: Handler) -> IotResult<()> {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(taken) = filters
            .iter()
            .find(|f| routes.iter().any(|r| &r.filter == *f))
        {
            return Err(IotError::Invalid(format!(
                "filter '{taken}' is already registered"
            )));
        }
        routes.extend(filters.iter().map(|filter| Route {
            filter: filter.clone(),
            handler: handler.clone(),
        }));
        Ok(())
    }

    /// Remove the handlers for every filter in `filters`.
    pub fn unregister_all(&self, filters: &[String]) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.retain(|r| !filters.contains(&r.filter));
    }

    /// Remove a handler; returns whether one was registered.
    pub fn unregister(&self, filter: &str) -> bool {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        let before = routes.len();
        routes.retain(|r| r.filter != filter);
        routes.len() != before
    }

    /// Deliver a message to the best matching handler.
    ///
    /// Returns `false` when no filter matches.
    pub fn dispatch(&self, msg: &Message) -> bool {
        let handler = {
            let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
            routes
                .iter()
                .filter(|r| topics::matches(&r.filter, &msg.topic))
                .max_by_key(|r| topics::literal_prefix_len(&r.filter))
                .map(|r| r.handler.clone())
        };

        match handler {
            Some(handler) => {
                handler(msg);
                true
            }
            None => {
                tracing::debug!(topic = %msg.topic, "no route for inbound message");
                false
            }
        }
    }

    pub fn filters(&self) -> Vec<String> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        routes.iter().map(|r| r.filter.clone()).collect()
    }
}
