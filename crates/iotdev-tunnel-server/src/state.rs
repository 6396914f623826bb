//! Shared application state: the tunnel registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc, watch};

use iotdev_protocol::ProxyMode;

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::notify::Notifier;

/// Buffered WebSocket messages per direction before the sender waits.
const PIPE_CAPACITY: usize = 256;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub tunnels: Arc<RwLock<HashMap<String, Arc<Tunnel>>>>,
    pub notifier: Option<Arc<Notifier>>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig, notifier: Option<Notifier>) -> Self {
        Self {
            tunnels: Arc::new(RwLock::new(HashMap::new())),
            notifier: notifier.map(Arc::new),
            config: Arc::new(config),
        }
    }

    pub async fn insert(&self, tunnel: Arc<Tunnel>) {
        self.tunnels.write().await.insert(tunnel.id.clone(), tunnel);
    }

    pub async fn get(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.read().await.get(tunnel_id).cloned()
    }

    /// Resolve an access token to its tunnel and the mode it grants.
    pub async fn find_by_token(&self, token: &str) -> Option<(Arc<Tunnel>, ProxyMode)> {
        let tunnels = self.tunnels.read().await;
        tunnels
            .values()
            .find_map(|t| t.mode_for_token(token).map(|mode| (t.clone(), mode)))
    }
}

/// Lifecycle of an emulated tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TunnelStatus {
    Open,
    Closed,
}

/// One direction of the relay: the bytes waiting for a peer.
struct Pipe {
    tx: mpsc::Sender<Bytes>,
    rx: Arc<Mutex<mpsc::Receiver<Bytes>>>,
}

impl Pipe {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

/// A peer's view of the tunnel: where to forward what it reads and where
/// to read what it writes. Holding it marks the peer connected.
pub struct Attachment {
    pub outbound: mpsc::Sender<Bytes>,
    pub inbound: OwnedMutexGuard<mpsc::Receiver<Bytes>>,
    connected: Arc<AtomicBool>,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// A tunnel between one source and one destination.
pub struct Tunnel {
    pub id: String,
    pub thing_name: String,
    pub services: Vec<String>,
    pub source_token: String,
    pub destination_token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    closed: watch::Sender<bool>,
    dest_to_src: Pipe,
    src_to_dest: Pipe,
    source_connected: Arc<AtomicBool>,
    destination_connected: Arc<AtomicBool>,
}

impl Tunnel {
    pub fn open(thing_name: String, services: Vec<String>, lifetime_minutes: u32) -> Self {
        let created_at = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            thing_name,
            services,
            source_token: uuid::Uuid::new_v4().to_string(),
            destination_token: uuid::Uuid::new_v4().to_string(),
            created_at,
            expires_at: created_at + chrono::Duration::minutes(i64::from(lifetime_minutes)),
            closed: watch::channel(false).0,
            dest_to_src: Pipe::new(),
            src_to_dest: Pipe::new(),
            source_connected: Arc::new(AtomicBool::new(false)),
            destination_connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mode_for_token(&self, token: &str) -> Option<ProxyMode> {
        if token == self.source_token {
            Some(ProxyMode::Source)
        } else if token == self.destination_token {
            Some(ProxyMode::Destination)
        } else {
            None
        }
    }

    pub fn status(&self) -> TunnelStatus {
        if self.is_closed() {
            TunnelStatus::Closed
        } else {
            TunnelStatus::Open
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Close the tunnel. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        self.closed.send_if_modified(|closed| !std::mem::replace(closed, true))
    }

    /// Resolves once the tunnel is closed.
    pub fn closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.closed.subscribe();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }

    pub fn is_connected(&self, mode: ProxyMode) -> bool {
        match mode {
            ProxyMode::Source => self.source_connected.load(Ordering::SeqCst),
            ProxyMode::Destination => self.destination_connected.load(Ordering::SeqCst),
        }
    }

    /// Claim the `mode` end of the relay. Only one peer per end.
    pub fn attach(&self, mode: ProxyMode) -> Result<Attachment, ApiError> {
        let (outbound, inbound, connected) = match mode {
            ProxyMode::Source => (&self.src_to_dest, &self.dest_to_src, &self.source_connected),
            ProxyMode::Destination => {
                (&self.dest_to_src, &self.src_to_dest, &self.destination_connected)
            }
        };
        let inbound = inbound
            .rx
            .clone()
            .try_lock_owned()
            .map_err(|_| ApiError::Conflict(format!("{mode} already connected")))?;
        connected.store(true, Ordering::SeqCst);
        Ok(Attachment {
            outbound: outbound.tx.clone(),
            inbound,
            connected: connected.clone(),
        })
    }
}
