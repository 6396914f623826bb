use std::time::Duration;

use serde::Deserialize;

use crate::queue::DropPolicy;

/// How the MQTT connection reaches the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// MQTT over TLS with an X.509 client certificate (port 8883).
    #[default]
    Mqtts,
    /// Plaintext TCP, for local brokers only.
    Tcp,
    /// MQTT over WebSocket on a SigV4 presigned URL (port 443).
    Wss,
}

/// MQTT connection configuration, loadable from TOML or environment.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// MQTT broker hostname (e.g., AWS IoT endpoint).
    pub broker_host: String,
    /// MQTT broker port (default 8883 for TLS).
    #[serde(default = "default_port")]
    pub broker_port: u16,
    /// MQTT client ID; AWS IoT policies usually require the thing name.
    pub client_id: String,
    #[serde(default)]
    pub transport: TransportKind,
    /// Path to device X.509 certificate (PEM).
    #[serde(default)]
    pub client_cert_path: String,
    /// Path to device private key (PEM).
    #[serde(default)]
    pub client_key_path: String,
    /// Path to CA certificate (e.g., AmazonRootCA1.pem).
    #[serde(default)]
    pub ca_cert_path: String,
    /// Keep-alive interval in seconds.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u16,
    /// When false, the broker keeps subscriptions across reconnects.
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
}

fn default_port() -> u16 {
    8883
}

fn default_keepalive() -> u16 {
    30
}

fn default_clean_session() -> bool {
    true
}

/// Behavior of the offline coordinator.
#[derive(Debug, Clone, Deserialize)]
pub struct OfflineConfig {
    /// Queue publishes and subscriptions while disconnected.
    #[serde(default = "default_true")]
    pub queue_offline: bool,
    /// Maximum queued publishes; 0 is unbounded.
    #[serde(default = "default_queue_size")]
    pub publish_queue_size: usize,
    /// Maximum queued subscribe/unsubscribe operations; 0 is unbounded.
    #[serde(default = "default_queue_size")]
    pub subscribe_queue_size: usize,
    #[serde(default)]
    pub drop_policy: DropPolicy,
    /// First reconnect wait; doubles on each disconnect.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Connection age after which it counts as stable and backoff resets.
    #[serde(default = "default_min_stable_secs")]
    pub min_stable_secs: u64,
    /// How long a terminating disconnect may take.
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    /// Re-issue known subscriptions when the broker reports no session.
    #[serde(default = "default_true")]
    pub resubscribe_on_reconnect: bool,
    /// Try to send queued publishes before a terminating disconnect.
    /// When false, they are dropped.
    #[serde(default)]
    pub flush_on_terminate: bool,
}

fn default_true() -> bool {
    true
}

fn default_queue_size() -> usize {
    100
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_min_stable_secs() -> u64 {
    10
}

fn default_terminate_grace_ms() -> u64 {
    250
}

impl OfflineConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn min_stable(&self) -> Duration {
        Duration::from_secs(self.min_stable_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            queue_offline: true,
            publish_queue_size: default_queue_size(),
            subscribe_queue_size: default_queue_size(),
            drop_policy: DropPolicy::default(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            min_stable_secs: default_min_stable_secs(),
            terminate_grace_ms: default_terminate_grace_ms(),
            resubscribe_on_reconnect: true,
            flush_on_terminate: false,
        }
    }
}
