//! Tunnel emulator configuration.

use iotdev_mqtt::{MqttConfig, TransportKind};
use serde::Deserialize;

/// Top-level emulator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0").
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Region reported in tunnel notifications.
    #[serde(default = "default_region")]
    pub region: String,
    /// Notify topic with a `{thing_name}` placeholder.
    #[serde(default = "default_notify_topic")]
    pub notify_topic_format: String,
    /// Lifetime of a tunnel opened without a timeout.
    #[serde(default = "default_lifetime_minutes")]
    pub default_lifetime_minutes: u32,
    /// Broker used to notify destination things. None disables notifications.
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
}

/// Upper bound for `maxLifetimeTimeoutMinutes`.
pub const MAX_LIFETIME_MINUTES: u32 = 720;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_notify_topic() -> String {
    "$aws/things/{thing_name}/tunnels/notify".to_string()
}

fn default_lifetime_minutes() -> u32 {
    MAX_LIFETIME_MINUTES
}

impl ServerConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// `MQTT_BROKER_HOST` enables notifications over plaintext MQTT
    /// (`MQTT_BROKER_PORT`, `MQTT_CLIENT_ID` optional).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let mqtt = get("MQTT_BROKER_HOST").map(|broker_host| MqttConfig {
            broker_host,
            broker_port: get("MQTT_BROKER_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(1883),
            client_id: get("MQTT_CLIENT_ID").unwrap_or_else(|| "iotdev-tunnel-server".into()),
            transport: TransportKind::Tcp,
            client_cert_path: String::new(),
            client_key_path: String::new(),
            ca_cert_path: String::new(),
            keepalive_secs: 30,
            clean_session: true,
        });
        Self {
            host: get("TUNNEL_HOST").unwrap_or(defaults.host),
            port: get("TUNNEL_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            region: get("AWS_REGION").unwrap_or(defaults.region),
            notify_topic_format: get("TUNNEL_NOTIFY_TOPIC").unwrap_or(defaults.notify_topic_format),
            default_lifetime_minutes: defaults.default_lifetime_minutes,
            mqtt,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            region: default_region(),
            notify_topic_format: default_notify_topic(),
            default_lifetime_minutes: default_lifetime_minutes(),
            mqtt: None,
        }
    }
}
