//! Device agent configuration, loadable from TOML.

use std::collections::BTreeMap;

use serde::Deserialize;
use iotdev_mqtt::{MqttConfig, OfflineConfig};

/// Top-level configuration for the device agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// IoT Core thing name.
    pub thing_name: String,
    /// AWS region; needed for `wss` transport and the default tunnel endpoint.
    #[serde(default)]
    pub region: Option<String>,
    /// MQTT connection settings.
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub offline: OfflineConfig,
    #[serde(default)]
    pub shadow: ShadowSettings,
    #[serde(default)]
    pub jobs: JobsSettings,
    #[serde(default)]
    pub tunnel: TunnelSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShadowSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Named shadow; the classic shadow when unset.
    #[serde(default)]
    pub name: Option<String>,
}

impl Default for ShadowSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            name: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for JobsSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Secure tunnel destination settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TunnelSettings {
    /// Accept tunnel notifications and proxy to local services.
    #[serde(default)]
    pub enabled: bool,
    /// Proxy endpoint override, e.g. a local tunnel emulator.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Service name to local address, e.g. `ssh = "127.0.0.1:22"`.
    #[serde(default)]
    pub services: BTreeMap<String, String>,
}

impl TunnelSettings {
    /// Proxy endpoint for a tunnel opened in `region`.
    ///
    /// The configured override wins; otherwise the regional AWS endpoint.
    pub fn endpoint_for(&self, region: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("wss://data.tunneling.iot.{region}.amazonaws.com:443/tunnel"),
        }
    }
}

fn default_true() -> bool {
    true
}

impl AgentConfig {
    /// Load config from a TOML file path.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }
}
