//! Device composition: one channel, one router, and the enabled clients.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use iotdev_mqtt::{
    Backoff, Channel, DeviceState, EndpointSigner, ExponentialBackoff, MqttChannel,
    OfflineCoordinator, Router, TransportKind,
};
use iotdev_protocol::{IotError, IotResult, ResultExt};

use crate::config::AgentConfig;
use crate::jobs::JobsClient;
use crate::provisioning::ProvisioningClient;
use crate::shadow::ShadowClient;
use crate::tunnel::TunnelLauncher;

/// How long background tasks get to stop after a disconnect.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A connected thing and its service clients.
pub struct Device {
    channel: Arc<dyn Channel>,
    router: Arc<Router>,
    shadow: Option<ShadowClient>,
    jobs: Option<JobsClient>,
    tunnels: Option<TunnelLauncher>,
    state: Option<watch::Receiver<DeviceState>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Device {
    /// Dial the broker described by `config` and start the enabled clients.
    ///
    /// Publishes and subscriptions go through the offline coordinator, so
    /// with offline queueing on this returns before the first connection.
    /// With queueing off it waits until the device is online.
    pub async fn connect(config: &AgentConfig) -> IotResult<Self> {
        let (mqtt, driver) = match config.mqtt.transport {
            TransportKind::Wss => {
                let signer =
                    EndpointSigner::from_env(&config.mqtt.broker_host, config.region.clone())
                        .await
                        .wrap_err("loading AWS credentials")?;
                MqttChannel::new_websocket(&config.mqtt, Arc::new(signer), &config.thing_name)
                    .await
                    .wrap_err("presigning broker URL")?
            }
            TransportKind::Mqtts | TransportKind::Tcp => {
                MqttChannel::new(&config.mqtt, &config.thing_name)?
            }
        };
        tracing::info!(
            thing = %config.thing_name,
            host = %config.mqtt.broker_host,
            transport = ?config.mqtt.transport,
            "mqtt channel created"
        );

        let backoff: Arc<dyn Backoff> = Arc::new(ExponentialBackoff::new(
            config.offline.backoff_base(),
            config.offline.backoff_max(),
        ));
        let (coordinator, offline, events) =
            OfflineCoordinator::new(Arc::new(mqtt), config.offline.clone(), backoff.clone());
        let coordinator =
            coordinator.on_connection_lost(|reason| tracing::warn!(reason, "connection lost"));
        let mut state = offline.watch_state();
        let tasks = vec![
            tokio::spawn(coordinator.run()),
            tokio::spawn(driver.run(events, backoff)),
        ];

        if !config.offline.queue_offline {
            tracing::info!("offline queueing disabled, waiting for connection");
            if state.wait_for(|s| s.is_online()).await.is_err() {
                abort_all(&tasks);
                return Err(IotError::Connection("offline coordinator stopped".into()));
            }
        }

        match Self::with_channel(Arc::new(offline), config).await {
            Ok(mut device) => {
                device.state = Some(state);
                device.tasks = tasks;
                Ok(device)
            }
            Err(e) => {
                abort_all(&tasks);
                Err(e)
            }
        }
    }

    /// Compose the clients enabled in `config` over an existing channel.
    pub async fn with_channel(channel: Arc<dyn Channel>, config: &AgentConfig) -> IotResult<Self> {
        let router = Arc::new(Router::new());
        channel.handle(router.clone());

        let shadow = if config.shadow.enabled {
            Some(ShadowClient::start(channel.clone(), &router, config.shadow.name.clone()).await?)
        } else {
            None
        };
        let jobs = if config.jobs.enabled {
            Some(JobsClient::start(channel.clone(), &router).await?)
        } else {
            None
        };
        let tunnels = if config.tunnel.enabled {
            Some(TunnelLauncher::start(channel.clone(), &router, config.tunnel.clone()).await?)
        } else {
            None
        };

        tracing::info!(
            thing = %channel.thing_name(),
            shadow = shadow.is_some(),
            jobs = jobs.is_some(),
            tunnels = tunnels.is_some(),
            "device ready"
        );
        Ok(Self {
            channel,
            router,
            shadow,
            jobs,
            tunnels,
            state: None,
            tasks: Vec::new(),
        })
    }

    pub fn thing_name(&self) -> &str {
        self.channel.thing_name()
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn shadow(&self) -> Option<&ShadowClient> {
        self.shadow.as_ref()
    }

    pub fn jobs(&self) -> Option<&JobsClient> {
        self.jobs.as_ref()
    }

    pub fn tunnels(&self) -> Option<&TunnelLauncher> {
        self.tunnels.as_ref()
    }

    /// Start a fleet provisioning client on this device's channel.
    ///
    /// Call at most once per device: its routes stay registered.
    pub async fn provisioning(&self) -> IotResult<ProvisioningClient> {
        ProvisioningClient::start(self.channel.clone(), self.router.clone()).await
    }

    /// Connection state, when the device owns its connection.
    pub fn watch_state(&self) -> Option<watch::Receiver<DeviceState>> {
        self.state.clone()
    }

    /// Stop tunnels, disconnect, and wait for background tasks.
    pub async fn disconnect(self) -> IotResult<()> {
        if let Some(tunnels) = &self.tunnels {
            tunnels.shutdown();
        }
        let result = self.channel.disconnect().await.wrap_err("disconnecting");
        for task in self.tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                tracing::debug!("background task did not stop in time, aborting");
                abort.abort();
            }
        }
        tracing::info!("device disconnected");
        result
    }
}

fn abort_all(tasks: &[JoinHandle<()>]) {
    for task in tasks {
        task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotdev_mqtt::MockChannel;
    use serde_json::json;

    fn config(extra: &str) -> AgentConfig {
        let toml = format!(
            r#"
thing_name = "thing1"

[mqtt]
broker_host = "localhost"
client_id = "thing1"
transport = "tcp"
{extra}
"#
        );
        toml::from_str(&toml).unwrap()
    }

    #[tokio::test]
    async fn default_config_starts_shadow_and_jobs() {
        let mock = Arc::new(MockChannel::new());
        let device = Device::with_channel(mock.clone(), &config("")).await.unwrap();

        assert!(device.shadow().is_some());
        assert!(device.jobs().is_some());
        assert!(device.tunnels().is_none());
        assert!(device.watch_state().is_none());
        assert_eq!(device.thing_name(), "thing1");
        assert!(mock.is_subscribed_to("$aws/things/thing1/shadow/update/+"));
        assert!(mock.is_subscribed_to("$aws/things/thing1/jobs/notify"));
    }

    #[tokio::test]
    async fn disabled_clients_are_not_started() {
        let mock = Arc::new(MockChannel::new());
        let extra = "[shadow]\nenabled = false\n[jobs]\nenabled = false\n[tunnel]\nenabled = true\n";
        let device = Device::with_channel(mock.clone(), &config(extra)).await.unwrap();

        assert!(device.shadow().is_none());
        assert!(device.jobs().is_none());
        assert!(device.tunnels().is_some());
        assert_eq!(mock.subscriptions().len(), 1);
        assert!(mock.is_subscribed_to("$aws/things/thing1/tunnels/notify"));
    }

    #[tokio::test]
    async fn inbound_messages_reach_the_clients() {
        let mock = Arc::new(MockChannel::new());
        let device = Device::with_channel(mock.clone(), &config("")).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        device
            .shadow()
            .unwrap()
            .on_delta(move |delta| tx.send(delta.clone()).unwrap());
        mock.inject(
            "$aws/things/thing1/shadow/update/delta",
            json!({"state": {"led": "on"}, "version": 2}).to_string(),
        );
        let delta = rx.recv().await.unwrap();
        assert_eq!(delta["led"], "on");
    }

    #[tokio::test]
    async fn provisioning_shares_the_channel() {
        let mock = Arc::new(MockChannel::new());
        let device = Device::with_channel(mock.clone(), &config("")).await.unwrap();
        let _provisioning = device.provisioning().await.unwrap();
        assert!(mock.is_subscribed_to("$aws/certificates/create/json/+"));
        // Routes stay registered, so a second client is refused.
        assert!(device.provisioning().await.is_err());
    }

    #[tokio::test]
    async fn disconnect_reaches_the_channel() {
        let mock = Arc::new(MockChannel::new());
        let device = Device::with_channel(mock.clone(), &config("")).await.unwrap();
        device.disconnect().await.unwrap();
        assert!(mock.disconnected());
    }
}
