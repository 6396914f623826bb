//! iotdev-tunnel-server: secure tunneling emulator.
//!
//! Serves `OpenTunnel`/`CloseTunnel`/`DescribeTunnel` at `/` and the
//! source/destination relay at `/tunnel`. With `MQTT_BROKER_HOST` set,
//! opened tunnels are announced to their destination thing.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use iotdev_mqtt::{Backoff, ExponentialBackoff, MqttChannel, OfflineConfig, OfflineCoordinator};
use iotdev_tunnel_server::{AppState, Notifier, ServerConfig, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "iotdev-tunnel-server starting");

    let config = ServerConfig::from_env();

    let notifier = match &config.mqtt {
        Some(mqtt) => {
            let (channel, driver) = MqttChannel::new(mqtt, &mqtt.client_id)?;
            let offline = OfflineConfig::default();
            let backoff: Arc<dyn Backoff> =
                Arc::new(ExponentialBackoff::new(offline.backoff_base(), offline.backoff_max()));
            let (coordinator, channel, events) =
                OfflineCoordinator::new(Arc::new(channel), offline, backoff.clone());
            tokio::spawn(coordinator.run());
            tokio::spawn(driver.run(events, backoff));
            tracing::info!(broker = %mqtt.broker_host, "tunnel notifications enabled");
            Some(Notifier::new(Arc::new(channel), config.notify_topic_format.clone()))
        }
        None => {
            tracing::warn!("MQTT_BROKER_HOST not set, tunnel notifications disabled");
            None
        }
    };

    let addr = format!("{}:{}", config.host, config.port);
    let app = build_router(AppState::new(config, notifier));

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, app).await?;

    Ok(())
}
