//! iotdev agent: keeps a thing connected to AWS IoT and serves its shadow,
//! jobs, and secure tunnel notifications.

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use iotdev_agent::{AgentConfig, Device};
use iotdev_mqtt::DeviceState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "iotdev-agent starting");

    // ── Load config ─────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/iotdev/agent.toml".to_string());

    let config = AgentConfig::from_file(&config_path)?;
    tracing::info!(
        thing = %config.thing_name,
        transport = ?config.mqtt.transport,
        "config loaded"
    );

    // ── Connect and start clients ───────────────────────────────
    let device = Device::connect(&config).await?;

    if let Some(shadow) = device.shadow() {
        shadow.on_delta(|delta| {
            let keys: Vec<&String> = delta.keys().collect();
            tracing::info!(?keys, "shadow delta received");
        });
    }
    if let Some(jobs) = device.jobs() {
        jobs.on_job_change(|jobs| {
            for (state, executions) in jobs {
                tracing::info!(?state, count = executions.len(), "jobs changed");
            }
        });
    }
    if let Some(tunnels) = device.tunnels() {
        tunnels.on_notify(|n| {
            tracing::info!(mode = %n.client_mode, services = ?n.services, "tunnel notification");
        });
    }

    tracing::info!("iotdev-agent ready");

    tokio::select! {
        () = initial_sync(&device) => {}
        () = log_state(device.watch_state()) => {
            tracing::error!("connection state watch ended unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    device.disconnect().await?;
    tracing::info!("iotdev-agent stopped");
    Ok(())
}

/// Fetch the shadow and pending jobs once, then idle.
async fn initial_sync(device: &Device) {
    if let Some(shadow) = device.shadow() {
        match shadow.get().await {
            Ok(doc) => tracing::info!(version = doc.version, "shadow synced"),
            Err(e) => tracing::warn!(error = %e, "initial shadow get failed"),
        }
    }
    if let Some(jobs) = device.jobs() {
        match jobs.get_pending_jobs().await {
            Ok(pending) => tracing::info!(states = pending.len(), "pending jobs fetched"),
            Err(e) => tracing::warn!(error = %e, "initial job listing failed"),
        }
    }
    std::future::pending::<()>().await
}

async fn log_state(state: Option<watch::Receiver<DeviceState>>) {
    let Some(mut state) = state else {
        return std::future::pending().await;
    };
    while state.changed().await.is_ok() {
        let current = *state.borrow_and_update();
        tracing::info!(state = ?current, "connection state changed");
    }
}
