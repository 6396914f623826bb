//! Secure tunneling control plane: `X-Amz-Target` dispatch.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use iotdev_protocol::{ProxyMode, TunnelNotification};

use crate::config::MAX_LIFETIME_MINUTES;
use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, Tunnel};

pub const TARGET_HEADER: &str = "x-amz-target";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenTunnelRequest {
    #[serde(default)]
    pub description: Option<String>,
    pub destination_config: Option<DestinationConfig>,
    #[serde(default)]
    pub timeout_config: Option<TimeoutConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationConfig {
    #[serde(default)]
    pub thing_name: String,
    #[serde(default)]
    pub services: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    #[serde(default)]
    pub max_lifetime_timeout_minutes: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenTunnelResponse {
    pub tunnel_id: String,
    pub tunnel_arn: String,
    pub source_access_token: String,
    pub destination_access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TunnelIdRequest {
    tunnel_id: String,
}

/// POST /: route on the operation named by `X-Amz-Target`
/// (`IoTSecuredTunneling.OpenTunnel` or just `OpenTunnel`).
pub async fn dispatch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let target = headers
        .get(TARGET_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing X-Amz-Target header".into()))?;
    let operation = target.rsplit('.').next().unwrap_or(target);

    match operation {
        "OpenTunnel" => {
            let response = open_tunnel(&state, parse(&body)?).await?;
            Ok(Json(json!(response)))
        }
        "CloseTunnel" => {
            let req: TunnelIdRequest = parse(&body)?;
            close_tunnel(&state, &req.tunnel_id).await?;
            Ok(Json(json!({})))
        }
        "DescribeTunnel" => {
            let req: TunnelIdRequest = parse(&body)?;
            describe_tunnel(&state, &req.tunnel_id).await.map(Json)
        }
        other => Err(ApiError::BadRequest(format!("unsupported operation '{other}'"))),
    }
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))
}

pub async fn open_tunnel(state: &AppState, req: OpenTunnelRequest) -> ApiResult<OpenTunnelResponse> {
    let destination = req
        .destination_config
        .ok_or_else(|| ApiError::BadRequest("destinationConfig is required".into()))?;
    if destination.thing_name.is_empty() {
        return Err(ApiError::BadRequest("destinationConfig.thingName is required".into()));
    }
    if destination.services.is_empty() {
        return Err(ApiError::BadRequest("destinationConfig.services must not be empty".into()));
    }
    let lifetime = req.timeout_config.unwrap_or_default().max_lifetime_timeout_minutes;
    if lifetime > MAX_LIFETIME_MINUTES {
        return Err(ApiError::BadRequest(format!(
            "maxLifetimeTimeoutMinutes must be at most {MAX_LIFETIME_MINUTES}"
        )));
    }
    let lifetime = if lifetime == 0 {
        state.config.default_lifetime_minutes
    } else {
        lifetime
    };

    let tunnel = Arc::new(Tunnel::open(
        destination.thing_name,
        destination.services,
        lifetime,
    ));
    state.insert(tunnel.clone()).await;
    spawn_expiry(tunnel.clone(), Duration::from_secs(u64::from(lifetime) * 60));
    tracing::info!(
        tunnel_id = %tunnel.id,
        thing = %tunnel.thing_name,
        lifetime_minutes = lifetime,
        description = req.description.as_deref().unwrap_or(""),
        "tunnel opened"
    );

    if let Some(notifier) = &state.notifier {
        let notification = TunnelNotification {
            client_access_token: tunnel.destination_token.clone(),
            client_mode: ProxyMode::Destination,
            region: state.config.region.clone(),
            services: tunnel.services.clone(),
        };
        if let Err(e) = notifier.notify(&tunnel.thing_name, &notification).await {
            tracing::warn!(tunnel_id = %tunnel.id, error = %e, "destination notification failed");
        }
    }

    Ok(OpenTunnelResponse {
        tunnel_arn: tunnel_arn(&state.config.region, &tunnel.id),
        tunnel_id: tunnel.id.clone(),
        source_access_token: tunnel.source_token.clone(),
        destination_access_token: tunnel.destination_token.clone(),
    })
}

pub async fn close_tunnel(state: &AppState, tunnel_id: &str) -> ApiResult<()> {
    let tunnel = state
        .get(tunnel_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("tunnel '{tunnel_id}' not found")))?;
    if tunnel.close() {
        tracing::info!(tunnel_id, "tunnel closed");
    }
    Ok(())
}

pub async fn describe_tunnel(state: &AppState, tunnel_id: &str) -> ApiResult<Value> {
    let tunnel = state
        .get(tunnel_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("tunnel '{tunnel_id}' not found")))?;
    let connection = |mode: ProxyMode| {
        let status = if tunnel.is_connected(mode) { "CONNECTED" } else { "DISCONNECTED" };
        json!({ "status": status })
    };
    Ok(json!({
        "tunnel": {
            "tunnelId": tunnel.id,
            "tunnelArn": tunnel_arn(&state.config.region, &tunnel.id),
            "status": tunnel.status(),
            "sourceConnectionState": connection(ProxyMode::Source),
            "destinationConnectionState": connection(ProxyMode::Destination),
            "destinationConfig": DestinationConfig {
                thing_name: tunnel.thing_name.clone(),
                services: tunnel.services.clone(),
            },
            "timeoutConfig": {
                "maxLifetimeTimeoutMinutes": (tunnel.expires_at - tunnel.created_at).num_minutes(),
            },
            "createdAt": tunnel.created_at.to_rfc3339(),
        }
    }))
}

fn tunnel_arn(region: &str, tunnel_id: &str) -> String {
    format!("arn:aws:iot:{region}:000000000000:tunnel/{tunnel_id}")
}

fn spawn_expiry(tunnel: Arc<Tunnel>, lifetime: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(lifetime) => {
                if tunnel.close() {
                    tracing::info!(tunnel_id = %tunnel.id, "tunnel lifetime expired");
                }
            }
            _ = tunnel.closed() => {}
        }
    });
}
