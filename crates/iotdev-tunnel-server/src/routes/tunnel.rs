//! Tunnel data plane: WebSocket relay between source and destination.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};

use iotdev_protocol::ProxyMode;
use iotdev_protocol::tunnels::{ACCESS_TOKEN_HEADER, PROXY_MODE_PARAM, SUBPROTOCOL};

use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, Attachment, Tunnel};

/// GET /tunnel?local-proxy-mode={source|destination} with an
/// `access-token` header.
///
/// The upgrade is checked last so requests without upgrade headers still
/// get the validation errors.
pub async fn tunnel_handler(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> ApiResult<Response> {
    let mode = query
        .get(PROXY_MODE_PARAM)
        .ok_or_else(|| ApiError::BadRequest(format!("missing '{PROXY_MODE_PARAM}' parameter")))?
        .parse::<ProxyMode>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let token = headers
        .get(ACCESS_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing access token".into()))?;

    let (tunnel, granted) = state
        .find_by_token(token)
        .await
        .ok_or_else(|| ApiError::Unauthorized("unknown access token".into()))?;
    if granted != mode {
        return Err(ApiError::Unauthorized(format!(
            "access token does not grant {mode} access"
        )));
    }
    if tunnel.is_closed() {
        return Err(ApiError::NotFound(format!("tunnel '{}' is closed", tunnel.id)));
    }

    let upgrade = upgrade.map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let attachment = tunnel.attach(mode)?;
    Ok(upgrade
        .protocols([SUBPROTOCOL])
        .on_upgrade(move |socket| relay(socket, tunnel, attachment, mode)))
}

/// Forward binary messages to the peer's pipe and the peer's messages back,
/// untouched, until either side goes away or the tunnel closes.
async fn relay(socket: WebSocket, tunnel: Arc<Tunnel>, mut attachment: Attachment, mode: ProxyMode) {
    tracing::info!(tunnel_id = %tunnel.id, %mode, "tunnel peer connected");
    let (mut sink, mut stream) = socket.split();
    let closed = tunnel.closed();
    tokio::pin!(closed);

    loop {
        tokio::select! {
            _ = &mut closed => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            outgoing = attachment.inbound.recv() => {
                let Some(data) = outgoing else { break };
                if sink.send(Message::Binary(data)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        tokio::select! {
                            sent = attachment.outbound.send(data) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                            _ = &mut closed => {
                                let _ = sink.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(tunnel_id = %tunnel.id, %mode, error = %e, "tunnel socket error");
                        break;
                    }
                }
            }
        }
    }

    tracing::info!(tunnel_id = %tunnel.id, %mode, "tunnel peer disconnected");
}
