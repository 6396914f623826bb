//! Dialing the tunnel proxy endpoint.

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use iotdev_protocol::tunnels::{ACCESS_TOKEN_HEADER, PROXY_MODE_PARAM};
use iotdev_protocol::{IotError, IotResult, ProxyMode};

pub use iotdev_protocol::tunnels::SUBPROTOCOL;

pub type TunnelSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Build the proxy URL for `mode`: `{endpoint}?local-proxy-mode={mode}`.
pub fn proxy_url(endpoint: &str, mode: ProxyMode) -> IotResult<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| IotError::Invalid(format!("tunnel endpoint '{endpoint}': {e}")))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(IotError::Invalid(format!(
                "unsupported tunnel endpoint scheme '{other}'"
            )));
        }
    }
    url.query_pairs_mut()
        .append_pair(PROXY_MODE_PARAM, mode.as_str());
    Ok(url)
}

/// Open the tunnel WebSocket as `mode` using `access_token`.
pub async fn connect(endpoint: &str, mode: ProxyMode, access_token: &str) -> IotResult<TunnelSocket> {
    let url = proxy_url(endpoint, mode)?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| IotError::Invalid(e.to_string()))?;
    let token = HeaderValue::from_str(access_token)
        .map_err(|_| IotError::Invalid("access token is not a valid header value".into()))?;
    let headers = request.headers_mut();
    headers.insert(ACCESS_TOKEN_HEADER, token);
    headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

    let (ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| IotError::wrap("dialing tunnel endpoint", IotError::Connection(e.to_string())))?;
    tracing::info!(mode = mode.as_str(), host = url.host_str().unwrap_or(""), "tunnel connected");
    Ok(ws)
}
