//! Starts destination proxies when the service announces a tunnel.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use iotdev_mqtt::{Channel, Message, QoS, Router};
use iotdev_protocol::{IotError, IotResult, ProxyMode, TunnelNotification, topics};
use iotdev_tunnel::{ProxyOptions, TcpDialer};

use crate::config::TunnelSettings;

type NotifyCallback = Arc<dyn Fn(&TunnelNotification) + Send + Sync>;

struct Inner {
    settings: TunnelSettings,
    sessions: Mutex<Vec<JoinHandle<()>>>,
    on_notify: Mutex<Option<NotifyCallback>>,
}

impl Inner {
    fn handle(&self, msg: &Message) {
        let notification: TunnelNotification = match serde_json::from_slice(&msg.payload) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, topic = %msg.topic, "malformed tunnel notification");
                return;
            }
        };

        let callback = self
            .on_notify
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(&notification);
        }

        if notification.client_mode != ProxyMode::Destination {
            tracing::debug!(mode = %notification.client_mode, "ignoring non-destination tunnel");
            return;
        }
        let Some((service, addr)) = self.local_service(&notification) else {
            tracing::warn!(services = ?notification.services, "no local service configured for tunnel");
            return;
        };

        let endpoint = self.settings.endpoint_for(&notification.region);
        tracing::info!(%service, %addr, %endpoint, "opening destination tunnel");
        let task = tokio::spawn(run_destination(
            endpoint,
            notification.client_access_token,
            addr,
        ));
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.retain(|s| !s.is_finished());
        sessions.push(task);
    }

    /// First announced service with a configured local address.
    fn local_service(&self, notification: &TunnelNotification) -> Option<(String, String)> {
        notification.services.iter().find_map(|service| {
            self.settings
                .services
                .get(service)
                .map(|addr| (service.clone(), addr.clone()))
        })
    }
}

async fn run_destination(endpoint: String, token: String, addr: String) {
    let ws = match iotdev_tunnel::connect(&endpoint, ProxyMode::Destination, &token).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::error!(error = %e, "tunnel connect failed");
            return;
        }
    };
    let dialer = Arc::new(TcpDialer::new(addr));
    if let Err(e) = iotdev_tunnel::proxy_destination(ws, dialer, ProxyOptions::new()).await {
        tracing::warn!(error = %e, "destination tunnel failed");
    }
}

/// Listens on the thing's tunnel notification topic.
pub struct TunnelLauncher {
    inner: Arc<Inner>,
}

impl TunnelLauncher {
    pub async fn start(
        channel: Arc<dyn Channel>,
        router: &Router,
        settings: TunnelSettings,
    ) -> IotResult<Self> {
        let inner = Arc::new(Inner {
            settings,
            sessions: Mutex::new(Vec::new()),
            on_notify: Mutex::new(None),
        });
        let topic = topics::tunnels_notify(channel.thing_name());
        let handler = inner.clone();
        router.register(topic.clone(), move |m| handler.handle(m))?;
        channel
            .subscribe(&topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| IotError::wrap("subscribing to tunnel notifications", e))?;
        Ok(Self { inner })
    }

    /// Observe every notification, whatever its mode.
    pub fn on_notify<F>(&self, callback: F)
    where
        F: Fn(&TunnelNotification) + Send + Sync + 'static,
    {
        *self
            .inner
            .on_notify
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    /// Destination sessions still running.
    pub fn active_sessions(&self) -> usize {
        let sessions = self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.iter().filter(|s| !s.is_finished()).count()
    }

    /// Abort every running session.
    pub fn shutdown(&self) {
        let sessions = std::mem::take(
            &mut *self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for session in sessions {
            session.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use futures_util::{SinkExt, StreamExt};
    use iotdev_mqtt::MockChannel;
    use iotdev_tunnel::Frame;
    use serde_json::json;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;

    async fn launcher(settings: TunnelSettings) -> (Arc<MockChannel>, TunnelLauncher) {
        let mock = Arc::new(MockChannel::new());
        let router = Arc::new(Router::new());
        mock.handle(router.clone());
        let launcher = TunnelLauncher::start(mock.clone(), &router, settings)
            .await
            .unwrap();
        (mock, launcher)
    }

    fn notification(mode: &str, services: &[&str]) -> Vec<u8> {
        json!({
            "clientAccessToken": "dest-token",
            "clientMode": mode,
            "region": "us-east-1",
            "services": services,
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn subscribes_to_notify_topic() {
        let (mock, _launcher) = launcher(TunnelSettings::default()).await;
        assert!(mock.is_subscribed_to("$aws/things/thing1/tunnels/notify"));
    }

    #[tokio::test]
    async fn source_and_unknown_services_are_ignored() {
        let mut settings = TunnelSettings::default();
        settings.services.insert("ssh".into(), "127.0.0.1:22".into());
        let (mock, launcher) = launcher(settings).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        launcher.on_notify(move |n| log.lock().unwrap().push(n.client_mode));

        let topic = "$aws/things/thing1/tunnels/notify";
        assert!(mock.inject(topic, notification("source", &["ssh"])));
        assert!(mock.inject(topic, notification("destination", &["vnc"])));
        assert!(mock.inject(topic, b"not json".to_vec()));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ProxyMode::Source, ProxyMode::Destination]
        );
        assert_eq!(launcher.active_sessions(), 0);
    }

    #[tokio::test]
    async fn destination_notification_proxies_to_local_service() {
        // Local service the tunnel should reach.
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service_addr = service.local_addr().unwrap().to_string();

        // Stand-in for the tunnel proxy endpoint.
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (sock, _) = proxy.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_hdr_async(sock, |req: &Request, mut resp: Response| {
                let token = req.headers()["access-token"].to_str().unwrap().to_string();
                seen_tx.send((token, req.uri().to_string())).unwrap();
                resp.headers_mut().insert(
                    SEC_WEBSOCKET_PROTOCOL,
                    HeaderValue::from_static(iotdev_tunnel::SUBPROTOCOL),
                );
                Ok(resp)
            })
            .await
            .unwrap();
            let start = Frame::stream_start(1).to_wire().unwrap();
            let data = Frame::data(1, &b"hello"[..]).to_wire().unwrap();
            ws.send(WsMessage::Binary(start.into())).await.unwrap();
            ws.send(WsMessage::Binary(data.into())).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let mut settings = TunnelSettings::default();
        settings.enabled = true;
        settings.endpoint = Some(format!("ws://{proxy_addr}/tunnel"));
        settings.services = BTreeMap::from([("ssh".to_string(), service_addr)]);
        let (mock, launcher) = launcher(settings).await;

        mock.inject(
            "$aws/things/thing1/tunnels/notify",
            notification("destination", &["ssh"]),
        );

        let (token, uri) = seen_rx.recv().await.unwrap();
        assert_eq!(token, "dest-token");
        assert!(uri.ends_with("/tunnel?local-proxy-mode=destination"));

        let (mut conn, _) = service.accept().await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(launcher.active_sessions(), 1);

        launcher.shutdown();
        assert_eq!(launcher.active_sessions(), 0);
    }
}
