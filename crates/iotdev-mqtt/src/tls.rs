//! Transports for connections to AWS IoT Core.
//!
//! `mqtts` loads the X.509 device certificate, private key, and CA
//! certificate from PEM files. `wss` relies on a presigned URL and the
//! platform roots.

use rumqttc::Transport;

use iotdev_protocol::{IotError, IotResult};

use crate::config::MqttConfig;

fn read_pem(kind: &str, path: &str) -> IotResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| IotError::Tls(format!("failed to read {kind} '{path}': {e}")))
}

/// Build a mutual-TLS transport from certificate file paths in the config.
pub fn load_tls_transport(config: &MqttConfig) -> IotResult<Transport> {
    let ca = read_pem("CA cert", &config.ca_cert_path)?;
    let client_cert = read_pem("client cert", &config.client_cert_path)?;
    let client_key = read_pem("client key", &config.client_key_path)?;

    Ok(Transport::tls_with_config(
        rumqttc::TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: Some((client_cert, client_key)),
        },
    ))
}

/// MQTT over WebSocket with TLS; the broker address must be the full URL.
pub fn websocket_transport() -> Transport {
    Transport::wss_with_default_config()
}

/// Plain TCP, for local brokers only.
pub fn plaintext_transport() -> Transport {
    Transport::Tcp
}
