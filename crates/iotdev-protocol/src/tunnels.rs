use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::IotError;

/// WebSocket subprotocol spoken by the secure tunneling service.
pub const SUBPROTOCOL: &str = "aws.iot.securetunneling-1.0";

/// Header carrying a client access token.
pub const ACCESS_TOKEN_HEADER: &str = "access-token";

/// Query parameter selecting the local proxy mode.
pub const PROXY_MODE_PARAM: &str = "local-proxy-mode";

/// Which end of a secure tunnel a local proxy serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    Source,
    Destination,
}

impl ProxyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::Source => "source",
            ProxyMode::Destination => "destination",
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyMode {
    type Err = IotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" => Ok(ProxyMode::Source),
            "destination" => Ok(ProxyMode::Destination),
            other => Err(IotError::Invalid(format!("unknown local proxy mode '{other}'"))),
        }
    }
}

/// Payload published to `$aws/things/{thing}/tunnels/notify` when a tunnel
/// is opened for the thing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelNotification {
    pub client_access_token: String,
    pub client_mode: ProxyMode,
    pub region: String,
    #[serde(default)]
    pub services: Vec<String>,
}
