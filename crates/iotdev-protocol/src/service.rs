//! Types common to every request/response service on the reserved topics.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::IotResult;

/// Body of a `.../rejected` response.
///
/// Shadow and provisioning services send a numeric `code`; the Jobs service
/// sends a string such as `"VersionMismatch"`. Both are kept as JSON.
/// Provisioning uses `errorCode`/`errorMessage` for the same fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    #[serde(default, alias = "errorCode")]
    pub code: serde_json::Value,
    #[serde(default, alias = "errorMessage")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Present on Jobs rejections (`VersionMismatch` carries the current state).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<serde_json::Value>,
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            serde_json::Value::String(code) => write!(f, "{code}: {}", self.message),
            serde_json::Value::Null => write!(f, "{}", self.message),
            code => write!(f, "{code}: {}", self.message),
        }
    }
}

/// Access to the `clientToken` echoed back by a service.
///
/// Implemented by every response type that takes part in token correlation.
pub trait ClientToken {
    fn client_token(&self) -> Option<&str>;
}

impl ClientToken for ErrorResponse {
    fn client_token(&self) -> Option<&str> {
        self.client_token.as_deref()
    }
}

/// Minimal view used to route a response before full decoding.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenOnly {
    #[serde(default)]
    pub client_token: Option<String>,
}

impl ClientToken for TokenOnly {
    fn client_token(&self) -> Option<&str> {
        self.client_token.as_deref()
    }
}

/// The `clientToken` a reply answers to.
///
/// Read from the decoded response or its rejection. When the reply failed
/// for another reason, the token is picked straight out of `payload`.
pub fn reply_token<T: ClientToken>(reply: &IotResult<T>, payload: &[u8]) -> Option<String> {
    let token = match reply {
        Ok(response) => response.client_token(),
        Err(e) => match e.rejection() {
            Some(rejection) => rejection.client_token(),
            None => {
                return serde_json::from_slice::<TokenOnly>(payload)
                    .ok()
                    .and_then(|t| t.client_token);
            }
        },
    };
    token.map(str::to_owned)
}
