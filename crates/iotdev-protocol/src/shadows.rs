use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IotResult;
use crate::service::ClientToken;
use crate::shadow_state::{NestedMetadata, update_state};

/// A JSON object holding one branch of shadow state.
pub type StateMap = serde_json::Map<String, Value>;

/// The three sections of a device shadow.
///
/// Modeled after AWS IoT Device Shadows: reported (from device),
/// desired (from cloud), and delta (difference computed by the service).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThingState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<StateMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported: Option<StateMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<StateMap>,
}

/// Per-key update timestamps, shaped like the state they describe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThingMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<StateMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported: Option<StateMap>,
}

/// Device-side copy of a thing shadow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThingDocument {
    #[serde(default)]
    pub state: ThingState,
    #[serde(default)]
    pub metadata: ThingMetadata,
    /// Shadow version (monotonically increasing).
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub timestamp: u64,
}

/// Inbound message on any shadow response topic.
///
/// `state` is kept raw so that an explicit `null` branch ("clear") can be
/// told apart from an absent one.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowMessage {
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub client_token: Option<String>,
}

impl ClientToken for ShadowMessage {
    fn client_token(&self) -> Option<&str> {
        self.client_token.as_deref()
    }
}

/// Body published to `.../shadow/update`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowUpdateRequest {
    pub state: UpdateState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

/// `Some(Value::Null)` serializes as `null`, which clears the branch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported: Option<Value>,
}

/// Body published to `.../shadow/get` and `.../shadow/delete`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowTokenRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

impl ThingDocument {
    /// Whether a message at `version` would be applied.
    pub fn accepts(&self, version: u64) -> bool {
        version > self.version
    }

    /// Install a full document from `get/accepted`.
    ///
    /// Returns `false` without touching the document when the message is stale.
    pub fn replace(&mut self, msg: &ShadowMessage) -> IotResult<bool> {
        if !self.accepts(msg.version) {
            return Ok(false);
        }
        let state: ThingState = match &msg.state {
            Value::Null => ThingState::default(),
            v => serde_json::from_value(v.clone())?,
        };
        let metadata: ThingMetadata = match &msg.metadata {
            Value::Null => ThingMetadata::default(),
            v => serde_json::from_value(v.clone())?,
        };
        self.state = state;
        self.metadata = metadata;
        self.version = msg.version;
        self.timestamp = msg.timestamp;
        Ok(true)
    }

    /// Merge the `desired`/`reported` branches of `update/accepted`.
    pub fn merge_accepted(&mut self, msg: &ShadowMessage) -> IotResult<bool> {
        if !self.accepts(msg.version) {
            return Ok(false);
        }
        if let Some(update) = msg.state.get("desired") {
            update_state(&mut self.state.desired, update)?;
        }
        if let Some(update) = msg.state.get("reported") {
            update_state(&mut self.state.reported, update)?;
        }
        if let Some(update) = msg.metadata.get("desired") {
            update_state(&mut self.metadata.desired, update)?;
        }
        if let Some(update) = msg.metadata.get("reported") {
            update_state(&mut self.metadata.reported, update)?;
        }
        self.version = msg.version;
        self.timestamp = msg.timestamp;
        Ok(true)
    }

    /// Replace the delta section wholesale from `update/delta`.
    pub fn apply_delta(&mut self, msg: &ShadowMessage) -> IotResult<bool> {
        if !self.accepts(msg.version) {
            return Ok(false);
        }
        self.state.delta = match &msg.state {
            Value::Object(map) if !map.is_empty() => Some(map.clone()),
            Value::Object(_) | Value::Null => None,
            other => {
                return Err(crate::IotError::Decode(format!(
                    "delta state must be an object, got {other}"
                )));
            }
        };
        self.version = msg.version;
        self.timestamp = msg.timestamp;
        Ok(true)
    }

    /// Clear all state after `delete/accepted`; the version is retained.
    pub fn clear(&mut self, msg: &ShadowMessage) {
        self.state = ThingState::default();
        self.metadata = ThingMetadata::default();
        self.version = self.version.max(msg.version);
        self.timestamp = msg.timestamp;
    }

    pub fn desired_metadata(&self) -> Option<NestedMetadata> {
        self.metadata
            .desired
            .as_ref()
            .map(|m| NestedMetadata::from_value(&Value::Object(m.clone())))
    }

    pub fn reported_metadata(&self) -> Option<NestedMetadata> {
        self.metadata
            .reported
            .as_ref()
            .map(|m| NestedMetadata::from_value(&Value::Object(m.clone())))
    }
}
