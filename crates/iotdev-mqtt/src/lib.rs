//! MQTT plumbing for the AWS IoT device runtime.
//!
//! - `Channel` trait for publish/subscribe (mockable in tests)
//! - `MqttChannel` over rumqttc with mTLS or presigned WebSocket transport
//! - `OfflineCoordinator` for connection state and offline queueing
//! - `Router` for inbound topic dispatch
//! - `TokenBroker` for request/response correlation
//! - `MockChannel` for testing without a broker

pub mod backoff;
pub mod channel;
pub mod config;
pub mod correlator;
pub mod mock;
pub mod offline;
pub mod presign;
pub mod queue;
pub mod router;
pub mod tls;

// Re-exports for convenience.
pub use backoff::{Backoff, ExponentialBackoff};
pub use channel::{Channel, ConnectionEvent, EventLoopDriver, MqttChannel};
pub use config::{MqttConfig, OfflineConfig, TransportKind};
pub use correlator::{Pending, TokenBroker, TokenGenerator};
pub use mock::MockChannel;
pub use offline::{DeviceState, OfflineChannel, OfflineCoordinator};
pub use presign::{Credentials, EndpointSigner, Presigner, UrlSigner};
pub use queue::{BoundedQueue, DropPolicy};
pub use router::{Handler, Message, Router};
pub use rumqttc::QoS;
