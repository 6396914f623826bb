//! Shared types for the AWS IoT device runtime (device + tunnel emulator).
//!
//! Nothing in this crate touches the network: topic builders, service wire
//! types, shadow state algorithms, and the common error type.

pub mod error;
pub mod jobs;
pub mod provisioning;
pub mod service;
pub mod shadow_state;
pub mod shadows;
pub mod topics;
pub mod tunnels;

pub use error::{IotError, IotResult, ResultExt};
pub use service::{ClientToken, ErrorResponse};
pub use shadows::*;
pub use tunnels::{ProxyMode, TunnelNotification};
