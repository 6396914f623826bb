//! Device runtime for AWS IoT.
//!
//! Composes the MQTT plumbing from `iotdev-mqtt` with the service clients:
//! Device Shadow, Jobs, Fleet Provisioning, and the secure tunnel launcher.
//! Exposed as a library so `iotdev-e2e-tests` can drive the clients over a
//! mock channel.

pub mod config;
pub mod device;
pub mod jobs;
pub mod provisioning;
pub mod shadow;
pub mod tunnel;

pub use config::AgentConfig;
pub use device::Device;
pub use jobs::{JobsClient, UpdateOptions};
pub use provisioning::{IssuedCertificate, ProvisioningClient, Registration};
pub use shadow::ShadowClient;
pub use tunnel::TunnelLauncher;
