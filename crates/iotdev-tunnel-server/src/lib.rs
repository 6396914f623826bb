//! Secure tunneling emulator.
//!
//! An in-process stand-in for the AWS IoT Secure Tunneling control plane
//! and its WebSocket relay, used to exercise local proxies end to end.
//! The binary (`main.rs`) and `iotdev-e2e-tests` share these modules.

pub mod config;
pub mod error;
pub mod notify;
pub mod routes;
pub mod state;

pub use config::ServerConfig;
pub use notify::Notifier;
pub use routes::build_router;
pub use state::AppState;
