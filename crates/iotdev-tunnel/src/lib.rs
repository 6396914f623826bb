//! Secure tunnel local proxy.
//!
//! - `frame`: length-prefixed protobuf frames
//! - `mux`: source and destination stream multiplexers
//! - `dialer`: local connections for destination streams
//! - `client`: dialing the tunnel proxy endpoint

pub mod client;
pub mod dialer;
pub mod frame;
pub mod mux;

pub use client::{SUBPROTOCOL, TunnelSocket, connect};
pub use dialer::{BoxedStream, Dialer, TcpDialer, TunnelStream};
pub use frame::{Frame, FrameDecoder, FrameType};
pub use mux::{ErrorHandler, ProxyOptions, proxy_destination, proxy_source};
