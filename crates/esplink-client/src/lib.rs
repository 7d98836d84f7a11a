//! # esplink-client
//!
//! Client side of the esplink protocol.
//!
//! This crate provides:
//! - [`ClientSession`], a sans-io state machine that mirrors the device's
//!   view of the session (handshake, line reassembly, status cache)
//! - [`DeviceClient`], a Tokio driver that runs a session over TCP with
//!   the auth settle delay, keep-alive pings and optional reconnects

pub mod connection;
pub mod session;

pub use connection::{friendly_io_error, ClientConfig, ClientError, DeviceClient};
pub use session::{ClientEvent, ClientSession, ClientState};
