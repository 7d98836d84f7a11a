//! # esplink-server
//!
//! Serves an esplink [`DeviceNode`](esplink_core::DeviceNode) over TCP.
//!
//! The node itself stays single-threaded: one control loop owns the
//! session table and the board. Each connection gets a reader task and a
//! writer task that talk to the loop through bounded channels.

pub mod server;
pub mod transport;

pub use esplink_core::{BoardProfile, DeviceSettings, PeripheralDriver, SimulatedDriver};
pub use server::{DeviceServer, ServerConfig, ServerError};
pub use transport::TcpTransport;
