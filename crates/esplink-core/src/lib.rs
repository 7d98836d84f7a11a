//! # esplink-core
//!
//! Device-side session logic for esplink boards.
//!
//! This crate provides:
//! - The fixed-capacity session table and the [`Transport`] seam
//! - Command dispatch with per-session authentication
//! - Board state (outputs, debounced inputs, smoothed analog, servos)
//! - The periodic status broadcaster and idle-session reaper
//! - [`DeviceNode`], which ties these together into one control loop
//!
//! This crate is intentionally runtime-agnostic and contains no async code.
//! Time is passed in as milliseconds of uptime.

pub mod broadcast;
pub mod config;
pub mod dispatch;
pub mod node;
pub mod peripheral;
pub mod session;
pub mod sim;
pub mod transport;

pub use broadcast::{broadcast_status, Broadcaster, Every};
pub use config::{ConfigError, ConfigStorage, DeviceSettings, FileConfigStorage};
pub use dispatch::{CommandError, Dispatcher, ErrorCategory, Reply};
pub use node::{DeviceNode, SessionSummary, TickReport};
pub use peripheral::{Board, BoardLayout, BoardProfile, PeripheralDriver, PotFollow};
pub use session::{
    AuthState, CapacityError, Session, SessionTable, SlotId, Transport, TransportError,
};
pub use sim::SimulatedDriver;
pub use transport::MemoryTransport;
