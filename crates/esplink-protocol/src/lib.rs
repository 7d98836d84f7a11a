//! # esplink-protocol
//!
//! Message types and codec for the esplink device protocol.
//!
//! The protocol is newline-delimited UTF-8 JSON, one object per line, in
//! both directions:
//! - Client → Device: `{"command": "...", ...}` requests
//! - Device → Client: responses (`status`/`message`/`timestamp`) and
//!   periodic status broadcasts (`"type": "status"`)

pub mod codec;
pub mod messages;

pub use codec::*;
pub use messages::*;
