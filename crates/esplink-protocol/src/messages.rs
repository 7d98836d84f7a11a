//! Protocol message types.
//!
//! This module defines all message types exchanged with a device:
//! - Device → Client: Response, StatusMessage
//! - Client → Device: Request (typed, used by clients) and Command
//!   (loosely typed, used by the device to validate per command kind)
//!
//! Every message is a single JSON object on its own line.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Line sent to a connection that arrives while every session slot is taken.
pub const SERVER_FULL_LINE: &str = r#"{"status":"error","message":"Server full"}"#;

/// Message carried by the `auth_required` challenge sent on accept.
pub const AUTH_CHALLENGE: &str =
    r#"Send authentication: {"command":"auth","password":"your_password"}"#;

// ============================================================================
// Responses (Device → Client)
// ============================================================================

/// Value of the `status` field in a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
    AuthRequired,
}

/// Reply to a single request.
///
/// # Example
/// ```json
/// {"status":"success","message":"LED 1 set to ON","timestamp":15230}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,

    /// Human-readable outcome. Older servo firmware omits it on success.
    #[serde(default)]
    pub message: String,

    /// Device uptime in milliseconds.
    #[serde(default)]
    pub timestamp: u64,
}

impl Response {
    /// Create a success response.
    pub fn success(message: impl Into<String>, timestamp: u64) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: message.into(),
            timestamp,
        }
    }

    /// Create an error response.
    pub fn error(message: impl Into<String>, timestamp: u64) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: message.into(),
            timestamp,
        }
    }

    /// Create the authentication challenge sent to a fresh session.
    pub fn auth_required(timestamp: u64) -> Self {
        Self {
            status: ResponseStatus::AuthRequired,
            message: AUTH_CHALLENGE.to_string(),
            timestamp,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error
    }
}

// ============================================================================
// Status payload (Device → Client)
// ============================================================================

/// Discriminator for the `type` field of a status payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Status,
}

/// Point-in-time view of every peripheral on the device.
///
/// Sent periodically to authenticated sessions and in reply to
/// `get_status`.
///
/// # Example
/// ```json
/// {
///   "type": "status",
///   "timestamp": 120500,
///   "leds": [{"id": 1, "state": true}, {"id": 2, "state": false}],
///   "buttons": [{"id": 1, "pressed": false}],
///   "potentiometer": {"raw": 2048, "voltage": 1.65, "percent": 50},
///   "servo": {"angle": 90}
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,

    /// Device uptime in milliseconds.
    pub timestamp: u64,

    pub leds: Vec<LedState>,

    pub buttons: Vec<ButtonState>,

    pub potentiometer: PotentiometerReading,

    /// Present on single-servo boards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servo: Option<ServoAngle>,

    /// Present on multi-servo boards.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servos: Vec<ServoChannel>,
}

/// Output channel state. Ids are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedState {
    pub id: u8,
    pub state: bool,
}

/// Input channel press flag. Ids are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonState {
    pub id: u8,
    pub pressed: bool,
}

/// Smoothed analog reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PotentiometerReading {
    /// 12-bit ADC value (0-4095).
    pub raw: u16,
    /// Volts (0-3.3).
    pub voltage: f32,
    /// 0-100.
    pub percent: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServoAngle {
    pub angle: u8,
}

/// Servo channel position. Ids are 0-based, matching `servo_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServoChannel {
    pub id: u8,
    pub angle: u8,
}

/// Messages that can be received from a device.
///
/// Uses untagged deserialization: a status payload is recognised by its
/// `type` field, anything else with a `status` field is a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Status(StatusMessage),
    Response(Response),
}

// ============================================================================
// Requests (Client → Device)
// ============================================================================

/// Typed request built by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Auth {
        password: String,
    },
    SetLed {
        led: u8,
        state: bool,
    },
    SetAllLeds {
        state: bool,
    },
    GetStatus,
    Ping,
    SetServo {
        angle: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        servo_index: Option<u8>,
    },
}

/// Kind of a decoded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Auth,
    SetOutput,
    SetAllOutputs,
    GetStatus,
    Ping,
    SetServo,
    Unknown,
}

impl CommandKind {
    /// Map a wire command name to its kind. Unrecognised names are `Unknown`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "auth" => CommandKind::Auth,
            "set_led" | "set_output" => CommandKind::SetOutput,
            "set_all_leds" | "set_all_outputs" => CommandKind::SetAllOutputs,
            "get_status" => CommandKind::GetStatus,
            "ping" => CommandKind::Ping,
            "set_servo" => CommandKind::SetServo,
            _ => CommandKind::Unknown,
        }
    }
}

/// Loosely typed command as received by a device.
///
/// Field validation is left to the handler for each kind, so a request with
/// a missing or mistyped field still decodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub kind: CommandKind,
    /// Wire name as sent (empty when absent).
    pub name: String,
    /// Every field except `command`.
    pub args: Map<String, Value>,
}

impl Command {
    /// Build a command from an already parsed JSON value.
    ///
    /// Non-object values and objects without a string `command` field become
    /// an `Unknown` command with no arguments.
    pub fn from_value(value: Value) -> Self {
        let mut args = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let name = match args.remove("command") {
            Some(Value::String(name)) => name,
            _ => String::new(),
        };
        Self {
            kind: CommandKind::from_name(&name),
            name,
            args,
        }
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }

    pub fn arg_bool(&self, key: &str) -> Option<bool> {
        self.args.get(key).and_then(Value::as_bool)
    }

    /// Integer argument. Whole floats (e.g. `1.0`) are accepted.
    pub fn arg_i64(&self, key: &str) -> Option<i64> {
        let value = self.args.get(key)?;
        if let Some(n) = value.as_i64() {
            return Some(n);
        }
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
            .map(|f| f as i64)
    }
}
