//! Client-side session state machine.
//!
//! ```text
//! Disconnected ──begin_connect──▶ Connecting ──on_connected──▶ AwaitingAuthAck
//!       ▲                                                          │ success
//!       └────────────── on_disconnected (any state) ◀── Authenticated
//! ```
//!
//! `Failed` is entered on a transport error, or on an error response before
//! authentication (the driver must then close the connection). A new
//! `begin_connect` leaves `Failed` and restarts the handshake.

use esplink_protocol::{
    decode_server_message, encode_request, LineBuffer, Request, Response, ResponseStatus,
    ServerMessage, StatusMessage,
};
use tracing::{debug, info, trace, warn};

/// Connection state as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    #[default]
    Disconnected,
    Connecting,
    AwaitingAuthAck,
    Authenticated,
    Failed,
}

/// Something the consumer should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(ClientState),
    /// Any non-status reply, including the initial challenge.
    Response(Response),
    Status(StatusMessage),
    /// Human-readable error (device error reply or transport failure).
    Error(String),
}

/// Sans-io client session. Feed it socket events, send what it returns.
#[derive(Debug)]
pub struct ClientSession {
    state: ClientState,
    password: String,
    lines: LineBuffer,
    auth_sent: bool,
    close_requested: bool,
    latest_status: Option<StatusMessage>,
    last_error: Option<String>,
}

impl ClientSession {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            state: ClientState::Disconnected,
            password: password.into(),
            lines: LineBuffer::default(),
            auth_sent: false,
            close_requested: false,
            latest_status: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == ClientState::Authenticated
    }

    /// Most recent status payload, kept across reconnects.
    pub fn latest_status(&self) -> Option<&StatusMessage> {
        self.latest_status.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn transition(&mut self, next: ClientState, events: &mut Vec<ClientEvent>) {
        if self.state != next {
            debug!("Client state {:?} -> {:?}", self.state, next);
            self.state = next;
            events.push(ClientEvent::StateChanged(next));
        }
    }

    fn reset_connection(&mut self) {
        self.lines.clear();
        self.auth_sent = false;
        self.close_requested = false;
    }

    /// A connection attempt is starting.
    pub fn begin_connect(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        self.reset_connection();
        self.last_error = None;
        self.transition(ClientState::Connecting, &mut events);
        events
    }

    /// The transport connected. The auth request becomes available through
    /// [`ClientSession::auth_request`] once the settle delay has passed.
    pub fn on_connected(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        if self.state == ClientState::Connecting {
            self.transition(ClientState::AwaitingAuthAck, &mut events);
        }
        events
    }

    /// Encoded `auth` line, produced at most once per connection.
    pub fn auth_request(&mut self) -> Option<String> {
        if self.state != ClientState::AwaitingAuthAck || self.auth_sent {
            return None;
        }
        self.auth_sent = true;
        encode_request(&Request::Auth {
            password: self.password.clone(),
        })
        .ok()
    }

    /// Encoded line for `request`, or `None` when it must be dropped.
    ///
    /// Only authenticated sessions send commands; anything else is silently
    /// discarded.
    pub fn command(&self, request: &Request) -> Option<String> {
        if !self.is_authenticated() {
            trace!("Dropping {:?}: not authenticated", request);
            return None;
        }
        match encode_request(request) {
            Ok(line) => Some(line),
            Err(e) => {
                warn!("Failed to encode request: {}", e);
                None
            }
        }
    }

    /// Feed received bytes. Complete lines are processed in order.
    pub fn on_bytes(&mut self, data: &[u8]) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        for line in self.lines.push(data) {
            match line {
                Ok(line) => self.on_line(&line, &mut events),
                Err(e) => debug!("Ignoring line from device: {}", e),
            }
        }
        events
    }

    fn on_line(&mut self, line: &str, events: &mut Vec<ClientEvent>) {
        let message = match decode_server_message(line) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring unparseable line from device: {}", e);
                return;
            }
        };

        match message {
            ServerMessage::Status(status) => {
                self.latest_status = Some(status.clone());
                events.push(ClientEvent::Status(status));
            }
            ServerMessage::Response(response) => self.on_response(response, events),
        }
    }

    fn on_response(&mut self, response: Response, events: &mut Vec<ClientEvent>) {
        match response.status {
            ResponseStatus::Success if self.state == ClientState::AwaitingAuthAck => {
                info!("Authenticated with device");
                events.push(ClientEvent::Response(response));
                self.transition(ClientState::Authenticated, events);
            }
            ResponseStatus::Error if !self.is_authenticated() => {
                let message = format!("Device error: {}", response.message);
                warn!("{} (closing connection)", message);
                self.last_error = Some(message.clone());
                self.close_requested = true;
                events.push(ClientEvent::Response(response));
                events.push(ClientEvent::Error(message));
                self.transition(ClientState::Failed, events);
            }
            ResponseStatus::Error => {
                let message = format!("Device error: {}", response.message);
                events.push(ClientEvent::Response(response));
                events.push(ClientEvent::Error(message));
            }
            _ => events.push(ClientEvent::Response(response)),
        }
    }

    /// Whether the driver must close the connection. Reading clears it.
    pub fn take_close_request(&mut self) -> bool {
        std::mem::take(&mut self.close_requested)
    }

    /// The transport failed (connect error, reset, write failure).
    pub fn on_transport_error(&mut self, message: impl Into<String>) -> Vec<ClientEvent> {
        let message = message.into();
        let mut events = vec![ClientEvent::Error(message.clone())];
        self.last_error = Some(message);
        self.reset_connection();
        self.transition(ClientState::Failed, &mut events);
        events
    }

    /// The transport closed. A `Failed` session stays failed.
    pub fn on_disconnected(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        self.reset_connection();
        if self.state != ClientState::Failed {
            self.transition(ClientState::Disconnected, &mut events);
        }
        events
    }
}
