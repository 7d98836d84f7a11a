//! Command dispatch.
//!
//! Decodes one request line, checks the session's authentication state,
//! runs the handler for the command kind and writes exactly one response
//! line back to the originating session.

use esplink_protocol::{
    decode_command, encode_response, encode_status, Command, CommandKind, LineError, Response,
    StatusMessage,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::peripheral::{Board, BoardProfile, PeripheralDriver, SERVO_MAX_ANGLE};
use crate::session::{AuthState, Session, Transport};

/// Broad class of a [`CommandError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed input.
    Protocol,
    /// Missing or wrong credentials.
    Auth,
    /// A field is missing or out of range.
    Validation,
}

/// A rejected request. The `Display` text is the wire `message`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Invalid JSON")]
    InvalidJson,

    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Invalid LED number (1-{max})")]
    InvalidLed { max: usize },

    #[error("Invalid state (expected true or false)")]
    InvalidState,

    #[error("Invalid angle")]
    InvalidAngle,

    #[error("Invalid servo index or angle")]
    InvalidServo,

    #[error("Unknown command")]
    UnknownCommand,
}

impl CommandError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CommandError::InvalidJson | CommandError::UnknownCommand => ErrorCategory::Protocol,
            CommandError::AuthenticationRequired | CommandError::InvalidPassword => {
                ErrorCategory::Auth
            }
            CommandError::InvalidLed { .. }
            | CommandError::InvalidState
            | CommandError::InvalidAngle
            | CommandError::InvalidServo => ErrorCategory::Validation,
        }
    }
}

/// Successful outcome of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `{"status":"success","message":...}`
    Message(String),
    /// Full status payload.
    Status(StatusMessage),
}

fn on_off(state: bool) -> &'static str {
    if state {
        "ON"
    } else {
        "OFF"
    }
}

/// Stateless command handler holding the shared secret.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    secret: String,
}

impl Dispatcher {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Send the `auth_required` challenge to a freshly accepted session.
    pub fn send_challenge<T: Transport>(&self, session: &mut Session<T>, now_ms: u64) {
        let line = render_response(&Response::auth_required(now_ms));
        if let Err(e) = session.send_line(&line) {
            debug!("Could not send challenge to {}: {}", session.display_id(), e);
        }
    }

    /// Handle one received line and write the response to `session`.
    ///
    /// Returns the response text that was written.
    pub fn handle_line<T, D>(
        &self,
        session: &mut Session<T>,
        board: &mut Board<D>,
        line: &str,
        now_ms: u64,
    ) -> String
    where
        T: Transport,
        D: PeripheralDriver,
    {
        debug!("Message from {}: {}", session.display_id(), line);

        let text = match self.execute(session, board, line, now_ms) {
            Ok(Reply::Message(message)) => render_response(&Response::success(message, now_ms)),
            Ok(Reply::Status(status)) => render_status(&status),
            Err(e) => {
                if e.category() == ErrorCategory::Auth {
                    warn!("{} from {}", e, session.display_id());
                } else {
                    debug!("Rejected request from {}: {}", session.display_id(), e);
                }
                render_response(&Response::error(e.to_string(), now_ms))
            }
        };

        reply(session, text)
    }

    /// Answer a line that was discarded before decoding (too long or not
    /// UTF-8). It is treated as malformed JSON.
    pub fn reject_line<T: Transport>(
        &self,
        session: &mut Session<T>,
        error: &LineError,
        now_ms: u64,
    ) -> String {
        debug!("Rejected line from {}: {}", session.display_id(), error);
        let message = CommandError::InvalidJson.to_string();
        let text = render_response(&Response::error(message, now_ms));
        reply(session, text)
    }

    /// Decode and run a command without writing anything.
    pub fn execute<T, D>(
        &self,
        session: &mut Session<T>,
        board: &mut Board<D>,
        line: &str,
        now_ms: u64,
    ) -> Result<Reply, CommandError>
    where
        T: Transport,
        D: PeripheralDriver,
    {
        let command = decode_command(line).map_err(|_| CommandError::InvalidJson)?;

        match session.auth_state() {
            AuthState::Pending => self.authenticate(session, &command),
            AuthState::Authenticated => self.dispatch(board, &command, now_ms),
        }
    }

    fn authenticate<T: Transport>(
        &self,
        session: &mut Session<T>,
        command: &Command,
    ) -> Result<Reply, CommandError> {
        if command.kind != CommandKind::Auth {
            return Err(CommandError::AuthenticationRequired);
        }
        if command.arg_str("password") != Some(self.secret.as_str()) {
            return Err(CommandError::InvalidPassword);
        }

        session.authenticate();
        info!("Client {} authenticated", session.display_id());
        Ok(Reply::Message("Authenticated".to_string()))
    }

    fn dispatch<D: PeripheralDriver>(
        &self,
        board: &mut Board<D>,
        command: &Command,
        now_ms: u64,
    ) -> Result<Reply, CommandError> {
        if !board.profile().accepts(command.kind) {
            return Err(CommandError::UnknownCommand);
        }

        match command.kind {
            CommandKind::Auth => Ok(Reply::Message("Already authenticated".to_string())),
            CommandKind::SetOutput => {
                let max = board.output_count();
                let led = command
                    .arg_i64("led")
                    .filter(|n| (1..=max as i64).contains(n))
                    .ok_or(CommandError::InvalidLed { max })?;
                let state = command.arg_bool("state").ok_or(CommandError::InvalidState)?;

                board.set_output((led - 1) as usize, state);
                Ok(Reply::Message(format!("LED {} set to {}", led, on_off(state))))
            }
            CommandKind::SetAllOutputs => {
                let state = command.arg_bool("state").ok_or(CommandError::InvalidState)?;
                board.set_all_outputs(state);
                Ok(Reply::Message(format!("All LEDs set to {}", on_off(state))))
            }
            CommandKind::GetStatus => Ok(Reply::Status(board.snapshot(now_ms))),
            CommandKind::Ping => Ok(Reply::Message("pong".to_string())),
            CommandKind::SetServo => self.set_servo(board, command),
            CommandKind::Unknown => Err(CommandError::UnknownCommand),
        }
    }

    fn set_servo<D: PeripheralDriver>(
        &self,
        board: &mut Board<D>,
        command: &Command,
    ) -> Result<Reply, CommandError> {
        if board.servo_count() == 0 {
            return Err(CommandError::UnknownCommand);
        }

        let angle = command
            .arg_i64("angle")
            .filter(|a| (0..=i64::from(SERVO_MAX_ANGLE)).contains(a));

        if board.profile() == BoardProfile::MultiServo {
            let index = match command.args.get("servo_index") {
                None => Some(0),
                Some(_) => command.arg_i64("servo_index"),
            }
            .filter(|i| (0..board.servo_count() as i64).contains(i));

            let (Some(index), Some(angle)) = (index, angle) else {
                return Err(CommandError::InvalidServo);
            };
            board.set_servo(index as usize, angle as u8);
            info!("Servo {} moved to {} degrees", index, angle);
            return Ok(Reply::Message(format!(
                "Servo {} moved to {} degrees",
                index, angle
            )));
        }

        let angle = angle.ok_or(CommandError::InvalidAngle)?;
        board.set_servo(0, angle as u8);
        info!("Servo moved to {} degrees", angle);
        Ok(Reply::Message(format!("Servo moved to {} degrees", angle)))
    }
}

fn reply<T: Transport>(session: &mut Session<T>, text: String) -> String {
    if let Err(e) = session.send_line(&text) {
        debug!("Response to {} dropped: {}", session.display_id(), e);
    }
    text
}

fn render_response(resp: &Response) -> String {
    encode_response(resp).unwrap_or_else(|e| {
        warn!("Failed to encode response: {}", e);
        format!(
            r#"{{"status":"error","message":"Internal error","timestamp":{}}}"#,
            resp.timestamp
        )
    })
}

/// Serialize a status payload, falling back to an error line.
pub(crate) fn render_status(status: &StatusMessage) -> String {
    encode_status(status).unwrap_or_else(|e| {
        warn!("Failed to encode status: {}", e);
        render_response(&Response::error("Internal error", status.timestamp))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripheral::BoardLayout;
    use crate::session::{SessionTable, SlotId};
    use crate::sim::SimulatedDriver;
    use crate::transport::MemoryTransport;
    use esplink_protocol::{decode_server_message, ResponseStatus, ServerMessage};
    use pretty_assertions::assert_eq;

    const SECRET: &str = "IoTDevice2024";

    struct Fixture {
        table: SessionTable<MemoryTransport>,
        board: Board<SimulatedDriver>,
        dispatcher: Dispatcher,
        wire: MemoryTransport,
    }

    impl Fixture {
        fn new(layout: BoardLayout) -> Self {
            let mut table = SessionTable::new(5);
            let wire = MemoryTransport::new();
            table.accept(wire.clone(), 0).unwrap();
            Self {
                table,
                board: Board::new(SimulatedDriver::new(), layout),
                dispatcher: Dispatcher::new(SECRET),
                wire,
            }
        }

        fn send(&mut self, line: &str) -> Response {
            let session = self.table.find_by_slot_mut(SlotId(0)).unwrap();
            let text = self
                .dispatcher
                .handle_line(session, &mut self.board, line, 1000);
            match decode_server_message(&text).unwrap() {
                ServerMessage::Response(r) => r,
                other => panic!("Expected Response, got {other:?}"),
            }
        }

        fn login(&mut self) {
            let resp = self.send(r#"{"command":"auth","password":"IoTDevice2024"}"#);
            assert!(resp.is_success());
        }

        fn authenticated(&self) -> bool {
            self.table.find_by_slot(SlotId(0)).unwrap().is_authenticated()
        }
    }

    #[test]
    fn test_auth_success() {
        let mut fx = Fixture::new(BoardLayout::led_panel());
        let resp = fx.send(r#"{"command":"auth","password":"IoTDevice2024"}"#);

        assert_eq!(resp, Response::success("Authenticated", 1000));
        assert!(fx.authenticated());
    }

    #[test]
    fn test_auth_wrong_password_keeps_session_open() {
        let mut fx = Fixture::new(BoardLayout::led_panel());
        let resp = fx.send(r#"{"command":"auth","password":"wrong"}"#);

        assert_eq!(resp.status, ResponseStatus::Error);
        assert_eq!(resp.message, "Invalid password");
        assert!(!fx.authenticated());
        assert!(!fx.wire.is_closed());
    }

    #[test]
    fn test_auth_password_must_match_exactly() {
        let mut fx = Fixture::new(BoardLayout::led_panel());
        for line in [
            r#"{"command":"auth","password":"iotdevice2024"}"#,
            r#"{"command":"auth","password":"IoTDevice2024 "}"#,
            r#"{"command":"auth","password":2024}"#,
            r#"{"command":"auth"}"#,
        ] {
            assert_eq!(fx.send(line).message, "Invalid password");
        }
        assert!(!fx.authenticated());
    }

    #[test]
    fn test_commands_require_authentication() {
        let mut fx = Fixture::new(BoardLayout::led_panel());
        for line in [
            r#"{"command":"set_led","led":1,"state":true}"#,
            r#"{"command":"get_status"}"#,
            r#"{"command":"ping"}"#,
            r#"{"command":"bogus"}"#,
            r#"{"led":1}"#,
        ] {
            let resp = fx.send(line);
            assert_eq!(resp.status, ResponseStatus::Error);
            assert_eq!(resp.message, "Authentication required");
        }
        assert!(!fx.authenticated());
        assert!(!fx.board.output_state(0));
    }

    #[test]
    fn test_invalid_json() {
        let mut fx = Fixture::new(BoardLayout::led_panel());
        assert_eq!(fx.send("{not json").message, "Invalid JSON");

        fx.login();
        assert_eq!(fx.send("{\"command\":\"ping\"").message, "Invalid JSON");
    }

    #[test]
    fn test_discarded_line_answers_invalid_json() {
        let mut fx = Fixture::new(BoardLayout::led_panel());
        fx.wire.take_sent();

        let session = fx.table.find_by_slot_mut(SlotId(0)).unwrap();
        for error in [LineError::Overlong { max: 1024 }, LineError::InvalidUtf8] {
            fx.dispatcher.reject_line(session, &error, 1000);
        }

        let expected = encode_response(&Response::error("Invalid JSON", 1000)).unwrap();
        assert_eq!(fx.wire.take_sent(), vec![expected.clone(), expected]);
        assert!(!fx.authenticated());
    }

    #[test]
    fn test_set_led() {
        let mut fx = Fixture::new(BoardLayout::led_panel());
        fx.login();

        let resp = fx.send(r#"{"command":"set_led","led":1,"state":true}"#);
        assert_eq!(resp, Response::success("LED 1 set to ON", 1000));
        assert!(fx.board.output_state(0));

        let resp = fx.send(r#"{"command":"set_output","led":1,"state":false}"#);
        assert_eq!(resp.message, "LED 1 set to OFF");
        assert!(!fx.board.output_state(0));
    }

    #[test]
    fn test_set_led_ids_map_to_outputs() {
        let mut fx = Fixture::new(BoardLayout::led_panel());
        fx.login();

        for id in 1..=5 {
            fx.send(&format!(r#"{{"command":"set_led","led":{id},"state":true}}"#));
            for index in 0..5 {
                assert_eq!(fx.board.output_state(index), index < id);
            }
        }
    }

    #[test]
    fn test_set_led_out_of_range_never_mutates() {
        let mut fx = Fixture::new(BoardLayout::led_panel());
        fx.login();

        for led in ["0", "6", "9", "-1", "\"1\"", "null"] {
            let resp = fx.send(&format!(
                r#"{{"command":"set_led","led":{led},"state":true}}"#
            ));
            assert_eq!(resp.status, ResponseStatus::Error);
            assert_eq!(resp.message, "Invalid LED number (1-5)");
        }
        assert!((0..5).all(|i| !fx.board.output_state(i)));
    }

    #[test]
    fn test_set_led_requires_boolean_state() {
        let mut fx = Fixture::new(BoardLayout::led_panel());
        fx.login();

        let resp = fx.send(r#"{"command":"set_led","led":2,"state":"on"}"#);
        assert_eq!(resp.message, "Invalid state (expected true or false)");
        assert!(!fx.board.output_state(1));
    }

    #[test]
    fn test_set_all_leds() {
        let mut fx = Fixture::new(BoardLayout::led_panel());
        fx.login();

        let resp = fx.send(r#"{"command":"set_all_leds","state":true}"#);
        assert_eq!(resp.message, "All LEDs set to ON");
        assert!((0..5).all(|i| fx.board.output_state(i)));

        let resp = fx.send(r#"{"command":"set_all_outputs","state":false}"#);
        assert_eq!(resp.message, "All LEDs set to OFF");
        assert!((0..5).all(|i| !fx.board.output_state(i)));
    }

    #[test]
    fn test_ping() {
        let mut fx = Fixture::new(BoardLayout::led_panel());
        fx.login();
        assert_eq!(fx.send(r#"{"command":"ping"}"#), Response::success("pong", 1000));
    }

    #[test]
    fn test_unknown_command() {
        let mut fx = Fixture::new(BoardLayout::led_panel());
        fx.login();
        assert_eq!(fx.send(r#"{"command":"reboot"}"#).message, "Unknown command");
        assert_eq!(fx.send(r#"{"state":true}"#).message, "Unknown command");
        // The LED panel firmware has no set_servo handler
        assert_eq!(
            fx.send(r#"{"command":"set_servo","angle":90}"#).message,
            "Unknown command"
        );
    }

    #[test]
    fn test_auth_when_already_authenticated() {
        let mut fx = Fixture::new(BoardLayout::led_panel());
        fx.login();
        let resp = fx.send(r#"{"command":"auth","password":"wrong"}"#);
        assert_eq!(resp, Response::success("Already authenticated", 1000));
        assert!(fx.authenticated());
    }

    #[test]
    fn test_get_status_returns_snapshot() {
        let mut fx = Fixture::new(BoardLayout::led_panel());
        fx.login();
        fx.send(r#"{"command":"set_led","led":3,"state":true}"#);

        let session = fx.table.find_by_slot_mut(SlotId(0)).unwrap();
        let text = fx.dispatcher.handle_line(
            session,
            &mut fx.board,
            r#"{"command":"get_status"}"#,
            2500,
        );
        match decode_server_message(&text).unwrap() {
            ServerMessage::Status(status) => {
                assert_eq!(status.timestamp, 2500);
                assert!(status.leds[2].state);
                assert!(!status.leds[1].state);
            }
            other => panic!("Expected Status, got {other:?}"),
        }
    }

    #[test]
    fn test_single_servo() {
        let mut fx = Fixture::new(BoardLayout::single_servo());
        fx.login();

        let resp = fx.send(r#"{"command":"set_servo","angle":135}"#);
        assert_eq!(resp.message, "Servo moved to 135 degrees");
        assert_eq!(fx.board.servo_angle(0), Some(135));

        for angle in ["181", "-5", "\"90\""] {
            let resp = fx.send(&format!(r#"{{"command":"set_servo","angle":{angle}}}"#));
            assert_eq!(resp.message, "Invalid angle");
        }
        assert_eq!(fx.board.servo_angle(0), Some(135));

        // No LEDs on the arm firmware
        assert_eq!(
            fx.send(r#"{"command":"set_led","led":1,"state":true}"#).message,
            "Unknown command"
        );
    }

    #[test]
    fn test_multi_servo() {
        let mut fx = Fixture::new(BoardLayout::multi_servo());
        fx.login();

        let resp = fx.send(r#"{"command":"set_servo","servo_index":3,"angle":0}"#);
        assert_eq!(resp.message, "Servo 3 moved to 0 degrees");
        assert_eq!(fx.board.servo_angle(3), Some(0));

        // Missing index addresses servo 0
        fx.send(r#"{"command":"set_servo","angle":10}"#);
        assert_eq!(fx.board.servo_angle(0), Some(10));

        for line in [
            r#"{"command":"set_servo","servo_index":4,"angle":90}"#,
            r#"{"command":"set_servo","servo_index":-1,"angle":90}"#,
            r#"{"command":"set_servo","servo_index":"1","angle":90}"#,
            r#"{"command":"set_servo","servo_index":1,"angle":200}"#,
        ] {
            assert_eq!(fx.send(line).message, "Invalid servo index or angle");
        }
        assert_eq!(fx.board.servo_angle(1), Some(90));
    }

    #[test]
    fn test_response_is_written_to_session() {
        let mut fx = Fixture::new(BoardLayout::led_panel());
        fx.send(r#"{"command":"ping"}"#);

        let sent = fx.wire.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("Authentication required"));
    }

    #[test]
    fn test_send_challenge() {
        let mut fx = Fixture::new(BoardLayout::led_panel());
        let session = fx.table.find_by_slot_mut(SlotId(0)).unwrap();
        fx.dispatcher.send_challenge(session, 0);

        let sent = fx.wire.sent();
        match decode_server_message(&sent[0]).unwrap() {
            ServerMessage::Response(r) => assert_eq!(r.status, ResponseStatus::AuthRequired),
            other => panic!("Expected Response, got {other:?}"),
        }
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(CommandError::InvalidJson.category(), ErrorCategory::Protocol);
        assert_eq!(CommandError::InvalidPassword.category(), ErrorCategory::Auth);
        assert_eq!(
            CommandError::InvalidLed { max: 5 }.category(),
            ErrorCategory::Validation
        );
    }
}
