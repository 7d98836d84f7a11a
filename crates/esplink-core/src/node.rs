//! The device control loop.
//!
//! [`DeviceNode`] owns the session table, the board, and the periodic timers.
//! It performs no I/O of its own: the caller hands it accepted transports
//! and calls [`DeviceNode::tick`] with the current uptime.

use tracing::info;

use crate::broadcast::{Broadcaster, Every};
use crate::config::DeviceSettings;
use crate::dispatch::Dispatcher;
use crate::peripheral::{Board, PeripheralDriver};
use crate::session::{CapacityError, SessionTable, SlotId, Transport};

/// Summary of one live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub slot: SlotId,
    pub display_id: String,
    pub authenticated: bool,
    pub idle_ms: u64,
}

/// What one call to [`DeviceNode::tick`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Request lines handled.
    pub handled: usize,
    /// Sessions a status broadcast was queued for, if one was due.
    pub broadcast: Option<usize>,
    /// Slots freed by the reaper.
    pub evicted: Vec<SlotId>,
}

pub struct DeviceNode<T, D> {
    table: SessionTable<T>,
    board: Board<D>,
    dispatcher: Dispatcher,
    broadcaster: Broadcaster,
    reaper: Every,
    status_log: Every,
    heartbeat_timeout_ms: u64,
    clock_ms: u64,
}

impl<T: Transport, D: PeripheralDriver> DeviceNode<T, D> {
    /// Create a node whose clock starts at zero.
    pub fn new(settings: &DeviceSettings, driver: D) -> Self {
        Self {
            table: SessionTable::new(settings.max_clients),
            board: Board::new(driver, settings.board.clone()),
            dispatcher: Dispatcher::new(settings.secret.clone()),
            broadcaster: Broadcaster::new(settings.broadcast_interval_ms, 0),
            reaper: Every::new(settings.reap_interval_ms, 0),
            status_log: Every::new(settings.status_log_interval_ms, 0),
            heartbeat_timeout_ms: settings.heartbeat_timeout_ms,
            clock_ms: 0,
        }
    }

    pub fn sessions(&self) -> &SessionTable<T> {
        &self.table
    }

    pub fn board(&self) -> &Board<D> {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut Board<D> {
        &mut self.board
    }

    /// Latest uptime seen by the node.
    pub fn now_ms(&self) -> u64 {
        self.clock_ms
    }

    fn advance(&mut self, now_ms: u64) -> u64 {
        self.clock_ms = self.clock_ms.max(now_ms);
        self.clock_ms
    }

    /// Admit a new connection and send it the authentication challenge.
    ///
    /// A full table answers with "Server full" and closes the transport.
    pub fn accept(&mut self, transport: T, now_ms: u64) -> Result<SlotId, CapacityError> {
        let now = self.advance(now_ms);
        let slot = self.table.accept(transport, now)?;
        if let Some(session) = self.table.find_by_slot_mut(slot) {
            self.dispatcher.send_challenge(session, now);
        }
        Ok(slot)
    }

    /// Run one iteration of the control loop.
    ///
    /// Samples the board, handles at most one pending line per session,
    /// then runs the broadcaster, reaper and status log when they are due.
    pub fn tick(&mut self, now_ms: u64) -> TickReport {
        let now = self.advance(now_ms);
        let mut report = TickReport::default();

        self.board.update(now);

        for session in self.table.iter_mut() {
            match session.poll_line() {
                None => continue,
                Some(Ok(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    session.touch(now);
                    self.dispatcher.handle_line(session, &mut self.board, line, now);
                }
                Some(Err(e)) => {
                    session.touch(now);
                    self.dispatcher.reject_line(session, &e, now);
                }
            }
            report.handled += 1;
        }

        report.broadcast = self.broadcaster.tick(&mut self.table, &mut self.board, now);

        if self.reaper.due(now) {
            report.evicted = self.table.evict_expired(now, self.heartbeat_timeout_ms);
        }

        if self.status_log.due(now) {
            self.log_status(now);
        }

        report
    }

    /// Snapshot of every live session, in slot order.
    pub fn summaries(&self, now_ms: u64) -> Vec<SessionSummary> {
        self.table
            .iter()
            .map(|s| SessionSummary {
                slot: s.slot(),
                display_id: s.display_id().to_string(),
                authenticated: s.is_authenticated(),
                idle_ms: s.idle_ms(now_ms),
            })
            .collect()
    }

    fn log_status(&self, now_ms: u64) {
        info!(
            "Server status: {}/{} clients connected",
            self.table.len(),
            self.table.capacity()
        );
        for summary in self.summaries(now_ms) {
            info!(
                "  Slot {}: {} ({}, last seen {}s ago)",
                summary.slot,
                summary.display_id,
                if summary.authenticated {
                    "authenticated"
                } else {
                    "pending"
                },
                summary.idle_ms / 1000
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripheral::BoardProfile;
    use crate::sim::SimulatedDriver;
    use crate::transport::MemoryTransport;
    use esplink_protocol::{
        decode_server_message, LineError, Response, ResponseStatus, ServerMessage,
        SERVER_FULL_LINE,
    };
    use pretty_assertions::assert_eq;

    const AUTH: &str = r#"{"command":"auth","password":"IoTDevice2024"}"#;

    fn node() -> DeviceNode<MemoryTransport, SimulatedDriver> {
        DeviceNode::new(&DeviceSettings::default(), SimulatedDriver::new())
    }

    fn responses(wire: &MemoryTransport) -> Vec<Response> {
        wire
            .take_sent()
            .iter()
            .filter_map(|line| match decode_server_message(line).unwrap() {
                ServerMessage::Response(r) => Some(r),
                ServerMessage::Status(_) => None,
            })
            .collect()
    }

    fn connect(
        node: &mut DeviceNode<MemoryTransport, SimulatedDriver>,
        now: u64,
    ) -> MemoryTransport {
        let wire = MemoryTransport::new();
        node.accept(wire.clone(), now).unwrap();
        wire
    }

    #[test]
    fn test_accept_sends_challenge() {
        let mut node = node();
        let wire = connect(&mut node, 5);

        let challenge = responses(&wire);
        assert_eq!(challenge, vec![Response::auth_required(5)]);
    }

    #[test]
    fn test_auth_then_set_led() {
        let mut node = node();
        let wire = connect(&mut node, 0);
        wire.take_sent();

        wire.push_inbound(AUTH);
        node.tick(100);
        wire.push_inbound(r#"{"command":"set_led","led":1,"state":true}"#);
        node.tick(200);

        let replies = responses(&wire);
        assert_eq!(replies[0], Response::success("Authenticated", 100));
        assert_eq!(replies[1], Response::success("LED 1 set to ON", 200));
        assert!(node.board_mut().output_state(0));
    }

    #[test]
    fn test_one_line_per_session_per_tick() {
        let mut node = node();
        let wire = connect(&mut node, 0);
        wire.take_sent();

        wire.push_inbound(AUTH);
        wire.push_inbound(r#"{"command":"ping"}"#);

        assert_eq!(node.tick(10).handled, 1);
        assert_eq!(responses(&wire).len(), 1);
        assert_eq!(node.tick(20).handled, 1);
        assert_eq!(responses(&wire), vec![Response::success("pong", 20)]);
    }

    #[test]
    fn test_sixth_connection_rejected() {
        let mut node = node();
        for _ in 0..5 {
            connect(&mut node, 0);
        }

        let sixth = MemoryTransport::new();
        assert!(node.accept(sixth.clone(), 0).is_err());
        assert_eq!(sixth.sent(), vec![SERVER_FULL_LINE.to_string()]);
        assert!(sixth.is_closed());
        assert_eq!(node.sessions().len(), 5);
    }

    #[test]
    fn test_broadcast_only_to_authenticated() {
        let mut node = node();
        let authed = connect(&mut node, 0);
        let pending = connect(&mut node, 0);
        authed.push_inbound(AUTH);
        node.tick(10);
        authed.take_sent();
        pending.take_sent();

        let report = node.tick(1000);
        assert_eq!(report.broadcast, Some(1));

        let sent = authed.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            decode_server_message(&sent[0]).unwrap(),
            ServerMessage::Status(_)
        ));
        assert!(pending.sent().is_empty());
    }

    #[test]
    fn test_idle_session_is_evicted_and_slot_reused() {
        let mut node = node();
        let idle = connect(&mut node, 0);
        let busy = connect(&mut node, 0);

        for t in (1000..=30_000).step_by(1000) {
            busy.push_inbound(r#"{"command":"ping"}"#);
            assert!(node.tick(t).evicted.is_empty());
        }

        busy.push_inbound(r#"{"command":"ping"}"#);
        let report = node.tick(31_000);
        assert_eq!(report.evicted, vec![SlotId(0)]);
        assert!(idle.is_closed());
        assert!(!busy.is_closed());

        let fresh = MemoryTransport::new();
        assert_eq!(node.accept(fresh, 31_500), Ok(SlotId(0)));
    }

    #[test]
    fn test_disconnected_session_is_evicted() {
        let mut node = node();
        let wire = connect(&mut node, 0);
        wire.disconnect();

        assert_eq!(node.tick(1000).evicted, vec![SlotId(0)]);
        assert!(node.sessions().is_empty());
    }

    #[test]
    fn test_blank_lines_do_not_count_as_activity() {
        let mut node = node();
        let wire = connect(&mut node, 0);
        wire.push_inbound("   ");
        let report = node.tick(20_000);

        assert_eq!(report.handled, 0);
        assert_eq!(node.summaries(20_000)[0].idle_ms, 20_000);
    }

    #[test]
    fn test_discarded_line_is_answered_and_counts_as_activity() {
        let mut node = node();
        let wire = connect(&mut node, 0);
        wire.take_sent();

        wire.push_rejected(LineError::Overlong { max: 1024 });
        wire.push_inbound(AUTH);

        assert_eq!(node.tick(20_000).handled, 1);
        assert_eq!(responses(&wire), vec![Response::error("Invalid JSON", 20_000)]);
        assert_eq!(node.summaries(20_000)[0].idle_ms, 0);

        node.tick(20_010);
        assert_eq!(responses(&wire), vec![Response::success("Authenticated", 20_010)]);
    }

    #[test]
    fn test_invalid_password_keeps_session() {
        let mut node = node();
        let wire = connect(&mut node, 0);
        wire.take_sent();

        wire.push_inbound(r#"{"command":"auth","password":"nope"}"#);
        node.tick(10);

        let replies = responses(&wire);
        assert_eq!(replies[0].status, ResponseStatus::Error);
        assert_eq!(replies[0].message, "Invalid password");
        assert_eq!(node.sessions().len(), 1);
        assert!(!wire.is_closed());
    }

    #[test]
    fn test_clock_never_goes_backwards() {
        let mut node = node();
        let wire = connect(&mut node, 0);
        wire.take_sent();

        wire.push_inbound(AUTH);
        node.tick(500);
        wire.push_inbound(r#"{"command":"ping"}"#);
        node.tick(400);

        let replies = responses(&wire);
        assert_eq!(replies[1].timestamp, 500);
        assert_eq!(node.now_ms(), 500);
    }

    #[test]
    fn test_servo_profile_node() {
        let settings = DeviceSettings::for_profile(BoardProfile::SingleServo);
        let mut node: DeviceNode<MemoryTransport, SimulatedDriver> =
            DeviceNode::new(&settings, SimulatedDriver::new());
        let wire = connect(&mut node, 0);
        wire.take_sent();

        wire.push_inbound(AUTH);
        node.tick(1);
        wire.push_inbound(r#"{"command":"set_servo","angle":45}"#);
        node.tick(2);

        assert_eq!(
            responses(&wire)[1],
            Response::success("Servo moved to 45 degrees", 2)
        );
        assert_eq!(node.board().driver().servo(0), Some(45));
    }

    #[test]
    fn test_summaries() {
        let mut node = node();
        let wire = connect(&mut node, 0);
        connect(&mut node, 0);
        wire.push_inbound(AUTH);
        node.tick(3000);

        let summaries = node.summaries(5000);
        assert_eq!(summaries.len(), 2);
        assert_eq!(
            summaries[0],
            SessionSummary {
                slot: SlotId(0),
                display_id: "Client_1".to_string(),
                authenticated: true,
                idle_ms: 2000,
            }
        );
        assert!(!summaries[1].authenticated);
    }
}
