//! Client sessions and the fixed-capacity session table.
//!
//! The table is a slot arena: `Vec<Option<Session<T>>>` with a linear scan
//! for free slots. A slot is either empty or holds exactly one live session,
//! and a session exclusively owns its transport.

use std::fmt;

use esplink_protocol::{InboundLine, SERVER_FULL_LINE};
use thiserror::Error;
use tracing::{debug, info};

/// Errors reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer closed the connection or it was reset.
    #[error("transport closed")]
    Closed,
    /// The outbound queue is full; the line was dropped.
    #[error("transport backed up, line dropped")]
    Backpressure,
}

/// Returned by [`SessionTable::accept`] when every slot is taken.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("server full ({capacity} sessions)")]
pub struct CapacityError {
    pub capacity: usize,
}

/// Non-blocking, line-oriented connection endpoint.
pub trait Transport {
    /// Queue one line for sending. A terminating `\n` is appended.
    fn send_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Take the next received line, if one is ready. Lines the framer
    /// discarded are still reported, as errors.
    fn poll_line(&mut self) -> Option<InboundLine>;

    /// Whether the peer is still connected.
    fn is_connected(&self) -> bool;

    /// Close the connection. Lines already queued are still flushed.
    fn close(&mut self);
}

/// Stable index of a session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authentication state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Pending,
    Authenticated,
}

/// One connected client.
#[derive(Debug)]
pub struct Session<T> {
    slot: SlotId,
    transport: T,
    auth: AuthState,
    last_activity_ms: u64,
    display_id: String,
}

impl<T: Transport> Session<T> {
    fn new(slot: SlotId, transport: T, now_ms: u64) -> Self {
        Self {
            slot,
            transport,
            auth: AuthState::Pending,
            last_activity_ms: now_ms,
            display_id: format!("Client_{}", slot.0 + 1),
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn display_id(&self) -> &str {
        &self.display_id
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth == AuthState::Authenticated
    }

    /// Mark the session authenticated. There is no way back to `Pending`.
    pub fn authenticate(&mut self) {
        self.auth = AuthState::Authenticated;
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms
    }

    /// Record activity (any non-empty received line).
    pub fn touch(&mut self, now_ms: u64) {
        self.last_activity_ms = self.last_activity_ms.max(now_ms);
    }

    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_activity_ms)
    }

    pub fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.transport.send_line(line)
    }

    pub fn poll_line(&mut self) -> Option<InboundLine> {
        self.transport.poll_line()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn close(&mut self) {
        self.transport.close();
    }
}

/// Fixed-capacity table of client sessions.
pub struct SessionTable<T> {
    slots: Vec<Option<Session<T>>>,
}

impl<T: Transport> SessionTable<T> {
    /// Create an empty table with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Place `transport` in the first free slot.
    ///
    /// When the table is full the fixed "Server full" line is written, the
    /// transport is closed and no session is created.
    pub fn accept(&mut self, mut transport: T, now_ms: u64) -> Result<SlotId, CapacityError> {
        let Some(index) = self.slots.iter().position(Option::is_none) else {
            let _ = transport.send_line(SERVER_FULL_LINE);
            transport.close();
            info!("Connection rejected: Server full");
            return Err(CapacityError {
                capacity: self.capacity(),
            });
        };

        let slot = SlotId(index);
        let session = Session::new(slot, transport, now_ms);
        info!(
            "New client connected: {} (Slot {})",
            session.display_id(),
            slot
        );
        self.slots[index] = Some(session);
        Ok(slot)
    }

    pub fn find_by_slot(&self, slot: SlotId) -> Option<&Session<T>> {
        self.slots.get(slot.0).and_then(Option::as_ref)
    }

    pub fn find_by_slot_mut(&mut self, slot: SlotId) -> Option<&mut Session<T>> {
        self.slots.get_mut(slot.0).and_then(Option::as_mut)
    }

    /// Close and remove the session in `slot`. Empty slots are left alone.
    pub fn evict(&mut self, slot: SlotId) -> bool {
        match self.slots.get_mut(slot.0).and_then(Option::take) {
            Some(mut session) => {
                session.close();
                info!("Removing client: {}", session.display_id());
                true
            }
            None => false,
        }
    }

    /// Evict every session that is disconnected or idle for longer than
    /// `timeout_ms`. Returns the freed slots.
    pub fn evict_expired(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<SlotId> {
        let expired: Vec<SlotId> = self
            .iter()
            .filter(|s| !s.is_connected() || s.idle_ms(now_ms) > timeout_ms)
            .map(Session::slot)
            .collect();

        for &slot in &expired {
            if let Some(session) = self.find_by_slot(slot) {
                debug!(
                    "{} expired (connected: {}, idle {} ms)",
                    session.display_id(),
                    session.is_connected(),
                    session.idle_ms(now_ms)
                );
            }
            self.evict(slot);
        }
        expired
    }

    /// Run `f` on every authenticated session, in slot order.
    pub fn for_each_authenticated<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut Session<T>),
    {
        for session in self.iter_mut().filter(|s| s.is_authenticated()) {
            f(session);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session<T>> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session<T>> {
        self.slots.iter_mut().flatten()
    }

    /// Slots currently holding a session.
    pub fn occupied(&self) -> Vec<SlotId> {
        self.iter().map(Session::slot).collect()
    }
}
