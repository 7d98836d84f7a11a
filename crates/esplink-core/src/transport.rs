//! In-memory [`Transport`] for exercising the session core without sockets.
//!
//! Clones share state, so a test can keep a handle to a transport after
//! handing it to the session table.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use esplink_protocol::{InboundLine, LineError};

use crate::session::{Transport, TransportError};

#[derive(Debug, Default)]
struct Inner {
    inbound: VecDeque<InboundLine>,
    sent: Vec<String>,
    disconnected: bool,
    closed: bool,
    fail_writes: bool,
}

/// Shared-state loopback transport.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means another test thread panicked.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a line as if the peer had sent it.
    pub fn push_inbound(&self, line: impl Into<String>) {
        self.lock().inbound.push_back(Ok(line.into()));
    }

    /// Queue a line the framer had to discard.
    pub fn push_rejected(&self, error: LineError) {
        self.lock().inbound.push_back(Err(error));
    }

    /// Lines written so far, without terminators.
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// Drain the lines written so far.
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut self.lock().sent)
    }

    /// Simulate the peer going away.
    pub fn disconnect(&self) {
        self.lock().disconnected = true;
    }

    /// Make subsequent writes fail with backpressure.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl Transport for MemoryTransport {
    fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if inner.closed || inner.disconnected {
            return Err(TransportError::Closed);
        }
        if inner.fail_writes {
            return Err(TransportError::Backpressure);
        }
        inner.sent.push(line.to_string());
        Ok(())
    }

    fn poll_line(&mut self) -> Option<InboundLine> {
        self.lock().inbound.pop_front()
    }

    fn is_connected(&self) -> bool {
        let inner = self.lock();
        !inner.disconnected && !inner.closed
    }

    fn close(&mut self) {
        self.lock().closed = true;
    }
}
