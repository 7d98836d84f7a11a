//! TCP implementation of the core [`Transport`] trait.
//!
//! Architecture:
//! - A reader task reassembles lines with [`LineBuffer`] and forwards them
//!   on a bounded `mpsc` inbox. Lines it had to discard are forwarded as
//!   errors so the control loop can still answer them. When the inbox is full the reader stops
//!   reading, so a flooding peer is throttled by TCP itself.
//! - A writer task drains a bounded outbox. `send_line` never blocks; a
//!   full outbox drops the line and reports backpressure.
//! - `close` drops the outbox sender. The writer flushes what is queued,
//!   then shuts the socket down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use esplink_core::{Transport, TransportError};
use esplink_protocol::{InboundLine, LineBuffer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

/// Lines buffered between the reader task and the control loop.
const INBOX_CAPACITY: usize = 16;

/// Default number of lines queued for the writer task.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 64;

const READ_CHUNK: usize = 512;

/// A connected TCP peer.
#[derive(Debug)]
pub struct TcpTransport {
    peer: SocketAddr,
    inbox: mpsc::Receiver<InboundLine>,
    outbox: Option<mpsc::Sender<String>>,
    connected: Arc<AtomicBool>,
    reader: AbortHandle,
}

impl TcpTransport {
    /// Split `stream` and spawn its reader and writer tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(stream: TcpStream, peer: SocketAddr, outbox_capacity: usize) -> Self {
        let (read_half, write_half) = stream.into_split();
        let connected = Arc::new(AtomicBool::new(true));
        let (inbox_tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (outbox, outbox_rx) = mpsc::channel(outbox_capacity.max(1));

        let reader = tokio::spawn(read_loop(read_half, inbox_tx, connected.clone(), peer));
        tokio::spawn(write_loop(write_half, outbox_rx, connected.clone(), peer));

        Self {
            peer,
            inbox,
            outbox: Some(outbox),
            connected,
            reader: reader.abort_handle(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    inbox: mpsc::Sender<InboundLine>,
    connected: Arc<AtomicBool>,
    peer: SocketAddr,
) {
    let mut lines = LineBuffer::default();
    let mut buf = [0u8; READ_CHUNK];

    'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("{} closed the connection", peer);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("Read error from {}: {}", peer, e);
                break;
            }
        };

        for line in lines.push(&buf[..n]) {
            match &line {
                Ok(text) => trace!("{} -> {}", peer, text),
                Err(e) => warn!("Discarded line from {}: {}", peer, e),
            }
            if inbox.send(line).await.is_err() {
                break 'read;
            }
        }
    }

    connected.store(false, Ordering::Release);
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<String>,
    connected: Arc<AtomicBool>,
    peer: SocketAddr,
) {
    while let Some(mut line) = outbox.recv().await {
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!("Write error to {}: {}", peer, e);
            connected.store(false, Ordering::Release);
            return;
        }
    }

    // Outbox closed: the session was closed by the server.
    let _ = writer.shutdown().await;
}

impl Transport for TcpTransport {
    fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        let outbox = self.outbox.as_ref().ok_or(TransportError::Closed)?;
        match outbox.try_send(line.to_string()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::Backpressure),
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    fn poll_line(&mut self) -> Option<InboundLine> {
        self.inbox.try_recv().ok()
    }

    fn is_connected(&self) -> bool {
        self.outbox.is_some() && self.connected.load(Ordering::Acquire)
    }

    fn close(&mut self) {
        self.outbox.take();
        self.reader.abort();
        self.connected.store(false, Ordering::Release);
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
