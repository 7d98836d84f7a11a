//! TCP device server.
//!
//! This module runs the control loop that:
//! - Accepts connections (at most one admitted per tick)
//! - Feeds received lines to the session core
//! - Drives the status broadcast, reaper and status log timers

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use esplink_core::config::DEFAULT_PORT;
use esplink_core::{ConfigError, DeviceNode, DeviceSettings, PeripheralDriver};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::transport::{TcpTransport, DEFAULT_OUTBOX_CAPACITY};

/// Connections accepted by the OS but not yet admitted by the control loop.
const ACCEPT_BACKLOG: usize = 32;

/// Errors that stop the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network settings for [`DeviceServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// Control loop period.
    pub poll_interval: Duration,
    /// Lines queued per connection before writes are dropped.
    pub outbox_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            poll_interval: Duration::from_millis(10),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Listen on all interfaces at the port from `settings`.
    pub fn from_settings(settings: &DeviceSettings) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], settings.port)),
            ..Self::default()
        }
    }
}

/// A bound device server.
pub struct DeviceServer<D> {
    config: ServerConfig,
    listener: TcpListener,
    node: DeviceNode<TcpTransport, D>,
    started: Instant,
}

impl<D: PeripheralDriver> DeviceServer<D> {
    /// Validate `settings`, bind the listener and initialise the board.
    pub async fn bind(
        config: ServerConfig,
        settings: &DeviceSettings,
        driver: D,
    ) -> Result<Self, ServerError> {
        settings.validate()?;

        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr,
                source,
            })?;

        Ok(Self {
            node: DeviceNode::new(settings, driver),
            started: Instant::now(),
            listener,
            config,
        })
    }

    /// Actual listening address (useful when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Run the control loop until the future is dropped.
    pub async fn run(mut self) -> Result<(), ServerError> {
        info!(
            "esplink server listening on {} ({:?}, {} slots)",
            self.local_addr()?,
            self.node.board().profile(),
            self.node.sessions().capacity()
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backlog: VecDeque<(TcpStream, SocketAddr)> = VecDeque::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = self.uptime_ms();
                    if let Some((stream, peer)) = backlog.pop_front() {
                        self.admit(stream, peer, now);
                    }
                    self.node.tick(now);
                }
                accepted = self.listener.accept(), if backlog.len() < ACCEPT_BACKLOG => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("Incoming connection from {}", peer);
                            backlog.push_back((stream, peer));
                        }
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr, now_ms: u64) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
        }
        let transport = TcpTransport::spawn(stream, peer, self.config.outbox_capacity);
        match self.node.accept(transport, now_ms) {
            Ok(slot) => info!("Client from {} assigned slot {}", peer, slot),
            Err(e) => debug!("Rejected {}: {}", peer, e),
        }
    }
}
