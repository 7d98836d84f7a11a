//! Tokio driver for a [`ClientSession`].
//!
//! Architecture:
//! - One background task owns the TCP stream and the session.
//! - Commands reach the task over an `mpsc` channel and are dropped there
//!   unless the session is authenticated.
//! - Session events are forwarded on a second channel; the connection state
//!   is published on a `watch` channel and the latest status is cached.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use esplink_protocol::{Request, StatusMessage};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::session::{ClientEvent, ClientSession, ClientState};

/// Errors returned by [`DeviceClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The device rejected the session or the connection failed.
    #[error("{0}")]
    Failed(String),

    /// No answer within the allotted time.
    #[error("timed out waiting for the device")]
    Timeout,

    /// The background task has stopped.
    #[error("client is shut down")]
    Closed,
}

/// Configuration for a [`DeviceClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the device.
    pub addr: String,
    /// Shared secret sent in the `auth` command.
    pub password: String,
    /// Pause between connecting and sending `auth`.
    pub auth_delay: Duration,
    /// Ping period while authenticated. Must stay below the device's
    /// heartbeat timeout.
    pub keepalive_interval: Option<Duration>,
    pub connect_timeout: Duration,
    /// Delay before reconnecting after the connection drops. `None`
    /// disables reconnects.
    pub reconnect_interval: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "192.168.1.100:8080".to_string(),
            password: "IoTDevice2024".to_string(),
            auth_delay: Duration::from_millis(500),
            keepalive_interval: Some(Duration::from_secs(25)),
            connect_timeout: Duration::from_secs(5),
            reconnect_interval: None,
        }
    }
}

/// Human-readable description of a socket error.
pub fn friendly_io_error(e: &io::Error) -> String {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => {
            "Connection refused. Make sure the device is running and accessible.".to_string()
        }
        io::ErrorKind::NotFound => "Host not found. Please check the address.".to_string(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
            "Device closed the connection.".to_string()
        }
        io::ErrorKind::TimedOut => "Connection timed out.".to_string(),
        io::ErrorKind::InvalidInput => "Invalid address.".to_string(),
        _ => format!("Network error: {}", e),
    }
}

#[derive(Debug, Default)]
struct Shared {
    latest_status: Option<StatusMessage>,
    last_error: Option<String>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle to a running client task.
pub struct DeviceClient {
    commands: mpsc::Sender<Request>,
    state: watch::Receiver<ClientState>,
    shared: Arc<Mutex<Shared>>,
    task: JoinHandle<()>,
}

impl DeviceClient {
    /// Spawn the client task and start connecting.
    ///
    /// Returns the handle and a receiver for session events. Events are
    /// dropped if the receiver falls behind.
    pub fn start(config: ClientConfig) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (commands, command_rx) = mpsc::channel(32);
        let (events, event_rx) = mpsc::channel(128);
        let (state_tx, state) = watch::channel(ClientState::Disconnected);
        let shared = Arc::new(Mutex::new(Shared::default()));

        let worker = Worker {
            session: ClientSession::new(config.password.clone()),
            config,
            commands: command_rx,
            events,
            state: state_tx,
            shared: shared.clone(),
        };
        let task = tokio::spawn(worker.run());

        (
            Self {
                commands,
                state,
                shared,
                task,
            },
            event_rx,
        )
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ClientState::Authenticated
    }

    /// Last status broadcast or `get_status` reply received.
    pub fn latest_status(&self) -> Option<StatusMessage> {
        lock(&self.shared).latest_status.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared).last_error.clone()
    }

    /// Wait until the session is authenticated.
    ///
    /// Fails as soon as the session enters `Failed`.
    pub async fn wait_authenticated(&mut self, limit: Duration) -> Result<(), ClientError> {
        let deadline = Instant::now() + limit;
        loop {
            let state = *self.state.borrow_and_update();
            match state {
                ClientState::Authenticated => return Ok(()),
                ClientState::Failed => {
                    let message = self.last_error().unwrap_or_else(|| "connection failed".into());
                    return Err(ClientError::Failed(message));
                }
                _ => {}
            }

            match time::timeout_at(deadline, self.state.changed()).await {
                Err(_) => return Err(ClientError::Timeout),
                Ok(Err(_)) => {
                    return Err(self
                        .last_error()
                        .map(ClientError::Failed)
                        .unwrap_or(ClientError::Closed))
                }
                Ok(Ok(())) => {}
            }
        }
    }

    /// Queue a request. It is silently dropped unless authenticated.
    pub async fn send(&self, request: Request) -> Result<(), ClientError> {
        self.commands
            .send(request)
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub async fn set_led(&self, led: u8, state: bool) -> Result<(), ClientError> {
        self.send(Request::SetLed { led, state }).await
    }

    pub async fn set_all_leds(&self, state: bool) -> Result<(), ClientError> {
        self.send(Request::SetAllLeds { state }).await
    }

    pub async fn set_servo(&self, angle: u8) -> Result<(), ClientError> {
        self.send(Request::SetServo {
            angle,
            servo_index: None,
        })
        .await
    }

    pub async fn set_servo_channel(&self, servo_index: u8, angle: u8) -> Result<(), ClientError> {
        self.send(Request::SetServo {
            angle,
            servo_index: Some(servo_index),
        })
        .await
    }

    pub async fn get_status(&self) -> Result<(), ClientError> {
        self.send(Request::GetStatus).await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.send(Request::Ping).await
    }

    /// Close the connection and wait for the task to finish.
    pub async fn shutdown(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        let _ = task.await;
    }
}

/// How a single connection ended.
enum Outcome {
    /// Peer closed or the transport failed.
    Lost,
    /// The device rejected the session.
    Rejected,
    /// The handle was dropped.
    Shutdown,
}

struct Worker {
    config: ClientConfig,
    session: ClientSession,
    commands: mpsc::Receiver<Request>,
    events: mpsc::Sender<ClientEvent>,
    state: watch::Sender<ClientState>,
    shared: Arc<Mutex<Shared>>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let events = self.session.begin_connect();
            self.publish(events);

            let outcome = match time::timeout(
                self.config.connect_timeout,
                TcpStream::connect(self.config.addr.as_str()),
            )
            .await
            {
                Err(_) => {
                    let events = self.session.on_transport_error("Connection timed out.");
                    self.publish(events);
                    Outcome::Lost
                }
                Ok(Err(e)) => {
                    warn!("Could not connect to {}: {}", self.config.addr, e);
                    let events = self.session.on_transport_error(friendly_io_error(&e));
                    self.publish(events);
                    Outcome::Lost
                }
                Ok(Ok(stream)) => {
                    info!("Connected to {}", self.config.addr);
                    self.drive(stream).await
                }
            };

            let retry = match outcome {
                Outcome::Lost => self.config.reconnect_interval,
                Outcome::Rejected | Outcome::Shutdown => None,
            };
            let Some(delay) = retry else {
                break;
            };

            debug!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = time::sleep(delay) => {}
                // Commands are dropped while disconnected; a closed channel
                // means the handle is gone.
                cmd = self.commands.recv() => {
                    if cmd.is_none() {
                        break;
                    }
                }
            }
        }
    }

    fn publish(&self, events: Vec<ClientEvent>) {
        for event in events {
            match &event {
                ClientEvent::StateChanged(state) => {
                    self.state.send_replace(*state);
                }
                ClientEvent::Status(status) => {
                    lock(&self.shared).latest_status = Some(status.clone());
                }
                ClientEvent::Error(message) => {
                    lock(&self.shared).last_error = Some(message.clone());
                }
                ClientEvent::Response(_) => {}
            }
            if self.events.try_send(event).is_err() {
                trace!("Event receiver is full or gone; event dropped");
            }
        }
    }

    async fn drive(&mut self, stream: TcpStream) -> Outcome {
        let (mut reader, mut writer) = stream.into_split();
        let events = self.session.on_connected();
        self.publish(events);

        let auth_timer = time::sleep(self.config.auth_delay);
        tokio::pin!(auth_timer);
        let mut auth_pending = true;

        let period = self
            .config
            .keepalive_interval
            .unwrap_or(Duration::from_secs(3600))
            .max(Duration::from_millis(1));
        let mut keepalive = time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut buf = [0u8; 1024];

        loop {
            tokio::select! {
                _ = &mut auth_timer, if auth_pending => {
                    auth_pending = false;
                    if let Some(line) = self.session.auth_request() {
                        debug!("Sending authentication");
                        if let Err(e) = write_line(&mut writer, &line).await {
                            return self.lost(e);
                        }
                    }
                }
                read = reader.read(&mut buf) => {
                    match read {
                        Ok(0) => {
                            info!("Device closed the connection");
                            let events = self.session.on_disconnected();
                            self.publish(events);
                            return Outcome::Lost;
                        }
                        Ok(n) => {
                            let events = self.session.on_bytes(&buf[..n]);
                            self.publish(events);
                            if self.session.take_close_request() {
                                let _ = writer.shutdown().await;
                                let events = self.session.on_disconnected();
                                self.publish(events);
                                return Outcome::Rejected;
                            }
                        }
                        Err(e) => return self.lost(e),
                    }
                }
                _ = keepalive.tick(), if self.config.keepalive_interval.is_some() => {
                    if let Some(line) = self.session.command(&Request::Ping) {
                        trace!("Sending keep-alive ping");
                        if let Err(e) = write_line(&mut writer, &line).await {
                            return self.lost(e);
                        }
                    }
                }
                cmd = self.commands.recv() => {
                    let Some(request) = cmd else {
                        let _ = writer.shutdown().await;
                        let events = self.session.on_disconnected();
                        self.publish(events);
                        return Outcome::Shutdown;
                    };
                    if let Some(line) = self.session.command(&request) {
                        if let Err(e) = write_line(&mut writer, &line).await {
                            return self.lost(e);
                        }
                    }
                }
            }
        }
    }

    fn lost(&mut self, e: io::Error) -> Outcome {
        warn!("Connection lost: {}", e);
        let events = self.session.on_transport_error(friendly_io_error(&e));
        self.publish(events);
        Outcome::Lost
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> io::Result<()> {
    let mut bytes = Vec::with_capacity(line.len() + 1);
    bytes.extend_from_slice(line.as_bytes());
    bytes.push(b'\n');
    writer.write_all(&bytes).await
}
