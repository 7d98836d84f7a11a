use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use esplink_client::{ClientConfig, ClientEvent, DeviceClient};
use esplink_protocol::{Request, Response, StatusMessage};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line client for esplink devices.
#[derive(Debug, Parser)]
#[command(name = "esplink-ctl", version)]
struct Cli {
    /// Device address as host:port.
    #[arg(long, default_value = "192.168.1.100:8080", env = "ESPLINK_HOST")]
    host: String,

    /// Shared secret.
    #[arg(
        long,
        default_value = "IoTDevice2024",
        env = "ESPLINK_PASSWORD",
        hide_env_values = true
    )]
    password: String,

    /// Seconds to wait for the device.
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print one status snapshot as JSON.
    Status,
    /// Check that the device answers.
    Ping,
    /// Switch one LED.
    Led {
        /// LED number (1-5).
        id: u8,
        state: Switch,
    },
    /// Switch every LED.
    AllLeds { state: Switch },
    /// Move a servo.
    Servo {
        /// Angle in degrees (0-180).
        angle: u8,
        /// Servo channel on multi-servo boards.
        #[arg(long)]
        index: Option<u8>,
    },
    /// Print status broadcasts until interrupted.
    Watch,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

impl From<Switch> for bool {
    fn from(switch: Switch) -> Self {
        matches!(switch, Switch::On)
    }
}

impl Command {
    fn request(&self) -> Option<Request> {
        match *self {
            Command::Status => Some(Request::GetStatus),
            Command::Ping => Some(Request::Ping),
            Command::Led { id, state } => Some(Request::SetLed {
                led: id,
                state: state.into(),
            }),
            Command::AllLeds { state } => Some(Request::SetAllLeds {
                state: state.into(),
            }),
            Command::Servo { angle, index } => Some(Request::SetServo {
                angle,
                servo_index: index,
            }),
            Command::Watch => None,
        }
    }
}

enum Reply {
    Response(Response),
    Status(StatusMessage),
}

async fn next_reply(
    events: &mut mpsc::Receiver<ClientEvent>,
    want_status: bool,
) -> anyhow::Result<Reply> {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Response(resp) => return Ok(Reply::Response(resp)),
            ClientEvent::Status(status) if want_status => return Ok(Reply::Status(status)),
            _ => {}
        }
    }
    bail!("connection closed")
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let limit = Duration::from_secs(cli.timeout);

    let (mut client, mut events) = DeviceClient::start(ClientConfig {
        addr: cli.host.clone(),
        password: cli.password.clone(),
        connect_timeout: limit,
        ..Default::default()
    });

    client
        .wait_authenticated(limit)
        .await
        .with_context(|| format!("could not authenticate with {}", cli.host))?;

    // Forget the challenge and the auth reply.
    while events.try_recv().is_ok() {}

    let Some(request) = cli.command.request() else {
        return watch(client, events).await;
    };

    let want_status = matches!(request, Request::GetStatus);
    client.send(request).await?;

    let reply = timeout(limit, next_reply(&mut events, want_status))
        .await
        .context("timed out waiting for a reply")??;

    client.shutdown().await;

    match reply {
        Reply::Status(status) => print_json(&status),
        Reply::Response(resp) if resp.is_error() => bail!("device error: {}", resp.message),
        Reply::Response(resp) => {
            println!("{}", resp.message);
            Ok(())
        }
    }
}

async fn watch(
    client: DeviceClient,
    mut events: mpsc::Receiver<ClientEvent>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(ClientEvent::Status(status)) => {
                    println!("{}", serde_json::to_string(&status)?)
                }
                Some(ClientEvent::Error(message)) => eprintln!("{}", message),
                Some(_) => {}
                None => bail!("connection closed"),
            }
        }
    }
    client.shutdown().await;
    Ok(())
}
