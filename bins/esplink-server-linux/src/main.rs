use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use esplink_core::{BoardLayout, BoardProfile, ConfigStorage, DeviceSettings, FileConfigStorage};
use esplink_server::{DeviceServer, ServerConfig, SimulatedDriver};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Profile {
    LedPanel,
    SingleServo,
    MultiServo,
}

impl From<Profile> for BoardProfile {
    fn from(profile: Profile) -> Self {
        match profile {
            Profile::LedPanel => BoardProfile::LedPanel,
            Profile::SingleServo => BoardProfile::SingleServo,
            Profile::MultiServo => BoardProfile::MultiServo,
        }
    }
}

/// esplink device server running on a simulated board.
#[derive(Debug, Parser)]
#[command(name = "esplink-server", version)]
struct Cli {
    /// JSON settings file. Missing files fall back to the defaults.
    #[arg(long, env = "ESPLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0", env = "ESPLINK_BIND")]
    bind: IpAddr,

    /// Port to listen on (overrides the settings file).
    #[arg(long, env = "ESPLINK_PORT")]
    port: Option<u16>,

    /// Firmware variant to emulate (overrides the settings file).
    #[arg(long, value_enum, env = "ESPLINK_PROFILE")]
    profile: Option<Profile>,

    /// Shared secret (overrides the settings file).
    #[arg(long, env = "ESPLINK_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// ADC counts the simulated potentiometer moves per sample. 0 holds it
    /// still.
    #[arg(long, default_value_t = 20)]
    sweep_step: u16,

    /// Write the effective settings back to --config before starting.
    #[arg(long, requires = "config")]
    save_config: bool,
}

impl Cli {
    fn load_settings(&self) -> anyhow::Result<DeviceSettings> {
        let mut settings = match &self.config {
            Some(path) => FileConfigStorage::new(path)
                .load_or_default()
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => DeviceSettings::default(),
        };

        if let Some(profile) = self.profile {
            settings.board = BoardLayout::for_profile(profile.into());
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(secret) = &self.secret {
            settings.secret = secret.clone();
        }
        settings.validate().context("invalid settings")?;

        if self.save_config {
            if let Some(path) = &self.config {
                FileConfigStorage::new(path)
                    .save_settings(&settings)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                tracing::info!("Settings written to {}", path.display());
            }
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,esplink_server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = cli.load_settings()?;

    let config = ServerConfig {
        bind_addr: SocketAddr::new(cli.bind, settings.port),
        ..ServerConfig::from_settings(&settings)
    };

    let driver = if cli.sweep_step > 0 {
        SimulatedDriver::new().with_sweep(cli.sweep_step)
    } else {
        SimulatedDriver::new()
    };

    tracing::info!("esplink server starting...");
    let server = DeviceServer::bind(config, &settings, driver).await?;
    let addr = server.local_addr()?;

    tracing::info!("Device ready on {}", addr);
    tracing::info!("Try:");
    tracing::info!("   esplink-ctl --host 127.0.0.1:{} status", addr.port());
    tracing::info!(
        "   printf '{{\"command\":\"auth\",\"password\":\"...\"}}\\n' | nc 127.0.0.1 {}",
        addr.port()
    );

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        result = server.run() => {
            result?;
            tracing::warn!("Server stopped");
        }
    }

    Ok(())
}
