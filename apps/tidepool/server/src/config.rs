use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::{Parser, ValueEnum};
use tidepool_core::{RelayConfig, SessionConfig, TrackKind};

pub use tidepool_core::engine::DEFAULT_ICE_SERVER;

/// Which WebSocket surfaces the server exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServerMode {
    /// Opaque relay between clients of a room.
    Relay,
    /// The server answers offers itself and loops media back.
    Media,
    All,
}

impl ServerMode {
    pub fn serves_relay(self) -> bool {
        matches!(self, ServerMode::Relay | ServerMode::All)
    }

    pub fn serves_media(self) -> bool {
        matches!(self, ServerMode::Media | ServerMode::All)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServerMode::Relay => "relay",
            ServerMode::Media => "media",
            ServerMode::All => "all",
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "tidepool-server",
    author,
    version,
    about = "WebRTC signaling relay and media-terminating negotiation server"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "TIDEPOOL_LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    pub listen_addr: String,

    #[arg(long, env = "TIDEPOOL_MODE", value_enum, default_value_t = ServerMode::All)]
    pub mode: ServerMode,

    /// How long one relay recipient may block delivery before it is dropped.
    #[arg(long, env = "TIDEPOOL_DELIVERY_TIMEOUT_MS", default_value_t = 2000)]
    pub delivery_timeout_ms: u64,

    /// Outbound queue depth per connection.
    #[arg(long, env = "TIDEPOOL_CONNECTION_BUFFER", default_value_t = 64)]
    pub connection_buffer: usize,

    /// STUN/TURN URLs handed to the media engine. Comma separated in the
    /// environment variable.
    #[arg(
        long = "ice-server",
        env = "TIDEPOOL_ICE_SERVERS",
        value_delimiter = ',',
        default_value = DEFAULT_ICE_SERVER
    )]
    pub ice_servers: Vec<String>,

    /// Loop inbound audio back as well as video.
    #[arg(long, env = "TIDEPOOL_LOOPBACK_AUDIO", default_value_t = false)]
    pub loopback_audio: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "TIDEPOOL_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub mode: ServerMode,
    pub relay: RelayConfig,
    pub connection_buffer: usize,
    pub session: SessionConfig,
    pub ice_servers: Vec<String>,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        ensure!(
            cli.delivery_timeout_ms > 0,
            "delivery timeout must be at least 1ms"
        );
        ensure!(
            cli.connection_buffer > 0,
            "connection buffer must hold at least one message"
        );

        let mut loopback_kinds = vec![TrackKind::Video];
        if cli.loopback_audio {
            loopback_kinds.push(TrackKind::Audio);
        }
        let ice_servers = cli
            .ice_servers
            .into_iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();

        Ok(ServerConfig {
            listen_addr,
            mode: cli.mode,
            relay: RelayConfig {
                delivery_timeout: Duration::from_millis(cli.delivery_timeout_ms),
            },
            connection_buffer: cli.connection_buffer,
            session: SessionConfig { loopback_kinds },
            ice_servers,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
