//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults
//!
//! The loaded [`AppConfig`] is passed explicitly to the relay and client
//! runtime; nothing reads it from global state.

use crate::signal::IceServer;
use serde::Deserialize;
use std::time::Duration;

/// Load the configuration from defaults, `config.toml`, and the environment.
pub fn load() -> Result<AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    // Environment variables (HUDDLE__SERVER__PORT, HUDDLE__AUTH__JWT_SECRET, etc.)
    load_with(environment())
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("HUDDLE")
        .separator("__")
        .try_parsing(true)
}

/// Same as [`load`] with an explicit environment source and no `.env` file.
pub fn load_with(env: config::Environment) -> Result<AppConfig, config::ConfigError> {
    let cfg = config::Config::builder()
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8081)?
        .set_default("auth.jwt_secret", "")?
        .set_default("relay.heartbeat_interval_ms", 45_000)?
        .set_default("relay.presence_timeout_secs", 120)? // ~2.5 missed heartbeats
        .set_default("relay.outbound_buffer", 256)?
        .set_default("voice.ring_timeout_secs", 30)?
        .set_default("voice.negotiation_timeout_secs", 15)?
        .set_default("voice.restart_backoff_secs", 2)?
        .set_default("voice.engine_poll_ms", 20)?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        .add_source(env)
        .build()?;

    cfg.try_deserialize()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub relay: RelayConfig,
    pub voice: VoiceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// JWT signing secret (HS256) shared with the authentication service
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Interval clients are told to heartbeat at
    pub heartbeat_interval_ms: u64,
    /// Connections silent for longer than this are unregistered
    pub presence_timeout_secs: u64,
    /// Per-connection outbound queue depth
    pub outbound_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 45_000,
            presence_timeout_secs: 120,
            outbound_buffer: 256,
        }
    }
}

impl RelayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_secs(self.presence_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VoiceConfig {
    /// Bounded wait for the callee to accept or reject
    pub ring_timeout_secs: u64,
    /// Bound on one offer/answer cycle
    pub negotiation_timeout_secs: u64,
    /// Delay before the single connectivity restart
    pub restart_backoff_secs: u64,
    /// How often the client runtime polls media engines
    pub engine_poll_ms: u64,
    /// STUN/TURN servers; public STUN when empty
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 30,
            negotiation_timeout_secs: 15,
            restart_backoff_secs: 2,
            engine_poll_ms: 20,
            ice_servers: Vec::new(),
        }
    }
}

impl VoiceConfig {
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_secs(self.restart_backoff_secs)
    }

    pub fn engine_poll(&self) -> Duration {
        Duration::from_millis(self.engine_poll_ms)
    }

    /// Configured ICE servers, falling back to public STUN.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        if self.ice_servers.is_empty() {
            IceServer::defaults()
        } else {
            self.ice_servers.clone()
        }
    }
}
