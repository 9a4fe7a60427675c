//! Configuration management for the NVR tunnel
//!
//! Values are layered: built-in defaults, then an optional config file, then
//! `NVR_TUNNEL__*` environment variables (a `.env` file is honoured).
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Number of relay servers a deployment is expected to configure
pub const MIN_RELAY_SERVERS: usize = 2;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Loading or deserializing failed
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// A value is present but unusable
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One relay (TURN) server entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayServerConfig {
    /// Domain name or literal IP
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl RelayServerConfig {
    /// Parse a `host:port` entry
    pub fn parse(entry: &str) -> Result<Self, ConfigError> {
        let entry = entry.trim();
        let (host, port) = entry
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::Invalid(format!("relay server '{}' has no port", entry)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| ConfigError::Invalid(format!("relay server '{}' has a bad port", entry)))?;
        if host.is_empty() {
            return Err(ConfigError::Invalid(format!("relay server '{}' has no host", entry)));
        }
        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
        })
    }
}

/// Relay fallback settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay servers as `host:port`, tried in order
    pub servers: Vec<String>,
    /// Long-term credential username
    pub username: String,
    /// Long-term credential password
    pub password: String,
    /// Value of the SOFTWARE attribute
    pub software: String,
    /// How many challenges may be answered per request
    pub auth_retry_max: u32,
    /// Timeout for one request/response exchange
    pub step_timeout_ms: u64,
    /// Timeout for opening a TCP connection to a relay server
    pub connect_timeout_ms: u64,
    /// Allocation lifetime asked for in Allocate/Refresh
    pub requested_lifetime_secs: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            username: String::new(),
            password: String::new(),
            software: format!("nvr-tunnel {}", env!("CARGO_PKG_VERSION")),
            auth_retry_max: 2,
            step_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            requested_lifetime_secs: 600,
        }
    }
}

impl RelayConfig {
    /// Parsed relay server list, in configured order
    pub fn server_list(&self) -> Result<Vec<RelayServerConfig>, ConfigError> {
        self.servers.iter().map(|s| RelayServerConfig::parse(s)).collect()
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Per-client timer settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Worker tick resolution
    pub tick_ms: u64,
    /// Interval between hole-punch checks while waiting for Handshake-Req
    pub handshake_resend_ms: u64,
    /// Number of hole-punch checks before the handshake fails
    pub handshake_max_retries: u32,
    /// Wait for Handshake-Ack after replying Handshake-Resp
    pub ack_wait_ms: u64,
    /// Wait for the login request
    pub login_wait_ms: u64,
    /// Wait between Heartbeat-Req messages
    pub heartbeat_wait_ms: u64,
    /// Interval between Heartbeat-Resp send retries
    pub heartbeat_resend_ms: u64,
    /// Heartbeat-Resp send retries before counting a missed beat
    pub heartbeat_resend_max: u32,
    /// Interval between Hold-Resp keep-alives
    pub hold_ack_interval_ms: u64,
    /// Hold-Resp keep-alives before the hold times out
    pub hold_ack_max: u32,
    /// Inbound frames dispatched per wake-up
    pub max_frames_per_tick: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            handshake_resend_ms: 500,
            handshake_max_retries: 20,
            ack_wait_ms: 5_000,
            login_wait_ms: 10_000,
            heartbeat_wait_ms: 30_000,
            heartbeat_resend_ms: 200,
            heartbeat_resend_max: 3,
            hold_ack_interval_ms: 5_000,
            hold_ack_max: 120,
            max_frames_per_tick: 16,
        }
    }
}

impl TimerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn handshake_resend(&self) -> Duration {
        Duration::from_millis(self.handshake_resend_ms)
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }

    pub fn login_wait(&self) -> Duration {
        Duration::from_millis(self.login_wait_ms)
    }

    pub fn heartbeat_wait(&self) -> Duration {
        Duration::from_millis(self.heartbeat_wait_ms)
    }

    pub fn heartbeat_resend(&self) -> Duration {
        Duration::from_millis(self.heartbeat_resend_ms)
    }

    pub fn hold_ack_interval(&self) -> Duration {
        Duration::from_millis(self.hold_ack_interval_ms)
    }
}

/// Tunnel configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Device identifier carried in every session payload
    pub device_id: String,
    /// Persistent seed for session id derivation
    pub session_seed: String,
    /// Size of the client slot pool
    pub max_clients: usize,
    /// Size of each client's message id table
    pub msg_id_slots: usize,
    pub log_level: Option<String>,
    pub relay: RelayConfig,
    pub timers: TimerConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            session_seed: String::new(),
            max_clients: 4,
            msg_id_slots: 32,
            log_level: None,
            relay: RelayConfig::default(),
            timers: TimerConfig::default(),
        }
    }
}

impl TunnelConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("NVR_TUNNEL")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("relay.servers")
                .try_parsing(true),
        );

        let config: TunnelConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the environment only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Reject values the tunnel cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.is_empty() {
            return Err(ConfigError::Invalid("device_id is empty".to_string()));
        }
        if self.device_id.len() > 32 {
            return Err(ConfigError::Invalid("device_id is longer than 32 bytes".to_string()));
        }
        if self.session_seed.is_empty() {
            return Err(ConfigError::Invalid("session_seed is empty".to_string()));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be at least 1".to_string()));
        }
        if self.msg_id_slots == 0 {
            return Err(ConfigError::Invalid("msg_id_slots must be at least 1".to_string()));
        }
        if self.timers.tick_ms == 0 {
            return Err(ConfigError::Invalid("timers.tick_ms must be non-zero".to_string()));
        }
        if self.timers.max_frames_per_tick == 0 {
            return Err(ConfigError::Invalid(
                "timers.max_frames_per_tick must be at least 1".to_string(),
            ));
        }
        self.relay.server_list()?;
        Ok(())
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}
