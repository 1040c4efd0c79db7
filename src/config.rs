//! Hub configuration parsed from environment variables.
//!
//! Everything except `DATABASE_URL` has a default so a bare `cargo run`
//! against a local Postgres works. `NATS_SERVER_URL` selects the backplane:
//! unset keeps fanout inside this process.

use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_PONG_WAIT_SECS: u64 = 60;
pub const DEFAULT_WRITE_WAIT_SECS: u64 = 10;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 512;
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Per-connection timing and sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// How long a fresh connection may stay unjoined.
    pub join_timeout: Duration,
    /// Read deadline, refreshed by every inbound frame and pong.
    pub pong_wait: Duration,
    /// Deadline for each outbound write.
    pub write_wait: Duration,
    /// Largest inbound websocket message accepted.
    pub max_message_bytes: usize,
    /// Capacity of the per-client outbound queue.
    pub outbound_capacity: usize,
}

impl ConnectionLimits {
    /// Keep-alive ping interval. Always shorter than `pong_wait`.
    #[must_use]
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(DEFAULT_JOIN_TIMEOUT_SECS),
            pong_wait: Duration::from_secs(DEFAULT_PONG_WAIT_SECS),
            write_wait: Duration::from_secs(DEFAULT_WRITE_WAIT_SECS),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    pub port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    pub nats_url: Option<String>,
    pub limits: ConnectionLimits,
}

impl HubConfig {
    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `DATABASE_URL`
    ///
    /// Optional:
    /// - `PORT` (3000), `DB_MAX_CONNECTIONS` (5), `NATS_SERVER_URL`
    /// - `WS_JOIN_TIMEOUT_SECS` (10), `WS_PONG_WAIT_SECS` (60),
    ///   `WS_WRITE_WAIT_SECS` (10), `WS_MAX_MESSAGE_BYTES` (512),
    ///   `WS_OUTBOUND_CAPACITY` (256)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `DATABASE_URL` is absent or any value
    /// fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;
        let nats_url = std::env::var("NATS_SERVER_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let pong_wait_secs: u64 = env_parse("WS_PONG_WAIT_SECS", DEFAULT_PONG_WAIT_SECS)?;
        if pong_wait_secs == 0 {
            return Err(ConfigError::Invalid { var: "WS_PONG_WAIT_SECS", value: "0".into() });
        }
        let outbound_capacity: usize = env_parse("WS_OUTBOUND_CAPACITY", DEFAULT_OUTBOUND_CAPACITY)?;
        if outbound_capacity == 0 {
            return Err(ConfigError::Invalid { var: "WS_OUTBOUND_CAPACITY", value: "0".into() });
        }

        let limits = ConnectionLimits {
            join_timeout: Duration::from_secs(env_parse("WS_JOIN_TIMEOUT_SECS", DEFAULT_JOIN_TIMEOUT_SECS)?),
            pong_wait: Duration::from_secs(pong_wait_secs),
            write_wait: Duration::from_secs(env_parse("WS_WRITE_WAIT_SECS", DEFAULT_WRITE_WAIT_SECS)?),
            max_message_bytes: env_parse("WS_MAX_MESSAGE_BYTES", DEFAULT_MAX_MESSAGE_BYTES)?,
            outbound_capacity,
        };

        Ok(Self {
            port: env_parse("PORT", DEFAULT_PORT)?,
            database_url,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?,
            nats_url,
            limits,
        })
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
