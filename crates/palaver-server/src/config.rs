//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address the chat server listens on.
    /// Env: `BIND_ADDR`
    /// Default: `0.0.0.0:9999`
    pub bind_addr: SocketAddr,

    /// Filesystem path of the SQLite database (credentials, groups, history).
    /// When unset, the platform data directory is used.
    /// Env: `DATABASE_PATH`
    pub database_path: Option<PathBuf>,

    /// Whether a first-ever login for an unknown username registers it
    /// implicitly. When false, unknown usernames are rejected.
    /// Env: `REGISTRATION_OPEN` (true/false)
    /// Default: `true`
    pub registration_open: bool,

    /// Default number of messages returned by a history query when the
    /// client omits a limit.
    /// Env: `HISTORY_LIMIT`
    /// Default: `50`
    pub history_limit: u32,

    /// Capacity of each connection's outbound queue. A slow client whose
    /// queue fills up starts losing pushes rather than stalling senders.
    /// Env: `OUTBOUND_QUEUE`
    /// Default: `64`
    pub outbound_queue: usize,

    /// Delete history older than this many days. Unset keeps everything.
    /// Env: `HISTORY_RETENTION_DAYS`
    pub history_retention_days: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], 9999).into(),
            database_path: None,
            registration_open: true,
            history_limit: 50,
            outbound_queue: 64,
            history_retention_days: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BIND_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.bind_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid BIND_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = Some(PathBuf::from(path));
        }

        if let Ok(val) = std::env::var("REGISTRATION_OPEN") {
            config.registration_open = val != "false" && val != "0";
        }

        if let Ok(val) = std::env::var("HISTORY_LIMIT") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.history_limit = n,
                _ => tracing::warn!(value = %val, "Invalid HISTORY_LIMIT, using default"),
            }
        }

        if let Ok(val) = std::env::var("OUTBOUND_QUEUE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.outbound_queue = n,
                _ => tracing::warn!(value = %val, "Invalid OUTBOUND_QUEUE, using default"),
            }
        }

        if let Ok(val) = std::env::var("HISTORY_RETENTION_DAYS") {
            match val.parse::<u32>() {
                Ok(0) => config.history_retention_days = None,
                Ok(n) => config.history_retention_days = Some(n),
                _ => tracing::warn!(value = %val, "Invalid HISTORY_RETENTION_DAYS, ignoring"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, ([0, 0, 0, 0], 9999).into());
        assert_eq!(config.history_limit, 50);
        assert!(config.registration_open);
        assert!(config.database_path.is_none());
        assert!(config.history_retention_days.is_none());
    }
}
