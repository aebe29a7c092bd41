//! Relay configuration.
//!
//! All settings come from environment variables with sensible defaults; no
//! configuration file is required to run against a stock Claude Code
//! installation.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

/// Environment variable prefix shared by every setting.
const ENV_PREFIX: &str = "RELAY_";

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 8787;

/// Default capacity of record-bearing mailboxes.
pub const MAILBOX_CAPACITY: usize = 1024;

/// Maximum accepted WebSocket frame size in bytes.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Runtime configuration for the relay.
///
/// Built once at startup via [`RelayConfig::from_env`] and shared read-only
/// with every component.
#[derive(Debug, Clone, Serialize)]
pub struct RelayConfig {
    /// Directory tree containing the agent's session logs.
    pub watch_root: PathBuf,
    /// Host address to bind the HTTP server to.
    pub host: String,
    /// Port for the HTTP server.
    pub port: u16,
    /// Public base URL embedded in enrollment links.
    pub public_url: String,
    /// Lifetime of a QR enrollment token.
    pub enrollment_ttl: Duration,
    /// Lifetime of a device credential.
    pub credential_ttl: Duration,
    /// Interval between server-initiated WebSocket pings.
    pub ping_interval: Duration,
    /// Close a client that has sent no traffic for this long.
    pub idle_cutoff: Duration,
    /// Deadline for a new connection to authenticate.
    pub auth_deadline: Duration,
    /// Close a subscriber whose mailbox stays full for this long.
    pub slow_client_cutoff: Duration,
    /// Use the polling directory backend instead of inotify-style events.
    pub poll_watcher: bool,
    /// Rescan interval for the polling backend (clamped to >= 1 s).
    pub poll_interval: Duration,
    /// A session with no record for this long classifies as idle.
    pub idle_threshold: Duration,
    /// Interval for the auth table sweep and idle re-evaluation timers.
    pub sweep_interval: Duration,
    /// Capacity of the per-session history ring.
    pub history_limit: usize,
    /// Keep buffering live records while a session has no viewer.
    pub buffer_unwatched: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            watch_root: default_watch_root(),
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            public_url: format!("http://127.0.0.1:{DEFAULT_PORT}"),
            enrollment_ttl: Duration::from_secs(30),
            credential_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            ping_interval: Duration::from_secs(30),
            idle_cutoff: Duration::from_secs(60),
            auth_deadline: Duration::from_secs(30),
            slow_client_cutoff: Duration::from_secs(15),
            poll_watcher: false,
            poll_interval: Duration::from_secs(2),
            idle_threshold: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(60),
            history_limit: 200,
            buffer_unwatched: false,
        }
    }
}

/// Default watch root: `~/.claude/projects`.
#[must_use]
pub fn default_watch_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("projects")
}

impl RelayConfig {
    /// Build the configuration from `RELAY_*` environment variables.
    ///
    /// Unset variables fall back to defaults; unparseable values are
    /// rejected rather than silently ignored.
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending variable when a value fails to
    /// parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(root) = read_var("ROOT") {
            config.watch_root = PathBuf::from(root);
        }
        if let Some(host) = read_var("HOST") {
            config.host = host;
        }
        if let Some(port) = read_var("PORT") {
            config.port = parse_var("RELAY_PORT", &port)?;
        }
        config.public_url = match read_var("PUBLIC_URL") {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", config.host, config.port),
        };
        if let Some(secs) = read_var("ENROLLMENT_TTL_SECS") {
            config.enrollment_ttl =
                Duration::from_secs(parse_var("RELAY_ENROLLMENT_TTL_SECS", &secs)?);
        }
        if let Some(secs) = read_var("CREDENTIAL_TTL_SECS") {
            config.credential_ttl =
                Duration::from_secs(parse_var("RELAY_CREDENTIAL_TTL_SECS", &secs)?);
        }
        if let Some(secs) = read_var("PING_INTERVAL_SECS") {
            config.ping_interval =
                Duration::from_secs(parse_var("RELAY_PING_INTERVAL_SECS", &secs)?);
        }
        if let Some(flag) = read_var("POLL_WATCHER") {
            config.poll_watcher = parse_bool("RELAY_POLL_WATCHER", &flag)?;
        }
        if let Some(secs) = read_var("POLL_INTERVAL_SECS") {
            // The polling backend never scans more often than once a second.
            let secs: u64 = parse_var("RELAY_POLL_INTERVAL_SECS", &secs)?;
            config.poll_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = read_var("IDLE_THRESHOLD_SECS") {
            config.idle_threshold =
                Duration::from_secs(parse_var("RELAY_IDLE_THRESHOLD_SECS", &secs)?);
        }
        if let Some(limit) = read_var("HISTORY_LIMIT") {
            config.history_limit = parse_var("RELAY_HISTORY_LIMIT", &limit)?;
        }
        if let Some(flag) = read_var("BUFFER_UNWATCHED") {
            config.buffer_unwatched = parse_bool("RELAY_BUFFER_UNWATCHED", &flag)?;
        }

        Ok(config)
    }

    /// Socket address string the HTTP server binds to.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration errors.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// An environment variable held an unparseable value.
    #[error("Invalid value for {variable}: {value}")]
    InvalidValue {
        /// The environment variable name.
        variable: &'static str,
        /// The rejected value.
        value: String,
    },
}

fn read_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{suffix}"))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(variable: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        variable,
        value: value.to_string(),
    })
}

fn parse_bool(variable: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            variable,
            value: value.to_string(),
        }),
    }
}
