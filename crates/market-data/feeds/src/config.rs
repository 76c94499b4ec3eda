//! Depth feed configuration
//!
//! Loaded from a TOML file layered with `DEPTH_` environment variables,
//! e.g. `DEPTH_CONNECTION__ACCESS_TOKEN` or `DEPTH_TRANSPORT__MAX_SUBSCRIPTIONS`.

use crate::error::FeedError;
use lob::{AnalyzerConfig, StoreConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default twenty-depth endpoint
pub const DEFAULT_DEPTH_URL: &str = "wss://depth-api-feed.dhan.co/twentydepth";

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "DEPTH";

/// Upstream endpoint and credentials
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// WebSocket endpoint
    pub url: String,
    /// Dhan client id
    pub client_id: String,
    /// Dhan access token
    pub access_token: String,
    /// `authType` query parameter
    pub auth_type: u8,
    /// Connect handshake timeout
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DEPTH_URL.to_string(),
            client_id: String::new(),
            access_token: String::new(),
            auth_type: 2,
            connect_timeout_ms: 10_000,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("url", &self.url)
            .field("client_id", &self.client_id)
            .field("access_token", &redact(&self.access_token))
            .field("auth_type", &self.auth_type)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .finish()
    }
}

/// Mask a secret for logs, keeping its length visible
#[must_use]
pub fn redact(secret: &str) -> String {
    if secret.is_empty() {
        "<unset>".to_string()
    } else {
        format!("<redacted:{}>", secret.len())
    }
}

/// Ingest, pairing and reconnection tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Hard cap on concurrent subscriptions
    pub max_subscriptions: usize,
    /// Window for matching a bid packet with its ask packet
    pub pairing_window_ms: u64,
    /// Minimum gap between deliveries per instrument
    pub throttle_interval_ms: u64,
    /// Malformed frames tolerated inside the error window
    pub error_budget: usize,
    /// Rolling window for the error budget
    pub error_window_secs: u64,
    /// Frames processed per second before dropping
    pub max_frames_per_second: u32,
    /// First reconnect delay
    pub backoff_initial_ms: u64,
    /// Reconnect delay ceiling
    pub backoff_max_ms: u64,
    /// Relative jitter applied to each delay
    pub backoff_jitter: f64,
    /// Period of pairing expiry and throttle flushes
    pub maintenance_interval_ms: u64,
    /// Period of the metrics log line
    pub metrics_interval_secs: u64,
    /// Pending subscribe/unsubscribe commands
    pub command_queue: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_subscriptions: 50,
            pairing_window_ms: 1_000,
            throttle_interval_ms: 100,
            error_budget: 10,
            error_window_secs: 300,
            max_frames_per_second: 1_000,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            backoff_jitter: 0.1,
            maintenance_interval_ms: 50,
            metrics_interval_secs: 30,
            command_queue: 64,
        }
    }
}

impl TransportConfig {
    /// Pairing window
    #[must_use]
    pub const fn pairing_window(&self) -> Duration {
        Duration::from_millis(self.pairing_window_ms)
    }

    /// Throttle interval
    #[must_use]
    pub const fn throttle_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_interval_ms)
    }

    /// Error budget window
    #[must_use]
    pub const fn error_window(&self) -> Duration {
        Duration::from_secs(self.error_window_secs)
    }

    /// Maintenance tick period
    #[must_use]
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

/// Full feed configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthFeedConfig {
    /// Endpoint and credentials
    pub connection: ConnectionConfig,
    /// Transport tuning
    pub transport: TransportConfig,
    /// Depth store sizing
    pub store: StoreConfig,
    /// Analyzer tuning
    pub analyzer: AnalyzerConfig,
}

impl DepthFeedConfig {
    /// Load from a file, then apply `DEPTH_` environment overrides
    ///
    /// # Errors
    /// Unreadable files, bad values, or a failed [`Self::validate`]
    pub fn from_file(path: &str) -> Result<Self, FeedError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(environment())
            .build()?;
        let cfg: Self = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults with `DEPTH_` environment overrides only
    ///
    /// # Errors
    /// Bad values or a failed [`Self::validate`]
    pub fn from_env() -> Result<Self, FeedError> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(environment())
            .build()?;
        let cfg: Self = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject zero capacities and windows
    ///
    /// # Errors
    /// [`FeedError::Config`] naming the offending field
    pub fn validate(&self) -> Result<(), FeedError> {
        let t = &self.transport;
        let checks: [(&str, bool); 10] = [
            ("transport.max_subscriptions", t.max_subscriptions > 0),
            ("transport.pairing_window_ms", t.pairing_window_ms > 0),
            ("transport.error_window_secs", t.error_window_secs > 0),
            ("transport.max_frames_per_second", t.max_frames_per_second > 0),
            ("transport.backoff_initial_ms", t.backoff_initial_ms > 0),
            (
                "transport.backoff_max_ms",
                t.backoff_max_ms >= t.backoff_initial_ms,
            ),
            ("transport.maintenance_interval_ms", t.maintenance_interval_ms > 0),
            ("transport.command_queue", t.command_queue > 0),
            ("store.history_capacity", self.store.history_capacity > 0),
            ("store.watcher_queue", self.store.watcher_queue > 0),
        ];
        if let Some((field, _)) = checks.iter().find(|(_, ok)| !ok) {
            return Err(FeedError::Config(format!("{field} is out of range")));
        }
        if !(0.0..1.0).contains(&t.backoff_jitter) {
            return Err(FeedError::Config(
                "transport.backoff_jitter must be in [0, 1)".to_string(),
            ));
        }
        if self.connection.url.is_empty() {
            return Err(FeedError::Config("connection.url is empty".to_string()));
        }
        Ok(())
    }

    /// Check if credentials are present
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.connection.client_id.is_empty() && !self.connection.access_token.is_empty()
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = DepthFeedConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.transport.max_subscriptions, 50);
        assert_eq!(cfg.transport.pairing_window(), Duration::from_secs(1));
        assert_eq!(cfg.store.history_capacity, 100);
        assert!(!cfg.has_credentials());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut cfg = DepthFeedConfig::default();
        cfg.transport.max_subscriptions = 0;
        assert!(matches!(cfg.validate(), Err(FeedError::Config(msg)) if msg.contains("max_subscriptions")));

        let mut cfg = DepthFeedConfig::default();
        cfg.transport.backoff_jitter = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                "[transport]\nmax_subscriptions = 10\n[connection]\nclient_id = \"1000\"\n",
                config::FileFormat::Toml,
            ))
            .build()?;
        let cfg: DepthFeedConfig = settings.try_deserialize()?;
        assert_eq!(cfg.transport.max_subscriptions, 10);
        assert_eq!(cfg.transport.throttle_interval_ms, 100);
        assert_eq!(cfg.connection.client_id, "1000");
        assert_eq!(cfg.connection.url, DEFAULT_DEPTH_URL);
        Ok(())
    }

    #[test]
    fn test_debug_redacts_token() {
        let mut cfg = ConnectionConfig::default();
        cfg.access_token = "secret-token".to_string();
        let shown = format!("{cfg:?}");
        assert!(!shown.contains("secret-token"));
        assert!(shown.contains("<redacted:12>"));
    }
}
