//! Client configuration.
//!
//! Every knob has a default matching the backend's expectations, so
//! `ClientConfig::default().with_base_url(..)` is enough for most callers.
//! Durations are read from milliseconds when deserialized.

use crate::error::{Error, Result};
use crate::ws::connection::ReconnectPolicy;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Path of the conversation monitor socket, relative to the base URL.
pub const DEFAULT_MONITOR_PATH: &str = "/ws/conversations/monitor/";

/// Keep-alive ping interval while the connection is open.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// First step of the reconnect backoff.
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound of the reconnect backoff.
pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Consecutive reconnects allowed before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Deadline for a single connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Debounce applied to REST re-polls after optimistic updates.
pub const DEFAULT_POLL_DEBOUNCE: Duration = Duration::from_millis(100);

/// Deadline for a single REST poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a [`RealtimeClient`](crate::ws::service::RealtimeClient).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the backend, `http(s)://` or `ws(s)://`.
    pub base_url: String,
    /// Socket path appended to the base URL.
    pub path: String,
    #[serde(deserialize_with = "duration_from_ms")]
    pub ping_interval: Duration,
    #[serde(deserialize_with = "duration_from_ms")]
    pub reconnect_base_delay: Duration,
    #[serde(deserialize_with = "duration_from_ms")]
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    #[serde(deserialize_with = "duration_from_ms")]
    pub connect_timeout: Duration,
    #[serde(deserialize_with = "duration_from_ms")]
    pub poll_debounce: Duration,
    #[serde(deserialize_with = "duration_from_ms")]
    pub poll_timeout: Duration,
    /// Capacity of the command channel feeding the connection task.
    pub command_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            path: DEFAULT_MONITOR_PATH.to_string(),
            ping_interval: DEFAULT_PING_INTERVAL,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            reconnect_max_delay: DEFAULT_RECONNECT_MAX_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            poll_debounce: DEFAULT_POLL_DEBOUNCE,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            command_buffer: 64,
        }
    }
}

impl ClientConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_reconnect_delays(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base_delay = base;
        self.reconnect_max_delay = max;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_poll_debounce(mut self, debounce: Duration) -> Self {
        self.poll_debounce = debounce;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// The backoff policy described by this configuration.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: self.reconnect_base_delay,
            max_delay: self.reconnect_max_delay,
            max_attempts: self.max_reconnect_attempts,
        }
    }

    /// Rejects configurations the connection task cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(Error::Configuration("base_url must not be empty".into()));
        }
        if self.ping_interval.is_zero() {
            return Err(Error::Configuration("ping_interval must be non-zero".into()));
        }
        if self.reconnect_max_delay < self.reconnect_base_delay {
            return Err(Error::Configuration(
                "reconnect_max_delay must be >= reconnect_base_delay".into(),
            ));
        }
        if self.command_buffer == 0 {
            return Err(Error::Configuration("command_buffer must be non-zero".into()));
        }
        Ok(())
    }
}

fn duration_from_ms<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
