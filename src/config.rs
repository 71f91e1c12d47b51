//! Connection configuration.
//!
//! Defines the handful of knobs the connection manager and request correlator
//! read: endpoint, credentials, heartbeat, reconnect budget and timeouts.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Public endpoint of the brokerage WebSocket API.
pub const DEFAULT_ENDPOINT: &str = "wss://ws.derivws.com/websockets/v3?app_id=1089";

/// Environment variable overriding [`BrokerConfig::endpoint`].
pub const ENV_ENDPOINT: &str = "BROKERLINK_ENDPOINT";

/// Environment variable overriding [`BrokerConfig::auth_token`].
pub const ENV_AUTH_TOKEN: &str = "BROKERLINK_AUTH_TOKEN";

/// Configuration for a [`crate::connection::ConnectionManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerConfig {
    /// WebSocket URL of the remote service.
    pub endpoint: Url,

    /// API token sent in the `authorize` command after every connect.
    /// Default: none (the session is usable without authorization)
    pub auth_token: Option<String>,

    /// Interval between keep-alive frames.
    /// Default: 30 s
    pub heartbeat_interval_ms: u64,

    /// Reconnect attempts allowed after a connection is lost before giving up.
    /// Default: 5
    pub max_reconnect_attempts: u32,

    /// Base delay before a reconnect attempt.
    /// Default: 3 s
    pub reconnect_delay_ms: u64,

    /// How the reconnect delay grows between attempts.
    /// Default: fixed
    pub backoff: Backoff,

    /// Default time a correlated request waits for its reply.
    /// Default: 15 s
    pub request_timeout_ms: u64,

    /// Upper bound on frames held while the session is not ready.
    /// Default: 256
    pub max_pending_frames: usize,

    /// Frames queued longer than this are discarded instead of flushed.
    /// Default: none (queued frames never expire)
    pub pending_frame_ttl_ms: Option<u64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            auth_token: None,
            heartbeat_interval_ms: 30_000,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 3_000,
            backoff: Backoff::Fixed,
            request_timeout_ms: 15_000,
            max_pending_frames: 256,
            pending_frame_ttl_ms: None,
        }
    }
}

fn default_endpoint() -> Url {
    match Url::parse(DEFAULT_ENDPOINT) {
        Ok(url) => url,
        Err(err) => unreachable!("DEFAULT_ENDPOINT is not a valid url: {err}"),
    }
}

impl BrokerConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            ..Self::default()
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Loads a JSON config file. Missing keys fall back to their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `BROKERLINK_ENDPOINT` / `BROKERLINK_AUTH_TOKEN` when set.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(endpoint) = std::env::var(ENV_ENDPOINT) {
            self.endpoint = Url::parse(&endpoint)
                .map_err(|e| Error::Config(format!("{ENV_ENDPOINT}: {e}")))?;
        }
        if let Ok(token) = std::env::var(ENV_AUTH_TOKEN) {
            if !token.trim().is_empty() {
                self.auth_token = Some(token);
            }
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        match self.endpoint.scheme() {
            "ws" | "wss" | "memory" => {}
            other => return Err(Error::Config(format!("unsupported endpoint scheme: {other}"))),
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::Config("heartbeatIntervalMs must be > 0".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::Config("requestTimeoutMs must be > 0".into()));
        }
        if self.max_pending_frames == 0 {
            return Err(Error::Config("maxPendingFrames must be > 0".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn pending_frame_ttl(&self) -> Option<Duration> {
        self.pending_frame_ttl_ms.map(Duration::from_millis)
    }

    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(self.reconnect_delay_ms, attempt)
    }
}

/// Reconnect delay policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Backoff {
    /// Every attempt waits the base delay.
    #[default]
    Fixed,

    /// Delay doubles per attempt, capped at `max_delay_ms`.
    Exponential {
        #[serde(rename = "maxDelayMs")]
        max_delay_ms: u64,
    },
}

impl Backoff {
    pub fn delay(&self, base_ms: u64, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed => Duration::from_millis(base_ms),
            Backoff::Exponential { max_delay_ms } => {
                let exp = attempt.saturating_sub(1).min(32);
                let ms = base_ms.saturating_mul(1u64 << exp).min(max_delay_ms);
                Duration::from_millis(ms)
            }
        }
    }
}
