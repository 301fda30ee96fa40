//! Gateway configuration.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use stream_gateway_session::{
    RegistryConfig,
    registry::{DEFAULT_EVENT_CAPACITY, DEFAULT_PARK_CAPACITY},
};

pub const ENV_TOKEN: &str = "STREAM_GATEWAY_TOKEN";
pub const ENV_ENDPOINT: &str = "STREAM_GATEWAY_ENDPOINT";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "STREAM_GATEWAY_REQUEST_TIMEOUT_MS";
pub const ENV_PARK_CAPACITY: &str = "STREAM_GATEWAY_PARK_CAPACITY";
pub const ENV_ATTACHMENT_DIR: &str = "STREAM_GATEWAY_ATTACHMENT_DIR";

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Policy knobs of a [`Gateway`](crate::Gateway).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Give up on correlated replies after this long. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Targeted pushes held until their identity is bound; 0 drops them.
    pub park_capacity: usize,
    /// Per-session event channel capacity.
    pub event_capacity: usize,
    /// Capacity of the connection event channel.
    pub connection_event_capacity: usize,
    /// Where decoded QR images are written. `None` skips materialization.
    pub attachment_dir: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: None,
            park_capacity: DEFAULT_PARK_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            connection_event_capacity: 64,
            attachment_dir: None,
        }
    }
}

impl GatewayConfig {
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn with_park_capacity(mut self, capacity: usize) -> Self {
        self.park_capacity = capacity;
        self
    }

    #[must_use]
    pub const fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_attachment_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.attachment_dir = Some(dir.into());
        self
    }

    /// Load overrides from `STREAM_GATEWAY_*` environment variables.
    ///
    /// # Errors
    /// Returns error if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    ///
    /// # Errors
    /// Returns error if a variable is set to an unparseable value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_REQUEST_TIMEOUT_MS)? {
            config.request_timeout = (ms > 0).then_some(Duration::from_millis(ms));
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, ENV_PARK_CAPACITY)? {
            config.park_capacity = capacity;
        }
        if let Some(dir) = lookup(ENV_ATTACHMENT_DIR).filter(|d| !d.trim().is_empty()) {
            config.attachment_dir = Some(PathBuf::from(dir));
        }
        Ok(config)
    }

    pub(crate) const fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            park_capacity: self.park_capacity,
            event_capacity: self.event_capacity,
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Invalid { var, value })
}

/// Identity token and endpoint of the upstream service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub token: String,
    pub endpoint: String,
}

impl Credentials {
    #[must_use]
    pub fn new(token: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Read `STREAM_GATEWAY_TOKEN` and `STREAM_GATEWAY_ENDPOINT`.
    ///
    /// # Errors
    /// Returns error if either variable is missing or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    ///
    /// # Errors
    /// Returns error if either variable is missing or empty.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |var: &'static str| {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(var))
        };
        Ok(Self::new(required(ENV_TOKEN)?, required(ENV_ENDPOINT)?))
    }
}
