//! Client configuration
//!
//! Configuration can be built in code with [`ClientConfig::new`] and the
//! `with_*` methods, or deserialized from JSON supplied by the host
//! application. Durations are given in (fractional) seconds.

use crate::error::{AvrError, Result};
use crate::sources::SourceRegistry;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default TCP port of the receiver's control protocol
pub const DEFAULT_PORT: u16 = 8102;

/// Settings for an [`AvrClient`](crate::AvrClient)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,

    /// Connect timeout, request timeout and TCP keepalive timing
    /// Default: 2 seconds
    #[serde(with = "secs")]
    pub timeout: Duration,

    /// Interval of the periodic refresh
    /// Default: 60 seconds
    #[serde(with = "secs")]
    pub scan_interval: Duration,

    /// Minimum gap between rate-limited commands
    /// Default: 0.1 seconds
    #[serde(with = "secs")]
    pub command_delay: Duration,

    /// Bounce the main zone volume after power on so the receiver reports it
    /// Default: true
    pub volume_workaround: bool,

    /// Source table supplied by the host; skips source discovery when set
    pub sources: Option<SourceRegistry>,

    /// Opaque protocol parameters passed through for the host
    pub params: serde_json::Value,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            timeout: Duration::from_secs(2),
            scan_interval: Duration::from_secs(60),
            command_delay: Duration::from_millis(100),
            volume_workaround: true,
            sources: None,
            params: serde_json::Value::Null,
        }
    }
}

impl ClientConfig {
    /// Create a configuration with default timings
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Load a configuration from JSON and validate it
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_scan_interval(mut self, scan_interval: Duration) -> Self {
        self.scan_interval = scan_interval;
        self
    }

    pub fn with_command_delay(mut self, command_delay: Duration) -> Self {
        self.command_delay = command_delay;
        self
    }

    pub fn with_volume_workaround(mut self, enabled: bool) -> Self {
        self.volume_workaround = enabled;
        self
    }

    pub fn with_sources(mut self, sources: SourceRegistry) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Check that the configuration can be used to connect
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(AvrError::InvalidConfig("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(AvrError::InvalidConfig("port must not be 0".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(AvrError::InvalidConfig("timeout must be positive".to_string()));
        }
        if self.scan_interval.is_zero() {
            return Err(AvrError::InvalidConfig(
                "scan_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
