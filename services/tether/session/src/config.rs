//! Resilience configuration.
//!
//! Durations are written in humantime form (`"500ms"`, `"10s"`) when the
//! configuration is deserialized.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A duration that must be positive is zero
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// The buffer would accept no messages at all
    #[error("max_queue_length must be greater than zero when set")]
    ZeroQueueLength,
}

/// Heartbeat settings of a connection monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Client ping cadence; also the server liveness sweep period
    #[serde(with = "duration_str")]
    pub ping_interval: Duration,
    /// Server: max silence per session. Client: max wait for a PING_ACK.
    #[serde(with = "duration_str")]
    pub ping_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(2),
        }
    }
}

/// Offline buffering settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// How long a session may stay offline before it is purged
    #[serde(with = "duration_str")]
    pub max_offline_time: Duration,
    /// Optional cap on buffered messages per session
    pub max_queue_length: Option<usize>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_offline_time: Duration::from_secs(10),
            max_queue_length: None,
        }
    }
}

/// Reconnect policy settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before each retry
    #[serde(with = "duration_str")]
    pub retry_interval: Duration,
    /// Retries allowed after a disconnect; `None` means unlimited
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            max_reconnect_attempts: None,
        }
    }
}

/// Settings for the whole transport -> monitor -> buffer stack
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Connection monitor
    pub heartbeat: HeartbeatConfig,
    /// Message buffer
    pub buffer: BufferConfig,
    /// Reconnect policy
    pub reconnect: ReconnectConfig,
}

impl ResilienceConfig {
    /// Reject settings the stack cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("ping_interval", self.heartbeat.ping_interval),
            ("ping_timeout", self.heartbeat.ping_timeout),
            ("max_offline_time", self.buffer.max_offline_time),
            ("retry_interval", self.reconnect.retry_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }

        if self.buffer.max_queue_length == Some(0) {
            return Err(ConfigError::ZeroQueueLength);
        }

        Ok(())
    }
}

/// Serde adapter for durations written as humantime strings (`"250ms"`,
/// `"2s"`). Use with `#[serde(with = "duration_str")]`.
pub mod duration_str {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Write a duration as a humantime string
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    /// Parse a humantime string into a duration
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ResilienceConfig::default();
        assert_eq!(config.heartbeat.ping_interval, Duration::from_secs(1));
        assert_eq!(config.buffer.max_offline_time, Duration::from_secs(10));
        assert_eq!(config.reconnect.max_reconnect_attempts, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let json = r#"{
            "heartbeat": { "ping_timeout": "750ms" },
            "reconnect": { "retry_interval": "50ms", "max_reconnect_attempts": 4 }
        }"#;
        let config: ResilienceConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.heartbeat.ping_interval, Duration::from_secs(1));
        assert_eq!(config.heartbeat.ping_timeout, Duration::from_millis(750));
        assert_eq!(config.reconnect.retry_interval, Duration::from_millis(50));
        assert_eq!(config.reconnect.max_reconnect_attempts, Some(4));
        assert_eq!(config.buffer.max_queue_length, None);
    }

    #[test]
    fn test_invalid_duration_string_rejected() {
        let json = r#"{ "buffer": { "max_offline_time": "soon" } }"#;
        assert!(serde_json::from_str::<ResilienceConfig>(json).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = ResilienceConfig::default();
        config.reconnect.retry_interval = Duration::ZERO;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration("retry_interval"))
        );

        let mut config = ResilienceConfig::default();
        config.buffer.max_queue_length = Some(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroQueueLength));
    }
}
