//! Configuration handling for the tether binary.
//!
//! Settings come from a YAML file, then `TETHER_*` environment variables,
//! then command line flags, each layer overriding the previous one.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tether_session::ResilienceConfig;
use tracing::{info, warn};

/// How the drill breaks the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutageMode {
    /// Connections are reset; both ends notice immediately
    Down,
    /// Traffic is dropped silently; only heartbeats notice
    Silent,
}

/// Loopback drill settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrillConfig {
    /// Address of the echo server
    pub address: String,
    /// Messages the client sends
    pub messages: u32,
    /// Pause between messages
    #[serde(with = "tether_session::config::duration_str")]
    pub message_interval: Duration,
    /// Length of the injected outage; zero disables it
    #[serde(with = "tether_session::config::duration_str")]
    pub outage: Duration,
    /// Kind of outage
    pub outage_mode: OutageMode,
}

impl Default for DrillConfig {
    fn default() -> Self {
        Self {
            address: "memory://tether-drill".to_string(),
            messages: 20,
            message_interval: Duration::from_millis(50),
            outage: Duration::from_millis(300),
            outage_mode: OutageMode::Down,
        }
    }
}

/// Complete binary configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Resilience stack settings
    pub resilience: ResilienceConfig,
    /// Drill settings
    pub drill: DrillConfig,
}

impl TetherConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: TetherConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `TETHER_*` overrides looked up through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let duration = |key: &str| -> Result<Option<Duration>> {
            lookup(key)
                .map(|raw| {
                    humantime::parse_duration(&raw)
                        .with_context(|| format!("Invalid duration in {}: {:?}", key, raw))
                })
                .transpose()
        };

        let resilience = &mut self.resilience;
        if let Some(value) = duration("TETHER_PING_INTERVAL")? {
            resilience.heartbeat.ping_interval = value;
            info!("Ping interval overridden by environment: {:?}", value);
        }
        if let Some(value) = duration("TETHER_PING_TIMEOUT")? {
            resilience.heartbeat.ping_timeout = value;
            info!("Ping timeout overridden by environment: {:?}", value);
        }
        if let Some(value) = duration("TETHER_MAX_OFFLINE_TIME")? {
            resilience.buffer.max_offline_time = value;
            info!("Max offline time overridden by environment: {:?}", value);
        }
        if let Some(value) = duration("TETHER_RETRY_INTERVAL")? {
            resilience.reconnect.retry_interval = value;
            info!("Retry interval overridden by environment: {:?}", value);
        }

        if let Some(raw) = lookup("TETHER_MAX_RECONNECT_ATTEMPTS") {
            resilience.reconnect.max_reconnect_attempts = parse_limit(&raw)
                .with_context(|| format!("Invalid TETHER_MAX_RECONNECT_ATTEMPTS: {:?}", raw))?;
        }
        if let Some(raw) = lookup("TETHER_MAX_QUEUE_LENGTH") {
            resilience.buffer.max_queue_length = parse_limit(&raw)
                .with_context(|| format!("Invalid TETHER_MAX_QUEUE_LENGTH: {:?}", raw))?;
        }
        if let Some(address) = lookup("TETHER_DRILL_ADDRESS") {
            self.drill.address = address;
        }

        Ok(())
    }
}

/// `unlimited` (or an empty string) clears the limit
fn parse_limit<T: std::str::FromStr>(raw: &str) -> Result<Option<T>, T::Err> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("unlimited") {
        return Ok(None);
    }
    raw.parse().map(Some)
}
