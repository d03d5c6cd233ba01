//! Tether resilience drill binary.
//!
//! Loads the resilience configuration, then runs an echo server and a client
//! over the in-process transport, breaks the link for a while and reports how
//! the session came through.

use clap::Parser;
use std::path::PathBuf;
use tracing::info;

mod config;
mod drill;
mod logging;

use config::{OutageMode, TetherConfig};

/// Exercise the tether resilience stack against an injected outage
#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Resilient duplex messaging drill")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "tether.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Client ping interval, e.g. 500ms
    #[arg(long)]
    ping_interval: Option<humantime::Duration>,

    /// Silence tolerated before a connection is declared dead
    #[arg(long)]
    ping_timeout: Option<humantime::Duration>,

    /// How long a session may stay offline before it is closed
    #[arg(long)]
    max_offline_time: Option<humantime::Duration>,

    /// Delay between reconnect attempts
    #[arg(long)]
    retry_interval: Option<humantime::Duration>,

    /// Reconnect attempts after a drop (unlimited when unset)
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,

    /// Messages the drill client sends
    #[arg(long)]
    messages: Option<u32>,

    /// Length of the injected outage, e.g. 2s (0s disables it)
    #[arg(long)]
    outage: Option<humantime::Duration>,

    /// Kind of outage
    #[arg(long, value_enum)]
    outage_mode: Option<OutageMode>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn apply(&self, config: &mut TetherConfig) {
        let resilience = &mut config.resilience;
        if let Some(value) = self.ping_interval {
            resilience.heartbeat.ping_interval = value.into();
        }
        if let Some(value) = self.ping_timeout {
            resilience.heartbeat.ping_timeout = value.into();
        }
        if let Some(value) = self.max_offline_time {
            resilience.buffer.max_offline_time = value.into();
        }
        if let Some(value) = self.retry_interval {
            resilience.reconnect.retry_interval = value.into();
        }
        if let Some(value) = self.max_reconnect_attempts {
            resilience.reconnect.max_reconnect_attempts = Some(value);
        }
        if let Some(value) = self.messages {
            config.drill.messages = value;
        }
        if let Some(value) = self.outage {
            config.drill.outage = value.into();
        }
        if let Some(value) = self.outage_mode {
            config.drill.outage_mode = value;
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level)?;

    info!("Starting tether v{}", env!("CARGO_PKG_VERSION"));

    let mut config = TetherConfig::load_from_file(&args.config)?;
    args.apply(&mut config);
    config.resilience.validate()?;

    if args.print_config {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let resilience = &config.resilience;
    component_info!(
        "drill",
        "Heartbeat every {:?} (timeout {:?}), offline limit {:?}, retry every {:?}",
        resilience.heartbeat.ping_interval,
        resilience.heartbeat.ping_timeout,
        resilience.buffer.max_offline_time,
        resilience.reconnect.retry_interval
    );

    let report = drill::run(&config).await?;
    print!("{}", serde_yaml::to_string(&report)?);

    // An outage inside the offline window must be invisible
    let survivable = config.drill.outage < config.resilience.buffer.max_offline_time
        && config.drill.outage_mode == OutageMode::Down;
    if survivable && (report.lost() > 0 || report.session_closed) {
        component_error!(
            "drill",
            "Outage of {:?} was within the offline window but the session did not survive it",
            config.drill.outage
        );
        anyhow::bail!(
            "Drill failed: {} of {} messages lost, session closed: {}",
            report.lost(),
            report.sent,
            report.session_closed
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "tether",
            "--ping-interval",
            "200ms",
            "--max-reconnect-attempts",
            "3",
            "--outage",
            "1s",
            "--outage-mode",
            "silent",
        ]);
        let mut config = TetherConfig::default();
        args.apply(&mut config);

        assert_eq!(
            config.resilience.heartbeat.ping_interval,
            Duration::from_millis(200)
        );
        assert_eq!(config.resilience.reconnect.max_reconnect_attempts, Some(3));
        assert_eq!(config.drill.outage, Duration::from_secs(1));
        assert_eq!(config.drill.outage_mode, OutageMode::Silent);
        assert_eq!(config.drill.messages, 20);
    }
}
