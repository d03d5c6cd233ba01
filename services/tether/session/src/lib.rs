//! Connection monitoring, offline buffering and reconnection for duplex channels.
//!
//! This crate turns an unreliable duplex transport into channels that hide
//! short outages from the application. Each resilience layer consumes the
//! [`tether_channel`] contract and exposes it again, so the layers stack
//! transparently.
//!
//! ## Features
//!
//! - **Connection Monitor**: PING/PING_ACK heartbeats detect half-open
//!   connections; idle server sessions are swept out
//! - **Message Buffer**: sends are queued while offline and flushed in order
//!   on reconnect, up to a maximum offline time
//! - **Reconnect Policy**: one attempt at a time, fixed retry interval,
//!   optional attempt limit
//! - **Composite**: [`ResilientMessaging`] assembles
//!   buffer -> monitor -> transport and tracks sessions in a
//!   [`SessionRegistry`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use std::sync::Arc;
//! use tether_channel::{InputChannel, InputEvent, MemoryNetwork, OutputChannel};
//! use tether_session::{ResilienceConfig, ResilientMessaging};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let network = MemoryNetwork::new();
//! let messaging = ResilientMessaging::new(Arc::new(network), ResilienceConfig::default())?;
//!
//! let input = messaging.create_resilient_input("memory://orders")?;
//! let responder = input.clone();
//! input.subscribe(Arc::new(move |event: &InputEvent| {
//!     if let InputEvent::MessageReceived(msg) = event {
//!         let _ = responder.send_response(&msg.session_id, msg.payload.clone());
//!     }
//! }));
//! input.start_listening().await?;
//!
//! let output = messaging.create_resilient_output("memory://orders", None)?;
//! output.open_connection().await?;
//! // Buffered until the connection is up
//! output.send_message(Bytes::from_static(b"order-1"))?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod config;
pub mod factory;
pub mod keepalive;
pub mod monitor;
pub mod reconnect;
pub mod registry;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use buffer::{BufferedInputChannel, BufferedMessaging, BufferedOutputChannel};
pub use config::{BufferConfig, ConfigError, HeartbeatConfig, ReconnectConfig, ResilienceConfig};
pub use factory::ResilientMessaging;
pub use keepalive::{now_corr_id, KeepaliveState};
pub use monitor::{MonitoredInputChannel, MonitoredMessaging, MonitoredOutputChannel};
pub use reconnect::{ReconnectEvent, ReconnectPolicy};
pub use registry::SessionRegistry;
pub use session::{SessionInfo, SessionState};
