//! Heartbeat envelope and envelope codecs for tether.
//!
//! Every message that crosses a monitored duplex channel is wrapped in a
//! [`MonitorEnvelope`] so that liveness traffic (PING / PING_ACK) can be told
//! apart from application payload and intercepted before it reaches the
//! application.
//!
//! ## Envelope
//!
//! ```text
//! +-----------+---------------------------+
//! | Ping      | corr_id: u64              |  client -> server
//! +-----------+---------------------------+
//! | PingAck   | corr_id: u64 (echoed)     |  server -> client
//! +-----------+---------------------------+
//! | Message   | payload: bytes            |  both directions
//! +-----------+---------------------------+
//! ```
//!
//! The byte layout is owned by an [`EnvelopeCodec`]. [`CborCodec`] is the
//! default; [`JsonCodec`] exists for debugging and for peers that cannot
//! speak CBOR.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod envelope;
pub mod error;

// Re-export main types
pub use codec::{CborCodec, EnvelopeCodec, JsonCodec, MAX_ENVELOPE_SIZE};
pub use envelope::MonitorEnvelope;
pub use error::WireError;
