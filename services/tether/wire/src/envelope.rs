//! The tagged union exchanged by connection monitors.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Control or payload envelope.
///
/// Heartbeat variants never leave the monitor layer: the receiving monitor
/// answers or consumes them and only [`MonitorEnvelope::Message`] payloads are
/// forwarded upward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorEnvelope {
    /// Liveness check sent by the client side
    Ping {
        /// Correlation id echoed back by the acknowledgement
        corr_id: u64,
    },
    /// Acknowledgement of a [`MonitorEnvelope::Ping`]
    PingAck {
        /// Correlation id copied from the ping
        corr_id: u64,
    },
    /// Application payload
    Message {
        /// Opaque bytes, serialized by the application
        payload: Bytes,
    },
}

impl MonitorEnvelope {
    /// Wrap an application payload
    pub fn message(payload: impl Into<Bytes>) -> Self {
        MonitorEnvelope::Message {
            payload: payload.into(),
        }
    }

    /// Whether this envelope is liveness traffic
    pub fn is_heartbeat(&self) -> bool {
        !matches!(self, MonitorEnvelope::Message { .. })
    }

    /// Short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorEnvelope::Ping { .. } => "PING",
            MonitorEnvelope::PingAck { .. } => "PING_ACK",
            MonitorEnvelope::Message { .. } => "MESSAGE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_classification() {
        assert!(MonitorEnvelope::Ping { corr_id: 1 }.is_heartbeat());
        assert!(MonitorEnvelope::PingAck { corr_id: 1 }.is_heartbeat());
        assert!(!MonitorEnvelope::message(&b"hello"[..]).is_heartbeat());
        assert_eq!(MonitorEnvelope::PingAck { corr_id: 7 }.kind(), "PING_ACK");
    }
}
