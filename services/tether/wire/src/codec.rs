//! Encoding and decoding of [`MonitorEnvelope`].
//!
//! Codecs are object-safe so a monitor can hold `Arc<dyn EnvelopeCodec>` and
//! both ends of a channel only need to agree on the codec, not on a type.

use crate::envelope::MonitorEnvelope;
use crate::error::WireError;
use bytes::Bytes;
use std::fmt;
use tracing::trace;

/// Maximum encoded envelope size (16 MiB)
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

/// Serializer for heartbeat envelopes
pub trait EnvelopeCodec: Send + Sync + fmt::Debug {
    /// Codec name for diagnostics
    fn name(&self) -> &'static str;

    /// Serialize an envelope into bytes
    fn encode(&self, envelope: &MonitorEnvelope) -> Result<Bytes, WireError>;

    /// Deserialize bytes into an envelope
    fn decode(&self, raw: &[u8]) -> Result<MonitorEnvelope, WireError>;
}

fn check_size(len: usize) -> Result<(), WireError> {
    if len == 0 {
        return Err(WireError::Empty);
    }
    if len > MAX_ENVELOPE_SIZE {
        return Err(WireError::Size(len));
    }
    Ok(())
}

/// Canonical CBOR envelope codec
#[derive(Debug, Default, Clone, Copy)]
pub struct CborCodec;

impl EnvelopeCodec for CborCodec {
    fn name(&self) -> &'static str {
        "cbor"
    }

    fn encode(&self, envelope: &MonitorEnvelope) -> Result<Bytes, WireError> {
        let mut buf = Vec::new();
        ciborium::into_writer(envelope, &mut buf).map_err(|e| WireError::Encode(e.to_string()))?;
        check_size(buf.len())?;
        trace!("Encoded {} envelope ({} bytes, cbor)", envelope.kind(), buf.len());
        Ok(Bytes::from(buf))
    }

    fn decode(&self, raw: &[u8]) -> Result<MonitorEnvelope, WireError> {
        check_size(raw.len())?;
        ciborium::from_reader(raw).map_err(|e| WireError::Malformed(e.to_string()))
    }
}

/// JSON envelope codec
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl EnvelopeCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, envelope: &MonitorEnvelope) -> Result<Bytes, WireError> {
        let buf = serde_json::to_vec(envelope).map_err(|e| WireError::Encode(e.to_string()))?;
        check_size(buf.len())?;
        trace!("Encoded {} envelope ({} bytes, json)", envelope.kind(), buf.len());
        Ok(Bytes::from(buf))
    }

    fn decode(&self, raw: &[u8]) -> Result<MonitorEnvelope, WireError> {
        check_size(raw.len())?;
        serde_json::from_slice(raw).map_err(|e| WireError::Malformed(e.to_string()))
    }
}
