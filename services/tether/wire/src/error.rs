//! Wire protocol error types.

use thiserror::Error;

/// Envelope encoding and decoding errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Empty input where an envelope was expected
    #[error("empty envelope")]
    Empty,

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Envelope could not be serialized
    #[error("encode failed: {0}")]
    Encode(String),

    /// Bytes do not form a known envelope
    #[error("malformed envelope: {0}")]
    Malformed(String),
}
