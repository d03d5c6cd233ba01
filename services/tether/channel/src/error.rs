//! Channel error types.

use thiserror::Error;

/// Errors surfaced through the duplex channel contract.
///
/// Transient connectivity loss is never one of these: it is reported as an
/// event. Errors are reserved for misuse and for failures the caller asked
/// to observe directly (an explicit open attempt, a send on a dead link).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel has no open connection
    #[error("channel is not connected")]
    NotConnected,

    /// The channel or session is permanently closed
    #[error("channel is closed")]
    Closed,

    /// Opening the connection failed
    #[error("connection to {0} failed")]
    ConnectionFailed(String),

    /// The input channel vetoed the connection
    #[error("connection to {0} was rejected")]
    ConnectionRejected(String),

    /// No session with this id on the input channel
    #[error("session {0} not found")]
    SessionNotFound(String),

    /// The offline buffer reached its configured capacity
    #[error("buffer full ({0} messages)")]
    BufferFull(usize),

    /// Another live input channel owns this address
    #[error("address already in use: {0}")]
    AddressInUse(String),

    /// Another live output channel uses this session id on this address
    #[error("session {session_id} already registered on {channel_id}")]
    DuplicateSession {
        /// Address of the input channel
        channel_id: String,
        /// Conflicting session id
        session_id: String,
    },

    /// The input channel is not listening
    #[error("input channel is not listening")]
    NotListening,

    /// Envelope could not be encoded
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ChannelError {
    /// Whether the error means the connection is gone rather than that the
    /// call itself was bad. Only these are worth buffering and retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChannelError::NotConnected
                | ChannelError::ConnectionFailed(_)
                | ChannelError::SessionNotFound(_)
        )
    }
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;
