//! The duplex channel contract.
//!
//! Transports implement these traits, and so does every resilience layer
//! stacked on top of them. Sends are fire-and-forget: `Ok` means the message
//! was accepted for delivery (or for buffering), not that the peer has it.

use crate::error::ChannelResult;
use crate::event::{EventHandler, InputEvent, OutputEvent, SubscriptionId};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Accept/reject hook consulted when a session connects.
///
/// Arguments are the session id and the peer address as reported by the
/// transport. Returning `false` refuses the connection.
pub type ConnectValidator = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Client side of a duplex channel
#[async_trait]
pub trait OutputChannel: Send + Sync {
    /// Address of the input channel this channel talks to
    fn channel_id(&self) -> &str;

    /// Logical session id, stable across reconnects
    fn session_id(&self) -> &str;

    /// Open the connection
    async fn open_connection(&self) -> ChannelResult<()>;

    /// Close the connection. Raises `ConnectionClosed` if it was open.
    fn close_connection(&self);

    /// Whether sends currently go straight to the peer
    fn is_connected(&self) -> bool;

    /// Send a message to the input channel
    fn send_message(&self, payload: Bytes) -> ChannelResult<()>;

    /// Register an event handler
    fn subscribe(&self, handler: EventHandler<OutputEvent>) -> SubscriptionId;

    /// Remove an event handler
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Server side of a duplex channel
#[async_trait]
pub trait InputChannel: Send + Sync {
    /// Address this channel listens on
    fn channel_id(&self) -> &str;

    /// Start accepting sessions
    async fn start_listening(&self) -> ChannelResult<()>;

    /// Stop accepting sessions and drop all connected ones
    fn stop_listening(&self);

    /// Whether the channel is listening
    fn is_listening(&self) -> bool;

    /// Send a response message to one session
    fn send_response(&self, session_id: &str, payload: Bytes) -> ChannelResult<()>;

    /// Disconnect one session
    fn disconnect_session(&self, session_id: &str);

    /// Install or clear the accept/reject hook
    fn set_connect_validator(&self, validator: Option<ConnectValidator>);

    /// Register an event handler
    fn subscribe(&self, handler: EventHandler<InputEvent>) -> SubscriptionId;

    /// Remove an event handler
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Factory for channels of one messaging stack
pub trait MessagingSystem: Send + Sync {
    /// Create a client channel to `channel_id`.
    ///
    /// When `session_id` is `None` the implementation generates a fresh one.
    fn create_output_channel(
        &self,
        channel_id: &str,
        session_id: Option<&str>,
    ) -> ChannelResult<Arc<dyn OutputChannel>>;

    /// Create a server channel listening on `channel_id`
    fn create_input_channel(&self, channel_id: &str) -> ChannelResult<Arc<dyn InputChannel>>;
}
