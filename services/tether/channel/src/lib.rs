//! Duplex channel contract, event dispatch and in-process transport for tether.
//!
//! A duplex channel is an endpoint pair: an [`OutputChannel`] on the client
//! side (open/close a connection, send messages, receive responses) and an
//! [`InputChannel`] on the server side (listen, answer a given session,
//! observe sessions connecting and disconnecting). Every layer of the
//! resilience stack consumes this contract and exposes it again, so layers
//! compose without the layer above knowing what sits below.
//!
//! ## Features
//!
//! - **Contract**: [`OutputChannel`], [`InputChannel`] and the
//!   [`MessagingSystem`] factory trait
//! - **Events**: explicit [`OutputEvent`] / [`InputEvent`] enums fanned out by
//!   an [`EventHub`]
//! - **Dispatch**: [`SyncDispatcher`], [`SerialDispatcher`] and
//!   [`PoolDispatcher`] decide on which thread handlers run
//! - **In-process transport**: [`MemoryNetwork`] with per-address fault
//!   injection
//!
//! ## Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use tether_channel::{InputEvent, MemoryNetwork, MessagingSystem};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), tether_channel::ChannelError> {
//! let network = MemoryNetwork::new();
//!
//! let input = network.create_input_channel("memory://echo")?;
//! let responder = input.clone();
//! input.subscribe(Arc::new(move |event: &InputEvent| {
//!     if let InputEvent::MessageReceived(msg) = event {
//!         let _ = responder.send_response(&msg.session_id, msg.payload.clone());
//!     }
//! }));
//! input.start_listening().await?;
//!
//! let output = network.create_output_channel("memory://echo", None)?;
//! output.open_connection().await?;
//! output.send_message(Bytes::from_static(b"hello"))?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod memory;

// Re-export main types
pub use channel::{ConnectValidator, InputChannel, MessagingSystem, OutputChannel};
pub use dispatcher::{Dispatcher, Job, PoolDispatcher, SerialDispatcher, SyncDispatcher};
pub use error::{ChannelError, ChannelResult};
pub use event::{
    ConnectionEvent, EventHandler, EventHub, InputEvent, MessageEvent, OutputEvent, SubscriptionId,
};
pub use memory::{LinkState, MemoryInputChannel, MemoryNetwork, MemoryOutputChannel};
