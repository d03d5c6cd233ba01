//! Channel events and subscriber fan-out.

use crate::dispatcher::Dispatcher;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Identity of a connection: the server address and the logical session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionEvent {
    /// Address of the input channel
    pub channel_id: String,
    /// Logical client session
    pub session_id: String,
}

impl ConnectionEvent {
    /// Create a new connection event
    pub fn new(channel_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            session_id: session_id.into(),
        }
    }
}

/// A payload received on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    /// Address of the input channel
    pub channel_id: String,
    /// Session the payload belongs to
    pub session_id: String,
    /// Message payload
    pub payload: Bytes,
}

/// Events raised by an output (client) channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// Connection is open and sends go straight to the peer
    ConnectionOpened(ConnectionEvent),
    /// Connection ended
    ConnectionClosed(ConnectionEvent),
    /// Connection dropped transiently; sends are being buffered
    ConnectionOffline(ConnectionEvent),
    /// Response message from the input channel
    MessageReceived(MessageEvent),
}

impl OutputEvent {
    /// Session the event belongs to
    pub fn session_id(&self) -> &str {
        match self {
            OutputEvent::ConnectionOpened(e)
            | OutputEvent::ConnectionClosed(e)
            | OutputEvent::ConnectionOffline(e) => &e.session_id,
            OutputEvent::MessageReceived(m) => &m.session_id,
        }
    }
}

/// Events raised by an input (server) channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    /// A session connected for the first time
    SessionConnected(ConnectionEvent),
    /// A session is gone
    SessionDisconnected(ConnectionEvent),
    /// A session dropped transiently; responses to it are being buffered
    SessionOffline(ConnectionEvent),
    /// A transiently dropped session reconnected and its buffer was flushed
    SessionOnline(ConnectionEvent),
    /// Request message from a session
    MessageReceived(MessageEvent),
}

impl InputEvent {
    /// Session the event belongs to
    pub fn session_id(&self) -> &str {
        match self {
            InputEvent::SessionConnected(e)
            | InputEvent::SessionDisconnected(e)
            | InputEvent::SessionOffline(e)
            | InputEvent::SessionOnline(e) => &e.session_id,
            InputEvent::MessageReceived(m) => &m.session_id,
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Callback invoked for every event of type `E`
pub type EventHandler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Explicit fan-out of events to registered handlers.
///
/// `raise` snapshots the subscriber list and hands one job per event to the
/// dispatcher, so handlers may subscribe or unsubscribe from inside a
/// callback and a serial dispatcher delivers events in raise order.
pub struct EventHub<E> {
    subscribers: Mutex<Vec<(SubscriptionId, EventHandler<E>)>>,
    next_id: AtomicU64,
    dispatcher: Arc<dyn Dispatcher>,
}

impl<E> EventHub<E>
where
    E: Send + Sync + 'static,
{
    /// Create a hub delivering through `dispatcher`
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            dispatcher,
        }
    }

    /// Register a handler
    pub fn subscribe(&self, handler: EventHandler<E>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, handler));
        id
    }

    /// Remove a handler; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    /// Number of registered handlers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver an event to every handler registered at this moment
    pub fn raise(&self, event: E) {
        let handlers: Vec<EventHandler<E>> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        if handlers.is_empty() {
            trace!("No subscribers; event dropped");
            return;
        }

        self.dispatcher.invoke(Box::new(move || {
            for handler in &handlers {
                handler(&event);
            }
        }));
    }
}

impl<E> fmt::Debug for EventHub<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("subscribers", &self.subscribers.lock().len())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
