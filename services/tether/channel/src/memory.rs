//! In-process transport.
//!
//! [`MemoryNetwork`] is an explicit registry of listening addresses. Channels
//! created from the same network reach each other; channels from different
//! networks never do. Each endpoint delivers its events on its own
//! [`SerialDispatcher`], the way a socket transport delivers them on its
//! receive loop, so callbacks never run on the sender's stack.
//!
//! Faults are injected per address with [`MemoryNetwork::set_link_state`]:
//!
//! - [`LinkState::Down`] resets every connection (both ends are notified)
//!   and refuses new ones, like a crashed host.
//! - [`LinkState::Silent`] keeps connections open but drops all traffic
//!   without telling anyone, like a half-open socket or a poller that
//!   stopped polling. New connections are refused.

use crate::channel::{ConnectValidator, InputChannel, MessagingSystem, OutputChannel};
use crate::dispatcher::SerialDispatcher;
use crate::error::{ChannelError, ChannelResult};
use crate::event::{
    ConnectionEvent, EventHandler, EventHub, InputEvent, MessageEvent, OutputEvent, SubscriptionId,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// Fault state of one address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// Traffic flows normally
    #[default]
    Up,
    /// Connections are reset and refused
    Down,
    /// Connections stay open but all traffic is dropped
    Silent,
}

/// Registry of in-process listeners
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    listeners: Mutex<HashMap<String, Arc<ListenerCore>>>,
    links: Mutex<HashMap<String, LinkState>>,
}

impl NetworkInner {
    fn link_state(&self, channel_id: &str) -> LinkState {
        self.links.lock().get(channel_id).copied().unwrap_or_default()
    }

    fn listener(&self, channel_id: &str) -> Option<Arc<ListenerCore>> {
        self.listeners.lock().get(channel_id).cloned()
    }
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client channel with a concrete type
    pub fn output_channel(
        &self,
        channel_id: &str,
        session_id: Option<&str>,
    ) -> MemoryOutputChannel {
        let session_id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        MemoryOutputChannel {
            core: Arc::new(ClientCore {
                channel_id: channel_id.to_string(),
                session_id,
                network: self.inner.clone(),
                listener: Mutex::new(None),
                hub: EventHub::new(Arc::new(SerialDispatcher::new())),
            }),
        }
    }

    /// Create a server channel with a concrete type
    pub fn input_channel(&self, channel_id: &str) -> MemoryInputChannel {
        MemoryInputChannel {
            core: Arc::new(ListenerCore {
                channel_id: channel_id.to_string(),
                network: Arc::downgrade(&self.inner),
                state: Mutex::new(ListenerState::default()),
                hub: EventHub::new(Arc::new(SerialDispatcher::new())),
            }),
        }
    }

    /// Change the fault state of an address
    pub fn set_link_state(&self, channel_id: &str, state: LinkState) {
        let previous = self
            .inner
            .links
            .lock()
            .insert(channel_id.to_string(), state)
            .unwrap_or_default();

        if previous != state {
            info!("Link {} changed {:?} -> {:?}", channel_id, previous, state);
        }

        if state == LinkState::Down {
            if let Some(listener) = self.inner.listener(channel_id) {
                listener.reset_connections();
            }
        }
    }

    /// Current fault state of an address
    pub fn link_state(&self, channel_id: &str) -> LinkState {
        self.inner.link_state(channel_id)
    }

    /// Number of sessions connected to the listener on `channel_id`
    pub fn connection_count(&self, channel_id: &str) -> usize {
        self.inner
            .listener(channel_id)
            .map(|listener| listener.state.lock().connections.len())
            .unwrap_or(0)
    }
}

impl MessagingSystem for MemoryNetwork {
    fn create_output_channel(
        &self,
        channel_id: &str,
        session_id: Option<&str>,
    ) -> ChannelResult<Arc<dyn OutputChannel>> {
        Ok(Arc::new(self.output_channel(channel_id, session_id)))
    }

    fn create_input_channel(&self, channel_id: &str) -> ChannelResult<Arc<dyn InputChannel>> {
        Ok(Arc::new(self.input_channel(channel_id)))
    }
}

struct ClientCore {
    channel_id: String,
    session_id: String,
    network: Arc<NetworkInner>,
    /// Present while connected
    listener: Mutex<Option<Arc<ListenerCore>>>,
    hub: EventHub<OutputEvent>,
}

impl ClientCore {
    fn event(&self) -> ConnectionEvent {
        ConnectionEvent::new(&self.channel_id, &self.session_id)
    }

    /// Forget the listener if it is `from`; raises `ConnectionClosed`
    fn detach(&self, from: &Arc<ListenerCore>) {
        let mut listener = self.listener.lock();
        let attached = listener
            .as_ref()
            .map(|current| Arc::ptr_eq(current, from))
            .unwrap_or(false);

        if attached {
            *listener = None;
            drop(listener);
            debug!("Connection {} -> {} reset by listener", self.session_id, self.channel_id);
            self.hub.raise(OutputEvent::ConnectionClosed(self.event()));
        }
    }
}

#[derive(Default)]
struct ListenerState {
    listening: bool,
    connections: HashMap<String, Weak<ClientCore>>,
    validator: Option<ConnectValidator>,
}

struct ListenerCore {
    channel_id: String,
    network: Weak<NetworkInner>,
    state: Mutex<ListenerState>,
    hub: EventHub<InputEvent>,
}

impl ListenerCore {
    fn event(&self, session_id: &str) -> ConnectionEvent {
        ConnectionEvent::new(&self.channel_id, session_id)
    }

    fn link_state(&self) -> LinkState {
        self.network
            .upgrade()
            .map(|network| network.link_state(&self.channel_id))
            .unwrap_or(LinkState::Down)
    }

    /// Remove the session entry only if it still belongs to `client`
    fn remove_connection(&self, session_id: &str, client: &Arc<ClientCore>) -> bool {
        let mut state = self.state.lock();
        let owned = state
            .connections
            .get(session_id)
            .map(|weak| weak.as_ptr() == Arc::as_ptr(client))
            .unwrap_or(false);
        if owned {
            state.connections.remove(session_id);
        }
        owned
    }

    fn reset_connections(self: &Arc<Self>) {
        let dropped: Vec<(String, Weak<ClientCore>)> =
            self.state.lock().connections.drain().collect();

        for (session_id, client) in dropped {
            if let Some(client) = client.upgrade() {
                client.detach(self);
            }
            self.hub
                .raise(InputEvent::SessionDisconnected(self.event(&session_id)));
        }
    }
}

/// Client end of an in-process channel
pub struct MemoryOutputChannel {
    core: Arc<ClientCore>,
}

#[async_trait]
impl OutputChannel for MemoryOutputChannel {
    fn channel_id(&self) -> &str {
        &self.core.channel_id
    }

    fn session_id(&self) -> &str {
        &self.core.session_id
    }

    async fn open_connection(&self) -> ChannelResult<()> {
        let core = &self.core;
        let mut attached = core.listener.lock();
        if attached.is_some() {
            return Ok(());
        }

        if core.network.link_state(&core.channel_id) != LinkState::Up {
            debug!("Connect {} -> {} refused: link not up", core.session_id, core.channel_id);
            return Err(ChannelError::ConnectionFailed(core.channel_id.clone()));
        }

        let listener = core
            .network
            .listener(&core.channel_id)
            .ok_or_else(|| ChannelError::ConnectionFailed(core.channel_id.clone()))?;

        let validator = listener.state.lock().validator.clone();
        if let Some(validator) = validator {
            let peer_address = format!("in-process:{}", core.session_id);
            if !validator(&core.session_id, &peer_address) {
                info!("Connect {} -> {} rejected by validator", core.session_id, core.channel_id);
                return Err(ChannelError::ConnectionRejected(core.channel_id.clone()));
            }
        }

        let replaced = {
            let mut state = listener.state.lock();
            if !state.listening {
                return Err(ChannelError::ConnectionFailed(core.channel_id.clone()));
            }
            state
                .connections
                .insert(core.session_id.clone(), Arc::downgrade(core))
        };

        // A stale connection carrying the same session id is superseded
        if let Some(stale) = replaced
            .and_then(|weak| weak.upgrade())
            .filter(|stale| !Arc::ptr_eq(stale, core))
        {
            warn!("Session {} reconnected to {}; dropping stale connection", core.session_id, core.channel_id);
            stale.detach(&listener);
            listener
                .hub
                .raise(InputEvent::SessionDisconnected(core.event()));
        }

        *attached = Some(listener.clone());
        drop(attached);

        debug!("Connected {} -> {}", core.session_id, core.channel_id);
        listener.hub.raise(InputEvent::SessionConnected(core.event()));
        core.hub.raise(OutputEvent::ConnectionOpened(core.event()));
        Ok(())
    }

    fn close_connection(&self) {
        let core = &self.core;
        let listener = core.listener.lock().take();

        if let Some(listener) = listener {
            if listener.remove_connection(&core.session_id, core) {
                listener
                    .hub
                    .raise(InputEvent::SessionDisconnected(core.event()));
            }
            debug!("Closed {} -> {}", core.session_id, core.channel_id);
            core.hub.raise(OutputEvent::ConnectionClosed(core.event()));
        }
    }

    fn is_connected(&self) -> bool {
        self.core.listener.lock().is_some()
    }

    fn send_message(&self, payload: Bytes) -> ChannelResult<()> {
        let core = &self.core;
        let listener = core
            .listener
            .lock()
            .clone()
            .ok_or(ChannelError::NotConnected)?;

        match core.network.link_state(&core.channel_id) {
            LinkState::Up => {}
            LinkState::Silent => {
                trace!("Silent link {}; dropping {} bytes", core.channel_id, payload.len());
                return Ok(());
            }
            LinkState::Down => return Err(ChannelError::NotConnected),
        }

        listener.hub.raise(InputEvent::MessageReceived(MessageEvent {
            channel_id: core.channel_id.clone(),
            session_id: core.session_id.clone(),
            payload,
        }));
        Ok(())
    }

    fn subscribe(&self, handler: EventHandler<OutputEvent>) -> SubscriptionId {
        self.core.hub.subscribe(handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.core.hub.unsubscribe(id);
    }
}

impl Drop for MemoryOutputChannel {
    fn drop(&mut self) {
        self.close_connection();
    }
}

/// Server end of an in-process channel
pub struct MemoryInputChannel {
    core: Arc<ListenerCore>,
}

#[async_trait]
impl InputChannel for MemoryInputChannel {
    fn channel_id(&self) -> &str {
        &self.core.channel_id
    }

    async fn start_listening(&self) -> ChannelResult<()> {
        let core = &self.core;
        let network = core
            .network
            .upgrade()
            .ok_or_else(|| ChannelError::AddressInUse(core.channel_id.clone()))?;

        let mut listeners = network.listeners.lock();
        if let Some(existing) = listeners.get(&core.channel_id) {
            if Arc::ptr_eq(existing, core) {
                return Ok(());
            }
            return Err(ChannelError::AddressInUse(core.channel_id.clone()));
        }

        core.state.lock().listening = true;
        listeners.insert(core.channel_id.clone(), core.clone());
        info!("Listening on {}", core.channel_id);
        Ok(())
    }

    fn stop_listening(&self) {
        let core = &self.core;
        if let Some(network) = core.network.upgrade() {
            let mut listeners = network.listeners.lock();
            let owned = listeners
                .get(&core.channel_id)
                .map(|existing| Arc::ptr_eq(existing, core))
                .unwrap_or(false);
            if owned {
                listeners.remove(&core.channel_id);
            }
        }

        let was_listening = std::mem::replace(&mut core.state.lock().listening, false);
        core.reset_connections();
        if was_listening {
            info!("Stopped listening on {}", core.channel_id);
        }
    }

    fn is_listening(&self) -> bool {
        self.core.state.lock().listening
    }

    fn send_response(&self, session_id: &str, payload: Bytes) -> ChannelResult<()> {
        let core = &self.core;
        let client = {
            let state = core.state.lock();
            if !state.listening {
                return Err(ChannelError::NotListening);
            }
            state.connections.get(session_id).and_then(Weak::upgrade)
        }
        .ok_or_else(|| ChannelError::SessionNotFound(session_id.to_string()))?;

        if core.link_state() == LinkState::Silent {
            trace!("Silent link {}; dropping response to {}", core.channel_id, session_id);
            return Ok(());
        }

        client.hub.raise(OutputEvent::MessageReceived(MessageEvent {
            channel_id: core.channel_id.clone(),
            session_id: session_id.to_string(),
            payload,
        }));
        Ok(())
    }

    fn disconnect_session(&self, session_id: &str) {
        let core = &self.core;
        let removed = core.state.lock().connections.remove(session_id);

        if let Some(client) = removed {
            if let Some(client) = client.upgrade() {
                client.detach(core);
            }
            debug!("Disconnected session {} from {}", session_id, core.channel_id);
            core.hub
                .raise(InputEvent::SessionDisconnected(core.event(session_id)));
        }
    }

    fn set_connect_validator(&self, validator: Option<ConnectValidator>) {
        self.core.state.lock().validator = validator;
    }

    fn subscribe(&self, handler: EventHandler<InputEvent>) -> SubscriptionId {
        self.core.hub.subscribe(handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.core.hub.unsubscribe(id);
    }
}

impl Drop for MemoryInputChannel {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const ADDR: &str = "memory://test";

    fn output_events(channel: &dyn OutputChannel) -> mpsc::UnboundedReceiver<OutputEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        channel.subscribe(Arc::new(move |event: &OutputEvent| {
            tx.send(event.clone()).ok();
        }));
        rx
    }

    fn input_events(channel: &dyn InputChannel) -> mpsc::UnboundedReceiver<InputEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        channel.subscribe(Arc::new(move |event: &InputEvent| {
            tx.send(event.clone()).ok();
        }));
        rx
    }

    async fn next<E>(rx: &mut mpsc::UnboundedReceiver<E>) -> E {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_request_response_exchange() {
        let network = MemoryNetwork::new();
        let input = network.input_channel(ADDR);
        let mut server = input_events(&input);
        input.start_listening().await.unwrap();

        let output = network.output_channel(ADDR, Some("client-1"));
        let mut client = output_events(&output);
        output.open_connection().await.unwrap();
        assert!(output.is_connected());

        assert_eq!(
            next(&mut server).await,
            InputEvent::SessionConnected(ConnectionEvent::new(ADDR, "client-1"))
        );
        assert_eq!(
            next(&mut client).await,
            OutputEvent::ConnectionOpened(ConnectionEvent::new(ADDR, "client-1"))
        );

        output.send_message(Bytes::from_static(b"ping")).unwrap();
        match next(&mut server).await {
            InputEvent::MessageReceived(msg) => assert_eq!(msg.payload, Bytes::from_static(b"ping")),
            other => panic!("Expected message, got {:?}", other),
        }

        input
            .send_response("client-1", Bytes::from_static(b"pong"))
            .unwrap();
        match next(&mut client).await {
            OutputEvent::MessageReceived(msg) => assert_eq!(msg.payload, Bytes::from_static(b"pong")),
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_without_listener_fails() {
        let network = MemoryNetwork::new();
        let output = network.output_channel(ADDR, None);

        assert_eq!(
            output.open_connection().await,
            Err(ChannelError::ConnectionFailed(ADDR.to_string()))
        );
        assert_eq!(
            output.send_message(Bytes::from_static(b"x")),
            Err(ChannelError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_validator_rejects_session() {
        let network = MemoryNetwork::new();
        let input = network.input_channel(ADDR);
        input.set_connect_validator(Some(Arc::new(|session_id: &str, _peer: &str| {
            session_id != "banned"
        })));
        input.start_listening().await.unwrap();

        let banned = network.output_channel(ADDR, Some("banned"));
        assert_eq!(
            banned.open_connection().await,
            Err(ChannelError::ConnectionRejected(ADDR.to_string()))
        );

        let allowed = network.output_channel(ADDR, Some("allowed"));
        allowed.open_connection().await.unwrap();
        assert_eq!(network.connection_count(ADDR), 1);
    }

    #[tokio::test]
    async fn test_link_down_resets_both_ends() {
        let network = MemoryNetwork::new();
        let input = network.input_channel(ADDR);
        let mut server = input_events(&input);
        input.start_listening().await.unwrap();

        let output = network.output_channel(ADDR, Some("s1"));
        let mut client = output_events(&output);
        output.open_connection().await.unwrap();
        next(&mut server).await;
        next(&mut client).await;

        network.set_link_state(ADDR, LinkState::Down);

        assert_eq!(
            next(&mut client).await,
            OutputEvent::ConnectionClosed(ConnectionEvent::new(ADDR, "s1"))
        );
        assert_eq!(
            next(&mut server).await,
            InputEvent::SessionDisconnected(ConnectionEvent::new(ADDR, "s1"))
        );
        assert!(!output.is_connected());
        assert!(output.open_connection().await.is_err());

        network.set_link_state(ADDR, LinkState::Up);
        output.open_connection().await.unwrap();
        assert_eq!(network.connection_count(ADDR), 1);
    }

    #[tokio::test]
    async fn test_silent_link_drops_without_notice() {
        let network = MemoryNetwork::new();
        let input = network.input_channel(ADDR);
        let mut server = input_events(&input);
        input.start_listening().await.unwrap();

        let output = network.output_channel(ADDR, Some("s1"));
        output.open_connection().await.unwrap();
        next(&mut server).await;

        network.set_link_state(ADDR, LinkState::Silent);
        output.send_message(Bytes::from_static(b"lost")).unwrap();
        assert!(output.is_connected());
        assert!(timeout(Duration::from_millis(50), server.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_same_session_supersedes_stale_connection() {
        let network = MemoryNetwork::new();
        let input = network.input_channel(ADDR);
        let mut server = input_events(&input);
        input.start_listening().await.unwrap();

        let first = network.output_channel(ADDR, Some("dup"));
        let mut first_events = output_events(&first);
        first.open_connection().await.unwrap();
        next(&mut first_events).await;
        next(&mut server).await;

        let second = network.output_channel(ADDR, Some("dup"));
        second.open_connection().await.unwrap();

        assert!(matches!(next(&mut first_events).await, OutputEvent::ConnectionClosed(_)));
        assert!(matches!(next(&mut server).await, InputEvent::SessionDisconnected(_)));
        assert!(matches!(next(&mut server).await, InputEvent::SessionConnected(_)));
        assert!(!first.is_connected());
        assert!(second.is_connected());
        assert_eq!(network.connection_count(ADDR), 1);
    }

    #[tokio::test]
    async fn test_second_listener_on_address_rejected() {
        let network = MemoryNetwork::new();
        let first = network.input_channel(ADDR);
        first.start_listening().await.unwrap();

        let second = network.input_channel(ADDR);
        assert_eq!(
            second.start_listening().await,
            Err(ChannelError::AddressInUse(ADDR.to_string()))
        );

        first.stop_listening();
        second.start_listening().await.unwrap();
        assert!(second.is_listening());
    }
}
