//! Message buffer.
//!
//! Hides short outages from the application. While a connection is down,
//! sends are queued and delivered in order once it comes back. If it stays
//! down longer than the maximum offline time the session is closed for good
//! and whatever was queued is discarded.
//!
//! The client half drives reconnection through a [`ReconnectPolicy`]; the
//! server half waits for the client to come back under the same session id.

use crate::config::{BufferConfig, ReconnectConfig};
use crate::reconnect::{ReconnectEvent, ReconnectPolicy};
use crate::session::{SessionInfo, SessionSlot, SessionState};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tether_channel::{
    ChannelError, ChannelResult, ConnectValidator, ConnectionEvent, Dispatcher, EventHandler,
    EventHub, InputChannel, InputEvent, MessagingSystem, OutputChannel, OutputEvent,
    SubscriptionId, SyncDispatcher,
};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Client half of the message buffer
pub struct BufferedOutputChannel {
    inner: Arc<OutputBuffer>,
}

struct OutputBuffer {
    channel: Arc<dyn OutputChannel>,
    policy: ReconnectPolicy,
    config: BufferConfig,
    runtime: Handle,
    slot: Mutex<SessionSlot>,
    hub: EventHub<OutputEvent>,
    channel_subscription: Mutex<Option<SubscriptionId>>,
    policy_subscription: Mutex<Option<SubscriptionId>>,
}

impl BufferedOutputChannel {
    /// Buffer sends on `channel` and keep it connected. Must be called within
    /// a Tokio runtime; timers and reconnect attempts run on it.
    pub fn new(
        channel: Arc<dyn OutputChannel>,
        config: BufferConfig,
        reconnect: ReconnectConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let policy = ReconnectPolicy::new(channel.clone(), reconnect, Arc::new(SyncDispatcher));
        let inner = Arc::new(OutputBuffer {
            channel,
            policy,
            config,
            runtime: Handle::current(),
            slot: Mutex::new(SessionSlot::new(SessionState::Disconnected)),
            hub: EventHub::new(dispatcher),
            channel_subscription: Mutex::new(None),
            policy_subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let id = inner.channel.subscribe(Arc::new(move |event: &OutputEvent| {
            if let Some(buffer) = weak.upgrade() {
                buffer.on_channel_event(event);
            }
        }));
        *inner.channel_subscription.lock() = Some(id);

        let weak = Arc::downgrade(&inner);
        let id = inner.policy.subscribe(Arc::new(move |event: &ReconnectEvent| {
            if let Some(buffer) = weak.upgrade() {
                buffer.on_policy_event(event);
            }
        }));
        *inner.policy_subscription.lock() = Some(id);

        Self { inner }
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.inner.slot.lock().state
    }

    /// Messages waiting for the connection to come back
    pub fn queued_messages(&self) -> usize {
        self.inner.slot.lock().queue.len()
    }

    /// Snapshot of this session
    pub fn info(&self) -> SessionInfo {
        self.inner
            .slot
            .lock()
            .info(self.inner.channel.channel_id(), self.inner.channel.session_id())
    }
}

impl OutputBuffer {
    fn event(&self) -> ConnectionEvent {
        ConnectionEvent::new(self.channel.channel_id(), self.channel.session_id())
    }

    fn arm_offline_timer(self: &Arc<Self>, slot: &mut SessionSlot) {
        let Some(deadline) = slot.offline_deadline(&self.config) else {
            return;
        };
        let generation = slot.next_timer();
        let weak = Arc::downgrade(self);
        slot.offline_timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(buffer) = weak.upgrade() {
                buffer.offline_deadline_passed(generation);
            }
        }));
    }

    fn on_channel_event(self: &Arc<Self>, event: &OutputEvent) {
        match event {
            OutputEvent::ConnectionClosed(e) => {
                let mut slot = self.slot.lock();
                if !slot.go_offline() {
                    return;
                }
                self.arm_offline_timer(&mut slot);
                drop(slot);

                info!(
                    "Connection {} -> {} lost; buffering for up to {:?}",
                    e.session_id, e.channel_id, self.config.max_offline_time
                );
                self.hub.raise(OutputEvent::ConnectionOffline(e.clone()));
            }
            OutputEvent::MessageReceived(msg) => {
                if self.slot.lock().state != SessionState::PermanentlyClosed {
                    self.hub.raise(OutputEvent::MessageReceived(msg.clone()));
                }
            }
            OutputEvent::ConnectionOpened(e) => {
                // Normally reported through the reconnect policy. An open that
                // completes after a terminal close must not stay up.
                if self.slot.lock().state == SessionState::PermanentlyClosed {
                    debug!("Late open of closed session {}; closing it", e.session_id);
                    self.channel.close_connection();
                }
            }
            OutputEvent::ConnectionOffline(_) => {}
        }
    }

    fn on_policy_event(self: &Arc<Self>, event: &ReconnectEvent) {
        match event {
            ReconnectEvent::ConnectionOpened(e) => self.flush(e),
            ReconnectEvent::ReconnectingFailed(_) => {
                self.terminate("reconnect attempts exhausted", None);
            }
        }
    }

    /// Deliver the queue in order, then switch to Open
    fn flush(&self, event: &ConnectionEvent) {
        let mut slot = self.slot.lock();
        match slot.state {
            SessionState::Connecting | SessionState::Buffering => {}
            SessionState::PermanentlyClosed => {
                drop(slot);
                debug!("Late open of closed session {}; closing it", event.session_id);
                self.channel.close_connection();
                return;
            }
            SessionState::Open | SessionState::Disconnected => return,
        }

        let mut flushed = 0;
        while let Some(payload) = slot.queue.pop_front() {
            match self.channel.send_message(payload.clone()) {
                Ok(()) => flushed += 1,
                Err(e) if !e.is_transient() => {
                    warn!(
                        "Dropped buffered message of {} bytes for {} ({})",
                        payload.len(),
                        event.channel_id,
                        e
                    );
                }
                Err(e) => {
                    slot.queue.push_front(payload);
                    warn!(
                        "Flush to {} interrupted after {} messages ({}); {} still buffered",
                        event.channel_id,
                        flushed,
                        e,
                        slot.queue.len()
                    );
                    return;
                }
            }
        }
        slot.mark_open();
        drop(slot);

        info!(
            "Connection {} -> {} open; flushed {} buffered messages",
            event.session_id, event.channel_id, flushed
        );
        self.hub.raise(OutputEvent::ConnectionOpened(event.clone()));
    }

    fn offline_deadline_passed(&self, generation: u64) {
        self.terminate("offline time exceeded", Some(generation));
    }

    /// Enter the terminal state. Raises ConnectionClosed unless the session
    /// was never opened. A timer passes its generation and only terminates a
    /// session that is still buffering under that timer.
    fn terminate(&self, reason: &str, timer: Option<u64>) {
        let (previous, dropped) = {
            let mut slot = self.slot.lock();
            let previous = slot.state;
            if previous == SessionState::PermanentlyClosed {
                return;
            }
            if let Some(generation) = timer {
                if slot.timer_generation != generation || !previous.is_buffering() {
                    return;
                }
                // Called from the timer task itself
                slot.offline_timer.take();
            }
            (previous, slot.purge())
        };

        self.policy.disable();
        self.channel.close_connection();

        let session_id = self.channel.session_id();
        if dropped > 0 {
            warn!("Session {} closed ({}); discarded {} buffered messages", session_id, reason, dropped);
        } else {
            info!("Session {} closed ({})", session_id, reason);
        }

        if previous != SessionState::Disconnected {
            self.hub.raise(OutputEvent::ConnectionClosed(self.event()));
        }
    }
}

#[async_trait]
impl OutputChannel for BufferedOutputChannel {
    fn channel_id(&self) -> &str {
        self.inner.channel.channel_id()
    }

    fn session_id(&self) -> &str {
        self.inner.channel.session_id()
    }

    /// Returns as soon as the session is armed. The first connection is made
    /// in the background; sends are buffered until it succeeds.
    async fn open_connection(&self) -> ChannelResult<()> {
        {
            let mut slot = self.inner.slot.lock();
            match slot.state {
                SessionState::PermanentlyClosed => return Err(ChannelError::Closed),
                SessionState::Connecting | SessionState::Open | SessionState::Buffering => {
                    return Ok(())
                }
                SessionState::Disconnected => {
                    slot.state = SessionState::Connecting;
                    slot.disconnected_at = Some(Instant::now());
                    self.inner.arm_offline_timer(&mut slot);
                }
            }
        }

        debug!(
            "Opening buffered connection {} -> {}",
            self.session_id(),
            self.channel_id()
        );
        self.inner.policy.enable();
        self.inner.policy.trigger();
        Ok(())
    }

    fn close_connection(&self) {
        self.inner.terminate("closed by application", None);
    }

    fn is_connected(&self) -> bool {
        self.inner.slot.lock().state == SessionState::Open
    }

    fn send_message(&self, payload: Bytes) -> ChannelResult<()> {
        let inner = &self.inner;
        let mut slot = inner.slot.lock();
        match slot.state {
            SessionState::Open => {
                let error = match inner.channel.send_message(payload.clone()) {
                    Ok(()) => return Ok(()),
                    Err(e) if !e.is_transient() => return Err(e),
                    Err(e) => e,
                };

                slot.go_offline();
                inner.arm_offline_timer(&mut slot);
                slot.queue.push_back(payload);
                drop(slot);

                debug!("Send to {} failed ({}); buffering", self.channel_id(), error);
                inner.hub.raise(OutputEvent::ConnectionOffline(inner.event()));
                // Recycle the connection so the reconnect policy takes over
                inner.channel.close_connection();
                inner.policy.trigger();
                Ok(())
            }
            SessionState::Connecting | SessionState::Buffering => {
                slot.enqueue(payload, &inner.config)
            }
            SessionState::Disconnected => Err(ChannelError::NotConnected),
            SessionState::PermanentlyClosed => Err(ChannelError::Closed),
        }
    }

    fn subscribe(&self, handler: EventHandler<OutputEvent>) -> SubscriptionId {
        self.inner.hub.subscribe(handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.hub.unsubscribe(id);
    }
}

impl Drop for BufferedOutputChannel {
    fn drop(&mut self) {
        self.inner.policy.disable();
        if let Some(id) = self.inner.channel_subscription.lock().take() {
            self.inner.channel.unsubscribe(id);
        }
        if let Some(id) = self.inner.policy_subscription.lock().take() {
            self.inner.policy.unsubscribe(id);
        }
        self.inner.slot.lock().cancel_timer();
    }
}

type SharedSlot = Arc<Mutex<SessionSlot>>;

/// Server half of the message buffer
pub struct BufferedInputChannel {
    inner: Arc<InputBuffer>,
}

struct InputBuffer {
    channel: Arc<dyn InputChannel>,
    config: BufferConfig,
    runtime: Handle,
    sessions: DashMap<String, SharedSlot>,
    hub: EventHub<InputEvent>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl BufferedInputChannel {
    /// Buffer responses per session on `channel`. Must be called within a
    /// Tokio runtime; offline timers run on it.
    pub fn new(
        channel: Arc<dyn InputChannel>,
        config: BufferConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let inner = Arc::new(InputBuffer {
            channel,
            config,
            runtime: Handle::current(),
            sessions: DashMap::new(),
            hub: EventHub::new(dispatcher),
            subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let id = inner.channel.subscribe(Arc::new(move |event: &InputEvent| {
            if let Some(buffer) = weak.upgrade() {
                buffer.on_channel_event(event);
            }
        }));
        *inner.subscription.lock() = Some(id);

        Self { inner }
    }

    /// Snapshot of every known session
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let slots: Vec<(String, SharedSlot)> = self
            .inner
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let channel_id = self.inner.channel.channel_id();
        slots
            .into_iter()
            .map(|(session_id, slot)| slot.lock().info(channel_id, &session_id))
            .collect()
    }

    /// State of one session
    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        let slot = self.inner.slot(session_id)?;
        let state = slot.lock().state;
        Some(state)
    }
}

impl InputBuffer {
    fn event(&self, session_id: &str) -> ConnectionEvent {
        ConnectionEvent::new(self.channel.channel_id(), session_id)
    }

    // Clones the slot out so no map guard is held while it is locked
    fn slot(&self, session_id: &str) -> Option<SharedSlot> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    fn arm_offline_timer(self: &Arc<Self>, session_id: &str, shared: &SharedSlot, slot: &mut SessionSlot) {
        let Some(deadline) = slot.offline_deadline(&self.config) else {
            return;
        };
        let generation = slot.next_timer();
        let weak: Weak<InputBuffer> = Arc::downgrade(self);
        let target = Arc::downgrade(shared);
        let session_id = session_id.to_string();
        slot.offline_timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let (Some(buffer), Some(shared)) = (weak.upgrade(), target.upgrade()) {
                buffer.offline_deadline_passed(&session_id, &shared, generation);
            }
        }));
    }

    fn on_channel_event(self: &Arc<Self>, event: &InputEvent) {
        match event {
            InputEvent::SessionConnected(e) => self.on_connected(e),
            InputEvent::SessionDisconnected(e) => {
                let Some(shared) = self.slot(&e.session_id) else {
                    return;
                };
                let mut slot = shared.lock();
                if !slot.go_offline() {
                    return;
                }
                self.arm_offline_timer(&e.session_id, &shared, &mut slot);
                drop(slot);

                info!(
                    "Session {} on {} offline; buffering for up to {:?}",
                    e.session_id, e.channel_id, self.config.max_offline_time
                );
                self.hub.raise(InputEvent::SessionOffline(e.clone()));
            }
            InputEvent::MessageReceived(msg) => {
                self.hub.raise(InputEvent::MessageReceived(msg.clone()));
            }
            InputEvent::SessionOffline(_) | InputEvent::SessionOnline(_) => {}
        }
    }

    fn on_connected(&self, event: &ConnectionEvent) {
        let session_id = &event.session_id;
        let mut created = false;
        let shared = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(SessionSlot::new(SessionState::Open)))
            })
            .value()
            .clone();

        if created {
            info!("Session {} connected to {}", session_id, event.channel_id);
            self.hub.raise(InputEvent::SessionConnected(event.clone()));
            return;
        }

        let mut slot = shared.lock();
        match slot.state {
            SessionState::Buffering => {}
            SessionState::PermanentlyClosed => {
                drop(slot);
                // Expired session coming back; start over
                self.sessions.insert(
                    session_id.clone(),
                    Arc::new(Mutex::new(SessionSlot::new(SessionState::Open))),
                );
                info!("Session {} reconnected to {} after expiry", session_id, event.channel_id);
                self.hub.raise(InputEvent::SessionConnected(event.clone()));
                return;
            }
            _ => {
                debug!("Session {} already connected to {}", session_id, event.channel_id);
                return;
            }
        }

        let mut flushed = 0;
        while let Some(payload) = slot.queue.pop_front() {
            match self.channel.send_response(session_id, payload.clone()) {
                Ok(()) => flushed += 1,
                Err(e) if !e.is_transient() => {
                    warn!(
                        "Dropped buffered response of {} bytes for session {} ({})",
                        payload.len(),
                        session_id,
                        e
                    );
                }
                Err(e) => {
                    slot.queue.push_front(payload);
                    warn!(
                        "Flush to session {} interrupted after {} messages ({}); {} still buffered",
                        session_id,
                        flushed,
                        e,
                        slot.queue.len()
                    );
                    return;
                }
            }
        }
        slot.mark_open();
        drop(slot);

        info!(
            "Session {} back on {}; flushed {} buffered messages",
            session_id, event.channel_id, flushed
        );
        self.hub.raise(InputEvent::SessionOnline(event.clone()));
    }

    fn offline_deadline_passed(&self, session_id: &str, shared: &SharedSlot, generation: u64) {
        let dropped = {
            let mut slot = shared.lock();
            if slot.timer_generation != generation || slot.state != SessionState::Buffering {
                return;
            }
            // Called from the timer task itself
            slot.offline_timer.take();
            slot.purge()
        };

        self.sessions
            .remove_if(session_id, |_, current| Arc::ptr_eq(current, shared));
        self.channel.disconnect_session(session_id);

        if dropped > 0 {
            warn!(
                "Session {} offline for more than {:?}; discarded {} buffered messages",
                session_id, self.config.max_offline_time, dropped
            );
        } else {
            info!(
                "Session {} offline for more than {:?}; disconnected",
                session_id, self.config.max_offline_time
            );
        }
        self.hub
            .raise(InputEvent::SessionDisconnected(self.event(session_id)));
    }
}

#[async_trait]
impl InputChannel for BufferedInputChannel {
    fn channel_id(&self) -> &str {
        self.inner.channel.channel_id()
    }

    async fn start_listening(&self) -> ChannelResult<()> {
        self.inner.channel.start_listening().await
    }

    fn stop_listening(&self) {
        let slots: Vec<SharedSlot> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.sessions.clear();

        let dropped: usize = slots.iter().map(|slot| slot.lock().purge()).sum();
        if dropped > 0 {
            warn!(
                "Stopped listening on {}; discarded {} buffered messages",
                self.channel_id(),
                dropped
            );
        }
        self.inner.channel.stop_listening();
    }

    fn is_listening(&self) -> bool {
        self.inner.channel.is_listening()
    }

    fn send_response(&self, session_id: &str, payload: Bytes) -> ChannelResult<()> {
        let inner = &self.inner;
        let shared = inner
            .slot(session_id)
            .ok_or_else(|| ChannelError::SessionNotFound(session_id.to_string()))?;

        let mut slot = shared.lock();
        match slot.state {
            SessionState::Open => {
                let error = match inner.channel.send_response(session_id, payload.clone()) {
                    Ok(()) => return Ok(()),
                    Err(e) if !e.is_transient() => return Err(e),
                    Err(e) => e,
                };

                slot.go_offline();
                inner.arm_offline_timer(session_id, &shared, &mut slot);
                slot.queue.push_back(payload);
                drop(slot);

                debug!("Response to session {} failed ({}); buffering", session_id, error);
                inner
                    .hub
                    .raise(InputEvent::SessionOffline(inner.event(session_id)));
                inner.channel.disconnect_session(session_id);
                Ok(())
            }
            SessionState::Buffering | SessionState::Connecting => {
                slot.enqueue(payload, &inner.config)
            }
            SessionState::PermanentlyClosed => Err(ChannelError::Closed),
            SessionState::Disconnected => Err(ChannelError::NotConnected),
        }
    }

    fn disconnect_session(&self, session_id: &str) {
        let Some((_, shared)) = self.inner.sessions.remove(session_id) else {
            return;
        };
        let dropped = shared.lock().purge();
        self.inner.channel.disconnect_session(session_id);

        if dropped > 0 {
            warn!("Session {} disconnected; discarded {} buffered messages", session_id, dropped);
        }
        self.inner
            .hub
            .raise(InputEvent::SessionDisconnected(self.inner.event(session_id)));
    }

    fn set_connect_validator(&self, validator: Option<ConnectValidator>) {
        self.inner.channel.set_connect_validator(validator);
    }

    fn subscribe(&self, handler: EventHandler<InputEvent>) -> SubscriptionId {
        self.inner.hub.subscribe(handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.hub.unsubscribe(id);
    }
}

impl Drop for BufferedInputChannel {
    fn drop(&mut self) {
        if let Some(id) = self.inner.subscription.lock().take() {
            self.inner.channel.unsubscribe(id);
        }
        let slots: Vec<SharedSlot> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for slot in slots {
            slot.lock().cancel_timer();
        }
    }
}

/// Messaging system that buffers every channel of an underlying system
pub struct BufferedMessaging {
    underlying: Arc<dyn MessagingSystem>,
    buffer: BufferConfig,
    reconnect: ReconnectConfig,
    dispatcher: Arc<dyn Dispatcher>,
}

impl BufferedMessaging {
    /// Buffer channels of `underlying`. Events reach the application through
    /// `dispatcher`.
    pub fn new(
        underlying: Arc<dyn MessagingSystem>,
        buffer: BufferConfig,
        reconnect: ReconnectConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            underlying,
            buffer,
            reconnect,
            dispatcher,
        }
    }

    /// Create a buffered client channel
    pub fn create_buffered_output(
        &self,
        channel_id: &str,
        session_id: Option<&str>,
    ) -> ChannelResult<BufferedOutputChannel> {
        let channel = self
            .underlying
            .create_output_channel(channel_id, session_id)?;
        Ok(BufferedOutputChannel::new(
            channel,
            self.buffer.clone(),
            self.reconnect.clone(),
            self.dispatcher.clone(),
        ))
    }

    /// Create a buffered server channel
    pub fn create_buffered_input(&self, channel_id: &str) -> ChannelResult<BufferedInputChannel> {
        let channel = self.underlying.create_input_channel(channel_id)?;
        Ok(BufferedInputChannel::new(
            channel,
            self.buffer.clone(),
            self.dispatcher.clone(),
        ))
    }
}

impl MessagingSystem for BufferedMessaging {
    fn create_output_channel(
        &self,
        channel_id: &str,
        session_id: Option<&str>,
    ) -> ChannelResult<Arc<dyn OutputChannel>> {
        Ok(Arc::new(self.create_buffered_output(channel_id, session_id)?))
    }

    fn create_input_channel(&self, channel_id: &str) -> ChannelResult<Arc<dyn InputChannel>> {
        Ok(Arc::new(self.create_buffered_input(channel_id)?))
    }
}
