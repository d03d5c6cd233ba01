//! Connection monitor.
//!
//! Wraps a transport channel and detects silently dead connections. The
//! client side sends a PING whenever it has been idle for a ping interval and
//! treats the connection as lost when no matching PING_ACK arrives within the
//! ping timeout. The server side answers PINGs and disconnects sessions that
//! stay silent longer than the ping timeout.
//!
//! Every payload is wrapped in a [`MonitorEnvelope`]; heartbeats never reach
//! the layer above.

use crate::config::HeartbeatConfig;
use crate::keepalive::{now_corr_id, KeepaliveState};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tether_channel::{
    ChannelError, ChannelResult, ConnectValidator, ConnectionEvent, Dispatcher, EventHandler,
    EventHub, InputChannel, InputEvent, MessageEvent, MessagingSystem, OutputChannel, OutputEvent,
    SubscriptionId, SyncDispatcher,
};
use tether_wire::{CborCodec, EnvelopeCodec, MonitorEnvelope};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Client half of the connection monitor
pub struct MonitoredOutputChannel {
    inner: Arc<OutputMonitor>,
}

struct OutputMonitor {
    channel: Arc<dyn OutputChannel>,
    codec: Arc<dyn EnvelopeCodec>,
    config: HeartbeatConfig,
    runtime: Handle,
    state: Mutex<OutputMonitorState>,
    hub: EventHub<OutputEvent>,
    subscription: Mutex<Option<SubscriptionId>>,
}

struct OutputMonitorState {
    connected: bool,
    generation: u64,
    last_sent: Instant,
    keepalive: KeepaliveState,
    ping_task: Option<JoinHandle<()>>,
}

enum PingStep {
    Stop,
    Skip,
    Wait(u64, Arc<Notify>),
}

impl MonitoredOutputChannel {
    /// Wrap `channel`. Must be called within a Tokio runtime; the ping loop
    /// runs on it.
    pub fn new(
        channel: Arc<dyn OutputChannel>,
        codec: Arc<dyn EnvelopeCodec>,
        config: HeartbeatConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let inner = Arc::new(OutputMonitor {
            channel,
            codec,
            config,
            runtime: Handle::current(),
            state: Mutex::new(OutputMonitorState {
                connected: false,
                generation: 0,
                last_sent: Instant::now(),
                keepalive: KeepaliveState::new(),
                ping_task: None,
            }),
            hub: EventHub::new(dispatcher),
            subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let id = inner.channel.subscribe(Arc::new(move |event: &OutputEvent| {
            if let Some(monitor) = weak.upgrade() {
                monitor.on_transport_event(event);
            }
        }));
        *inner.subscription.lock() = Some(id);

        Self { inner }
    }

    /// Most recent heartbeat round-trip time
    pub fn last_rtt(&self) -> Option<std::time::Duration> {
        self.inner.state.lock().keepalive.last_rtt()
    }
}

impl OutputMonitor {
    fn event(&self) -> ConnectionEvent {
        ConnectionEvent::new(self.channel.channel_id(), self.channel.session_id())
    }

    fn on_transport_event(self: &Arc<Self>, event: &OutputEvent) {
        match event {
            OutputEvent::ConnectionOpened(e) => {
                let mut state = self.state.lock();
                if state.connected {
                    return;
                }
                state.connected = true;
                state.generation += 1;
                state.last_sent = Instant::now();
                state.keepalive.clear();
                state.ping_task = Some(self.runtime.spawn(ping_loop(
                    Arc::downgrade(self),
                    state.generation,
                    self.config.clone(),
                )));
                drop(state);

                debug!("Monitoring {} -> {}", e.session_id, e.channel_id);
                self.hub.raise(OutputEvent::ConnectionOpened(e.clone()));
            }
            OutputEvent::ConnectionClosed(e) => {
                if self.mark_disconnected() {
                    debug!("Transport closed {} -> {}", e.session_id, e.channel_id);
                    self.hub.raise(OutputEvent::ConnectionClosed(e.clone()));
                }
            }
            OutputEvent::ConnectionOffline(_) => {}
            OutputEvent::MessageReceived(msg) => match self.codec.decode(&msg.payload) {
                Ok(MonitorEnvelope::Message { payload }) => {
                    self.hub.raise(OutputEvent::MessageReceived(MessageEvent {
                        channel_id: msg.channel_id.clone(),
                        session_id: msg.session_id.clone(),
                        payload,
                    }));
                }
                Ok(MonitorEnvelope::PingAck { corr_id }) => self.on_ping_ack(corr_id),
                Ok(MonitorEnvelope::Ping { .. }) => {
                    debug!("Unexpected PING on client channel {}; ignoring", msg.channel_id);
                }
                Err(e) => {
                    warn!("Dropping malformed envelope from {}: {}", msg.channel_id, e);
                }
            },
        }
    }

    fn on_ping_ack(&self, corr_id: u64) {
        let rtt = self.state.lock().keepalive.process_ack(corr_id);
        match rtt {
            Some(rtt) => trace!("RTT to {}: {:?}", self.channel.channel_id(), rtt),
            None => debug!("Ignoring stale PING_ACK {:#x}", corr_id),
        }
    }

    /// Returns true when the connection was considered up
    fn mark_disconnected(&self) -> bool {
        let mut state = self.state.lock();
        if !state.connected {
            return false;
        }
        state.connected = false;
        state.generation += 1;
        state.keepalive.clear();
        if let Some(task) = state.ping_task.take() {
            task.abort();
        }
        true
    }

    fn begin_ping(&self, generation: u64) -> PingStep {
        let (corr_id, acked) = {
            let mut state = self.state.lock();
            if !state.connected || state.generation != generation {
                return PingStep::Stop;
            }
            if state.last_sent.elapsed() < self.config.ping_interval {
                return PingStep::Skip;
            }
            let corr_id = now_corr_id();
            (corr_id, state.keepalive.record_ping(corr_id))
        };

        match self.codec.encode(&MonitorEnvelope::Ping { corr_id }) {
            Ok(frame) => {
                if let Err(e) = self.channel.send_message(frame) {
                    // The ack deadline decides; the transport may still report the drop itself
                    debug!("PING to {} not sent: {}", self.channel.channel_id(), e);
                }
            }
            Err(e) => {
                warn!("Failed to encode PING: {}", e);
                return PingStep::Skip;
            }
        }

        PingStep::Wait(corr_id, acked)
    }

    /// Returns true when the ping loop should stop
    fn ping_timed_out(&self, generation: u64, corr_id: u64) -> bool {
        let mut state = self.state.lock();
        if !state.connected || state.generation != generation {
            return true;
        }
        if !state.keepalive.expire(corr_id) {
            return false;
        }
        state.connected = false;
        state.generation += 1;
        // Called from the ping task itself
        state.ping_task.take();
        drop(state);

        warn!(
            "No PING_ACK from {} within {:?}; connection lost",
            self.channel.channel_id(),
            self.config.ping_timeout
        );
        self.hub.raise(OutputEvent::ConnectionClosed(self.event()));
        self.channel.close_connection();
        true
    }
}

async fn ping_loop(monitor: Weak<OutputMonitor>, generation: u64, config: HeartbeatConfig) {
    let mut ticker = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let (corr_id, acked) = {
            let Some(monitor) = monitor.upgrade() else {
                return;
            };
            match monitor.begin_ping(generation) {
                PingStep::Stop => return,
                PingStep::Skip => continue,
                PingStep::Wait(corr_id, acked) => (corr_id, acked),
            }
        };

        if tokio::time::timeout(config.ping_timeout, acked.notified())
            .await
            .is_ok()
        {
            continue;
        }

        let Some(monitor) = monitor.upgrade() else {
            return;
        };
        if monitor.ping_timed_out(generation, corr_id) {
            return;
        }
    }
}

#[async_trait]
impl OutputChannel for MonitoredOutputChannel {
    fn channel_id(&self) -> &str {
        self.inner.channel.channel_id()
    }

    fn session_id(&self) -> &str {
        self.inner.channel.session_id()
    }

    async fn open_connection(&self) -> ChannelResult<()> {
        self.inner.channel.open_connection().await
    }

    fn close_connection(&self) {
        let was_connected = self.inner.mark_disconnected();
        self.inner.channel.close_connection();
        if was_connected {
            self.inner
                .hub
                .raise(OutputEvent::ConnectionClosed(self.inner.event()));
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    fn send_message(&self, payload: Bytes) -> ChannelResult<()> {
        {
            let mut state = self.inner.state.lock();
            if !state.connected {
                return Err(ChannelError::NotConnected);
            }
            state.last_sent = Instant::now();
        }

        let frame = self
            .inner
            .codec
            .encode(&MonitorEnvelope::Message { payload })
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;
        self.inner.channel.send_message(frame)
    }

    fn subscribe(&self, handler: EventHandler<OutputEvent>) -> SubscriptionId {
        self.inner.hub.subscribe(handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.hub.unsubscribe(id);
    }
}

impl Drop for MonitoredOutputChannel {
    fn drop(&mut self) {
        if let Some(id) = self.inner.subscription.lock().take() {
            self.inner.channel.unsubscribe(id);
        }
        if let Some(task) = self.inner.state.lock().ping_task.take() {
            task.abort();
        }
    }
}

/// Server half of the connection monitor
pub struct MonitoredInputChannel {
    inner: Arc<InputMonitor>,
}

struct InputMonitor {
    channel: Arc<dyn InputChannel>,
    codec: Arc<dyn EnvelopeCodec>,
    config: HeartbeatConfig,
    runtime: Handle,
    last_seen: DashMap<String, Instant>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
    hub: EventHub<InputEvent>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl MonitoredInputChannel {
    /// Wrap `channel`. Must be called within a Tokio runtime; the liveness
    /// sweep runs on it.
    pub fn new(
        channel: Arc<dyn InputChannel>,
        codec: Arc<dyn EnvelopeCodec>,
        config: HeartbeatConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let inner = Arc::new(InputMonitor {
            channel,
            codec,
            config,
            runtime: Handle::current(),
            last_seen: DashMap::new(),
            sweep_task: Mutex::new(None),
            hub: EventHub::new(dispatcher),
            subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let id = inner.channel.subscribe(Arc::new(move |event: &InputEvent| {
            if let Some(monitor) = weak.upgrade() {
                monitor.on_transport_event(event);
            }
        }));
        *inner.subscription.lock() = Some(id);

        Self { inner }
    }

    /// Sessions currently considered alive
    pub fn live_sessions(&self) -> Vec<String> {
        self.inner
            .last_seen
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl InputMonitor {
    fn on_transport_event(&self, event: &InputEvent) {
        match event {
            InputEvent::SessionConnected(e) => {
                self.last_seen.insert(e.session_id.clone(), Instant::now());
                debug!("Monitoring session {} on {}", e.session_id, e.channel_id);
                self.hub.raise(InputEvent::SessionConnected(e.clone()));
            }
            InputEvent::SessionDisconnected(e) => {
                if self.last_seen.remove(&e.session_id).is_some() {
                    self.hub.raise(InputEvent::SessionDisconnected(e.clone()));
                }
            }
            InputEvent::SessionOffline(_) | InputEvent::SessionOnline(_) => {}
            InputEvent::MessageReceived(msg) => match self.codec.decode(&msg.payload) {
                Ok(MonitorEnvelope::Ping { corr_id }) => {
                    self.touch(&msg.session_id);
                    self.answer_ping(&msg.session_id, corr_id);
                }
                Ok(MonitorEnvelope::Message { payload }) => {
                    self.touch(&msg.session_id);
                    self.hub.raise(InputEvent::MessageReceived(MessageEvent {
                        channel_id: msg.channel_id.clone(),
                        session_id: msg.session_id.clone(),
                        payload,
                    }));
                }
                Ok(MonitorEnvelope::PingAck { .. }) => {
                    debug!("Unexpected PING_ACK from session {}; ignoring", msg.session_id);
                }
                Err(e) => {
                    warn!("Dropping malformed envelope from session {}: {}", msg.session_id, e);
                }
            },
        }
    }

    fn touch(&self, session_id: &str) {
        match self.last_seen.get_mut(session_id) {
            Some(mut seen) => *seen = Instant::now(),
            None => trace!("Traffic from untracked session {}", session_id),
        }
    }

    fn answer_ping(&self, session_id: &str, corr_id: u64) {
        let result = self
            .codec
            .encode(&MonitorEnvelope::PingAck { corr_id })
            .map_err(|e| ChannelError::Protocol(e.to_string()))
            .and_then(|frame| self.channel.send_response(session_id, frame));
        if let Err(e) = result {
            debug!("PING_ACK to session {} not sent: {}", session_id, e);
        }
    }

    fn sweep(&self) {
        let now = Instant::now();
        let timeout = self.config.ping_timeout;
        let expired: Vec<String> = self
            .last_seen
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) > timeout)
            .map(|entry| entry.key().clone())
            .collect();

        for session_id in expired {
            let removed = self
                .last_seen
                .remove_if(&session_id, |_, seen| now.duration_since(*seen) > timeout);
            if removed.is_none() {
                continue;
            }

            warn!(
                "Session {} on {} silent for more than {:?}; disconnecting",
                session_id,
                self.channel.channel_id(),
                timeout
            );
            self.channel.disconnect_session(&session_id);
            self.hub.raise(InputEvent::SessionDisconnected(ConnectionEvent::new(
                self.channel.channel_id(),
                session_id,
            )));
        }
    }
}

async fn sweep_loop(monitor: Weak<InputMonitor>, config: HeartbeatConfig) {
    let mut ticker = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match monitor.upgrade() {
            Some(monitor) => monitor.sweep(),
            None => return,
        }
    }
}

#[async_trait]
impl InputChannel for MonitoredInputChannel {
    fn channel_id(&self) -> &str {
        self.inner.channel.channel_id()
    }

    async fn start_listening(&self) -> ChannelResult<()> {
        self.inner.channel.start_listening().await?;

        let mut sweep = self.inner.sweep_task.lock();
        if sweep.is_none() {
            *sweep = Some(self.inner.runtime.spawn(sweep_loop(
                Arc::downgrade(&self.inner),
                self.inner.config.clone(),
            )));
        }
        info!(
            "Monitoring {} (sweep every {:?}, timeout {:?})",
            self.inner.channel.channel_id(),
            self.inner.config.ping_interval,
            self.inner.config.ping_timeout
        );
        Ok(())
    }

    fn stop_listening(&self) {
        if let Some(task) = self.inner.sweep_task.lock().take() {
            task.abort();
        }
        self.inner.last_seen.clear();
        self.inner.channel.stop_listening();
    }

    fn is_listening(&self) -> bool {
        self.inner.channel.is_listening()
    }

    fn send_response(&self, session_id: &str, payload: Bytes) -> ChannelResult<()> {
        let frame = self
            .inner
            .codec
            .encode(&MonitorEnvelope::Message { payload })
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;
        self.inner.channel.send_response(session_id, frame)
    }

    fn disconnect_session(&self, session_id: &str) {
        let tracked = self.inner.last_seen.remove(session_id).is_some();
        self.inner.channel.disconnect_session(session_id);
        if tracked {
            self.inner
                .hub
                .raise(InputEvent::SessionDisconnected(ConnectionEvent::new(
                    self.inner.channel.channel_id(),
                    session_id,
                )));
        }
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

impl Drop for MonitoredInputChannel {
    fn drop(&mut self) {
        if let Some(id) = self.inner.subscription.lock().take() {
            self.inner.channel.unsubscribe(id);
        }
        if let Some(task) = self.inner.sweep_task.lock().take() {
            task.abort();
        }
    }
}

/// Messaging system that wraps every channel of a transport in a monitor
pub struct MonitoredMessaging {
    transport: Arc<dyn MessagingSystem>,
    config: HeartbeatConfig,
    codec: Arc<dyn EnvelopeCodec>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl MonitoredMessaging {
    /// Monitor channels of `transport` with CBOR envelopes
    pub fn new(transport: Arc<dyn MessagingSystem>, config: HeartbeatConfig) -> Self {
        Self {
            transport,
            config,
            codec: Arc::new(CborCodec),
            dispatcher: Arc::new(SyncDispatcher),
        }
    }

    /// Use a different envelope codec. Both ends must agree.
    pub fn with_codec(mut self, codec: Arc<dyn EnvelopeCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Deliver monitor events through `dispatcher`
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Create a monitored client channel
    pub fn create_monitored_output(
        &self,
        channel_id: &str,
        session_id: Option<&str>,
    ) -> ChannelResult<MonitoredOutputChannel> {
        let transport = self
            .transport
            .create_output_channel(channel_id, session_id)?;
        Ok(MonitoredOutputChannel::new(
            transport,
            self.codec.clone(),
            self.config.clone(),
            self.dispatcher.clone(),
        ))
    }

    /// Create a monitored server channel
    pub fn create_monitored_input(&self, channel_id: &str) -> ChannelResult<MonitoredInputChannel> {
        let transport = self.transport.create_input_channel(channel_id)?;
        Ok(MonitoredInputChannel::new(
            transport,
            self.codec.clone(),
            self.config.clone(),
            self.dispatcher.clone(),
        ))
    }
}

impl MessagingSystem for MonitoredMessaging {
    fn create_output_channel(
        &self,
        channel_id: &str,
        session_id: Option<&str>,
    ) -> ChannelResult<Arc<dyn OutputChannel>> {
        Ok(Arc::new(self.create_monitored_output(channel_id, session_id)?))
    }

    fn create_input_channel(&self, channel_id: &str) -> ChannelResult<Arc<dyn InputChannel>> {
        Ok(Arc::new(self.create_monitored_input(channel_id)?))
    }
}
