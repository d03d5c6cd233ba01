//! Helpers shared by the unit tests of this crate.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_channel::{
    ChannelError, ChannelResult, ConnectionEvent, EventHandler, EventHub, InputChannel,
    InputEvent, OutputChannel, OutputEvent, SubscriptionId, SyncDispatcher,
};
use tokio::sync::mpsc;

pub fn output_events(channel: &dyn OutputChannel) -> mpsc::UnboundedReceiver<OutputEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    channel.subscribe(Arc::new(move |event: &OutputEvent| {
        tx.send(event.clone()).ok();
    }));
    rx
}

pub fn input_events(channel: &dyn InputChannel) -> mpsc::UnboundedReceiver<InputEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    channel.subscribe(Arc::new(move |event: &InputEvent| {
        tx.send(event.clone()).ok();
    }));
    rx
}

/// Next event, failing the test after ten (possibly virtual) seconds
pub async fn next_event<E>(rx: &mut mpsc::UnboundedReceiver<E>) -> E {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("event timeout")
        .expect("event channel closed")
}

/// Let `period` pass, then return everything that was raised meanwhile
pub async fn quiet_for<E>(rx: &mut mpsc::UnboundedReceiver<E>, period: Duration) -> Vec<E> {
    tokio::time::sleep(period).await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Output channel whose opens fail on demand. Counts overlapping opens.
pub struct FlakyOutputChannel {
    hub: EventHub<OutputEvent>,
    connected: AtomicBool,
    fail_remaining: AtomicU32,
    open_calls: AtomicU32,
    in_flight: AtomicU32,
    overlaps: AtomicU32,
    open_delay: Duration,
    blocking_open: Duration,
    max_payload: Option<usize>,
    sent: Mutex<Vec<Bytes>>,
}

impl FlakyOutputChannel {
    /// The first `failures` opens fail
    pub fn new(failures: u32) -> Self {
        Self {
            hub: EventHub::new(Arc::new(SyncDispatcher)),
            connected: AtomicBool::new(false),
            fail_remaining: AtomicU32::new(failures),
            open_calls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            overlaps: AtomicU32::new(0),
            open_delay: Duration::ZERO,
            blocking_open: Duration::ZERO,
            max_payload: None,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Opens hold their worker thread for `delay`, so aborting the task
    /// that awaits them cannot cut them short
    pub fn with_blocking_open(mut self, delay: Duration) -> Self {
        self.blocking_open = delay;
        self
    }

    /// Sends larger than `max` fail with a protocol error
    pub fn with_max_payload(mut self, max: usize) -> Self {
        self.max_payload = Some(max);
        self
    }

    pub fn fail_next_opens(&self, failures: u32) {
        self.fail_remaining.store(failures, Ordering::SeqCst);
    }

    /// Simulate the transport dropping the connection
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.hub.raise(OutputEvent::ConnectionClosed(self.event()));
    }

    pub fn open_calls(&self) -> u32 {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn overlapping_opens(&self) -> u32 {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    fn event(&self) -> ConnectionEvent {
        ConnectionEvent::new("flaky://addr", "flaky")
    }
}

#[async_trait]
impl OutputChannel for FlakyOutputChannel {
    fn channel_id(&self) -> &str {
        "flaky://addr"
    }

    fn session_id(&self) -> &str {
        "flaky"
    }

    async fn open_connection(&self) -> ChannelResult<()> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if !self.blocking_open.is_zero() {
            std::thread::sleep(self.blocking_open);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChannelError::ConnectionFailed("flaky://addr".to_string()));
        }

        self.connected.store(true, Ordering::SeqCst);
        self.hub.raise(OutputEvent::ConnectionOpened(self.event()));
        Ok(())
    }

    fn close_connection(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.hub.raise(OutputEvent::ConnectionClosed(self.event()));
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send_message(&self, payload: Bytes) -> ChannelResult<()> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        if let Some(max) = self.max_payload {
            if payload.len() > max {
                return Err(ChannelError::Protocol(format!("{} bytes exceeds {}", payload.len(), max)));
            }
        }
        self.sent.lock().push(payload);
        Ok(())
    }

    fn subscribe(&self, handler: EventHandler<OutputEvent>) -> SubscriptionId {
        self.hub.subscribe(handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.hub.unsubscribe(id);
    }
}
