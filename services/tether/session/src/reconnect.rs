//! Reconnect policy.
//!
//! Watches an output channel and reopens it after it closes, one attempt at
//! a time, waiting the retry interval before each retry. After the configured
//! number of failed retries it gives up and reports `ReconnectingFailed`.

use crate::config::ReconnectConfig;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tether_channel::{
    ChannelResult, ConnectionEvent, Dispatcher, EventHandler, EventHub, OutputChannel,
    OutputEvent, SubscriptionId,
};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Events raised by a [`ReconnectPolicy`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectEvent {
    /// The channel is connected again; the retry counter was reset
    ConnectionOpened(ConnectionEvent),
    /// Retries are exhausted. The policy stops until re-enabled.
    ReconnectingFailed(ConnectionEvent),
}

/// Keeps an output channel connected
pub struct ReconnectPolicy {
    inner: Arc<PolicyInner>,
}

struct PolicyInner {
    channel: Arc<dyn OutputChannel>,
    config: ReconnectConfig,
    runtime: Handle,
    state: Mutex<PolicyState>,
    hub: EventHub<ReconnectEvent>,
}

#[derive(Default)]
struct PolicyState {
    enabled: bool,
    exhausted: bool,
    generation: u64,
    retries: u32,
    attempt: Option<JoinHandle<()>>,
    // A close was reported while an attempt was in flight
    close_pending: bool,
    subscription: Option<SubscriptionId>,
}

impl ReconnectPolicy {
    /// Create a disabled policy for `channel`. Must be called within a Tokio
    /// runtime; attempts run on it.
    pub fn new(
        channel: Arc<dyn OutputChannel>,
        config: ReconnectConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(PolicyInner {
                channel,
                config,
                runtime: Handle::current(),
                state: Mutex::new(PolicyState::default()),
                hub: EventHub::new(dispatcher),
            }),
        }
    }

    /// Start watching the channel
    pub fn enable(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.enabled {
                return;
            }
            state.enabled = true;
            state.exhausted = false;
            state.retries = 0;
            state.close_pending = false;
            state.generation += 1;
        }

        let weak = Arc::downgrade(&self.inner);
        let id = self
            .inner
            .channel
            .subscribe(Arc::new(move |event: &OutputEvent| {
                if let Some(policy) = weak.upgrade() {
                    policy.on_channel_event(event);
                }
            }));

        let mut state = self.inner.state.lock();
        if state.enabled {
            state.subscription = Some(id);
        } else {
            drop(state);
            self.inner.channel.unsubscribe(id);
        }
        debug!("Reconnect policy enabled for {}", self.inner.channel.channel_id());
    }

    /// Stop watching. No attempt starts after this returns.
    pub fn disable(&self) {
        let subscription = {
            let mut state = self.inner.state.lock();
            if !state.enabled {
                return;
            }
            state.enabled = false;
            state.generation += 1;
            if let Some(attempt) = state.attempt.take() {
                attempt.abort();
            }
            state.subscription.take()
        };

        if let Some(id) = subscription {
            self.inner.channel.unsubscribe(id);
        }
        debug!("Reconnect policy disabled for {}", self.inner.channel.channel_id());
    }

    /// Attempt to open now unless an attempt is already pending.
    /// The attempt does not count against the retry limit.
    pub fn trigger(&self) {
        let mut state = self.inner.state.lock();
        if !state.enabled || state.exhausted || state.attempt.is_some() {
            return;
        }
        self.inner.spawn_attempt(&mut state, std::time::Duration::ZERO);
    }

    /// Whether the policy is watching the channel
    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().enabled
    }

    /// Whether retries ran out
    pub fn is_exhausted(&self) -> bool {
        self.inner.state.lock().exhausted
    }

    /// Retries since the last successful open
    pub fn retries(&self) -> u32 {
        self.inner.state.lock().retries
    }

    /// Subscribe to policy events
    pub fn subscribe(&self, handler: EventHandler<ReconnectEvent>) -> SubscriptionId {
        self.inner.hub.subscribe(handler)
    }

    /// Remove a subscription
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.hub.unsubscribe(id);
    }
}

impl Drop for ReconnectPolicy {
    fn drop(&mut self) {
        self.disable();
    }
}

impl PolicyInner {
    fn event(&self) -> ConnectionEvent {
        ConnectionEvent::new(self.channel.channel_id(), self.channel.session_id())
    }

    fn on_channel_event(self: &Arc<Self>, event: &OutputEvent) {
        match event {
            OutputEvent::ConnectionOpened(e) => {
                {
                    let mut state = self.state.lock();
                    if !state.enabled || state.exhausted {
                        return;
                    }
                    state.retries = 0;
                    state.close_pending = false;
                }
                info!("Connection {} -> {} established", e.session_id, e.channel_id);
                self.hub.raise(ReconnectEvent::ConnectionOpened(e.clone()));
            }
            OutputEvent::ConnectionClosed(e) => {
                let exhausted = {
                    let mut state = self.state.lock();
                    if !state.enabled || state.exhausted {
                        return;
                    }
                    if state.attempt.is_some() {
                        state.close_pending = true;
                        return;
                    }
                    debug!("Connection {} -> {} closed; scheduling reconnect", e.session_id, e.channel_id);
                    self.schedule_retry(&mut state)
                };
                if exhausted {
                    self.give_up();
                }
            }
            OutputEvent::ConnectionOffline(_) | OutputEvent::MessageReceived(_) => {}
        }
    }

    /// Returns true when retries are exhausted
    fn schedule_retry(self: &Arc<Self>, state: &mut PolicyState) -> bool {
        if let Some(max) = self.config.max_reconnect_attempts {
            if state.retries >= max {
                state.exhausted = true;
                return true;
            }
        }
        state.retries += 1;
        self.spawn_attempt(state, self.config.retry_interval);
        false
    }

    fn spawn_attempt(self: &Arc<Self>, state: &mut PolicyState, delay: std::time::Duration) {
        state.close_pending = false;
        state.attempt = Some(self.runtime.spawn(run_attempt(
            Arc::downgrade(self),
            state.generation,
            delay,
        )));
    }

    fn attempt_finished(self: &Arc<Self>, generation: u64, result: ChannelResult<()>) {
        let exhausted = {
            let mut state = self.state.lock();
            if !state.enabled {
                drop(state);
                // The open outran disable(); nobody wants this connection
                if result.is_ok() {
                    debug!("Closing {} opened after reconnect was disabled", self.channel.channel_id());
                    self.channel.close_connection();
                }
                return;
            }
            if state.generation != generation {
                return;
            }
            // Called from the attempt task itself
            state.attempt.take();

            match result {
                Ok(()) if !state.close_pending => return,
                Ok(()) => debug!("Connection {} closed again right after opening", self.channel.channel_id()),
                Err(e) => warn!(
                    "Reconnect attempt {} to {} failed: {}",
                    state.retries,
                    self.channel.channel_id(),
                    e
                ),
            }
            self.schedule_retry(&mut state)
        };
        if exhausted {
            self.give_up();
        }
    }

    fn give_up(&self) {
        warn!(
            "Giving up on {} after {} reconnect attempts",
            self.channel.channel_id(),
            self.config.max_reconnect_attempts.unwrap_or_default()
        );
        self.hub.raise(ReconnectEvent::ReconnectingFailed(self.event()));
    }
}

async fn run_attempt(policy: Weak<PolicyInner>, generation: u64, delay: std::time::Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let Some(policy) = policy.upgrade() else {
        return;
    };
    if policy.state.lock().generation != generation {
        return;
    }

    debug!("Opening {} -> {}", policy.channel.session_id(), policy.channel.channel_id());
    let result = policy.channel.open_connection().await;
    policy.attempt_finished(generation, result);
}
