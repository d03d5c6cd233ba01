//! Per-session buffering state shared by both buffered channel halves.

use crate::config::BufferConfig;
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use tether_channel::{ChannelError, ChannelResult};
use tether_wire::{WireError, MAX_ENVELOPE_SIZE};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

/// Lifecycle of a buffered session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Never opened
    Disconnected,
    /// Opened, first connection still pending; sends are buffered
    Connecting,
    /// Connected; sends go straight through
    Open,
    /// Connection dropped; sends are buffered until the offline deadline
    Buffering,
    /// Terminal. Buffered messages were discarded.
    PermanentlyClosed,
}

impl SessionState {
    /// Whether sends are currently queued instead of transmitted
    pub fn is_buffering(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Buffering)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Buffering => "buffering",
            SessionState::PermanentlyClosed => "closed",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of one buffered session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Address of the input channel
    pub channel_id: String,
    /// Logical session
    pub session_id: String,
    /// Current state
    pub state: SessionState,
    /// Messages waiting for the connection to come back
    pub queued: usize,
    /// Time spent offline so far, when buffering
    pub offline_for: Option<std::time::Duration>,
}

pub(crate) struct SessionSlot {
    pub state: SessionState,
    pub disconnected_at: Option<Instant>,
    pub queue: VecDeque<Bytes>,
    pub offline_timer: Option<JoinHandle<()>>,
    pub timer_generation: u64,
}

impl SessionSlot {
    pub fn new(state: SessionState) -> Self {
        Self {
            state,
            disconnected_at: None,
            queue: VecDeque::new(),
            offline_timer: None,
            timer_generation: 0,
        }
    }

    /// Open -> Buffering. The offline clock keeps running if it already is.
    pub fn go_offline(&mut self) -> bool {
        if self.state != SessionState::Open {
            return false;
        }
        self.state = SessionState::Buffering;
        self.disconnected_at.get_or_insert_with(Instant::now);
        true
    }

    /// Deadline after which the session is purged
    pub fn offline_deadline(&self, config: &BufferConfig) -> Option<Instant> {
        self.disconnected_at
            .map(|since| since + config.max_offline_time)
    }

    /// Replace the offline timer, returning the generation the new timer
    /// must present when it fires
    pub fn next_timer(&mut self) -> u64 {
        self.cancel_timer();
        self.timer_generation += 1;
        self.timer_generation
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.offline_timer.take() {
            timer.abort();
        }
    }

    /// Queue a payload while offline. A payload that could never fit in an
    /// envelope is refused here instead of at flush time.
    pub fn enqueue(&mut self, payload: Bytes, config: &BufferConfig) -> ChannelResult<()> {
        if payload.len() > MAX_ENVELOPE_SIZE {
            return Err(ChannelError::Protocol(
                WireError::Size(payload.len()).to_string(),
            ));
        }
        if let Some(since) = self.disconnected_at {
            if since.elapsed() >= config.max_offline_time {
                return Err(ChannelError::Closed);
            }
        }
        if let Some(cap) = config.max_queue_length {
            if self.queue.len() >= cap {
                return Err(ChannelError::BufferFull(cap));
            }
        }

        self.queue.push_back(payload);
        trace!("Buffered message; {} queued", self.queue.len());
        Ok(())
    }

    /// Back to Open after a successful flush
    pub fn mark_open(&mut self) {
        self.state = SessionState::Open;
        self.disconnected_at = None;
        self.timer_generation += 1;
        self.cancel_timer();
    }

    /// Enter the terminal state, returning how many messages were discarded
    pub fn purge(&mut self) -> usize {
        self.state = SessionState::PermanentlyClosed;
        self.disconnected_at = None;
        self.timer_generation += 1;
        self.cancel_timer();
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    pub fn info(&self, channel_id: &str, session_id: &str) -> SessionInfo {
        SessionInfo {
            channel_id: channel_id.to_string(),
            session_id: session_id.to_string(),
            state: self.state,
            queued: self.queue.len(),
            offline_for: self.disconnected_at.map(|since| since.elapsed()),
        }
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
