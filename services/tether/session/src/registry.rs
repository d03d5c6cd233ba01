//! Registry of live buffered channels.
//!
//! Guards against two live client channels claiming the same session on the
//! same address, and against two buffered listeners on one address. Entries
//! are weak; channels the application dropped or closed are reaped lazily.

use crate::buffer::{BufferedInputChannel, BufferedOutputChannel};
use crate::session::{SessionInfo, SessionState};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tether_channel::{ChannelError, ChannelResult, InputChannel, OutputChannel};
use tracing::debug;

type OutputKey = (String, String);

/// Live buffered channels, keyed by address and session
#[derive(Default)]
pub struct SessionRegistry {
    outputs: DashMap<OutputKey, Weak<BufferedOutputChannel>>,
    inputs: DashMap<String, Weak<BufferedInputChannel>>,
}

fn output_is_live(entry: &Weak<BufferedOutputChannel>) -> bool {
    entry
        .upgrade()
        .map(|channel| channel.state() != SessionState::PermanentlyClosed)
        .unwrap_or(false)
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a client channel. Fails when a live channel already holds the
    /// same session on the same address.
    pub fn register_output(&self, channel: &Arc<BufferedOutputChannel>) -> ChannelResult<()> {
        let key = (
            channel.channel_id().to_string(),
            channel.session_id().to_string(),
        );

        match self.outputs.entry(key) {
            Entry::Occupied(mut occupied) => {
                if output_is_live(occupied.get()) {
                    let (channel_id, session_id) = occupied.key().clone();
                    return Err(ChannelError::DuplicateSession {
                        channel_id,
                        session_id,
                    });
                }
                occupied.insert(Arc::downgrade(channel));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::downgrade(channel));
            }
        }
        Ok(())
    }

    /// Whether `register_output` would currently reject this session
    pub fn output_in_use(&self, channel_id: &str, session_id: &str) -> bool {
        let key = (channel_id.to_string(), session_id.to_string());
        self.outputs
            .get(&key)
            .map(|entry| output_is_live(entry.value()))
            .unwrap_or(false)
    }

    /// Track a server channel. Fails when another live buffered listener is
    /// registered for the address.
    pub fn register_input(&self, channel: &Arc<BufferedInputChannel>) -> ChannelResult<()> {
        match self.inputs.entry(channel.channel_id().to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().upgrade().is_some() {
                    return Err(ChannelError::AddressInUse(occupied.key().clone()));
                }
                occupied.insert(Arc::downgrade(channel));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::downgrade(channel));
            }
        }
        Ok(())
    }

    /// Whether a live buffered listener holds the address
    pub fn input_in_use(&self, channel_id: &str) -> bool {
        self.inputs
            .get(channel_id)
            .map(|entry| entry.value().upgrade().is_some())
            .unwrap_or(false)
    }

    /// Snapshot of every live client session
    pub fn output_sessions(&self) -> Vec<SessionInfo> {
        let channels: Vec<Arc<BufferedOutputChannel>> = self
            .outputs
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        channels.iter().map(|channel| channel.info()).collect()
    }

    /// Snapshot of the sessions held by the listener on `channel_id`
    pub fn input_sessions(&self, channel_id: &str) -> Vec<SessionInfo> {
        let channel = self
            .inputs
            .get(channel_id)
            .and_then(|entry| entry.value().upgrade());
        channel.map(|channel| channel.sessions()).unwrap_or_default()
    }

    /// Drop entries of channels that were released or permanently closed.
    /// Returns how many were removed.
    pub fn reap(&self) -> usize {
        let before = self.outputs.len() + self.inputs.len();
        self.outputs.retain(|_, entry| output_is_live(entry));
        self.inputs.retain(|_, entry| entry.upgrade().is_some());
        let reaped = before.saturating_sub(self.outputs.len() + self.inputs.len());
        if reaped > 0 {
            debug!("Reaped {} registry entries", reaped);
        }
        reaped
    }

    /// Number of tracked entries, live or not
    pub fn len(&self) -> usize {
        self.outputs.len() + self.inputs.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
