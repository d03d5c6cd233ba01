//! Loopback resilience drill.
//!
//! Runs an echo server and a client on one in-process network, breaks the
//! link halfway through the message stream, and reports what the
//! application observed on both ends.

use crate::config::{OutageMode, TetherConfig};
use crate::{component_debug, component_info, component_warn};
use anyhow::Result;
use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_channel::{
    ChannelError, InputChannel, InputEvent, LinkState, MemoryNetwork, OutputChannel, OutputEvent,
};
use tether_session::{BufferedInputChannel, ResilientMessaging};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Outcome of one drill
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrillReport {
    /// Messages accepted by the client channel
    pub sent: u32,
    /// Messages the client channel refused
    pub refused: u32,
    /// Distinct echoes received back
    pub echoed: u32,
    /// Echoes received more than once
    pub duplicates: u32,
    /// Echoes that arrived out of send order
    pub out_of_order: u32,
    /// Client events by kind
    pub client_events: BTreeMap<String, u32>,
    /// Server events by kind
    pub server_events: BTreeMap<String, u32>,
    /// Whether the client session ended permanently
    pub session_closed: bool,
    /// Wall time of the drill in milliseconds
    pub elapsed_ms: u64,
}

impl DrillReport {
    /// Messages sent but never echoed
    pub fn lost(&self) -> u32 {
        self.sent.saturating_sub(self.echoed)
    }
}

fn output_kind(event: &OutputEvent) -> &'static str {
    match event {
        OutputEvent::ConnectionOpened(_) => "connection_opened",
        OutputEvent::ConnectionClosed(_) => "connection_closed",
        OutputEvent::ConnectionOffline(_) => "connection_offline",
        OutputEvent::MessageReceived(_) => "message_received",
    }
}

fn input_kind(event: &InputEvent) -> &'static str {
    match event {
        InputEvent::SessionConnected(_) => "session_connected",
        InputEvent::SessionDisconnected(_) => "session_disconnected",
        InputEvent::SessionOffline(_) => "session_offline",
        InputEvent::SessionOnline(_) => "session_online",
        InputEvent::MessageReceived(_) => "message_received",
    }
}

/// Start an echo server on `address`
fn start_echo_server(
    messaging: &ResilientMessaging,
    address: &str,
    events: mpsc::UnboundedSender<InputEvent>,
) -> Result<Arc<BufferedInputChannel>> {
    let input = messaging.create_resilient_input(address)?;
    let responder: Weak<BufferedInputChannel> = Arc::downgrade(&input);

    input.subscribe(Arc::new(move |event: &InputEvent| {
        if let InputEvent::MessageReceived(msg) = event {
            if let Some(responder) = responder.upgrade() {
                if let Err(e) = responder.send_response(&msg.session_id, msg.payload.clone()) {
                    component_warn!("echo", "Echo to {} failed: {}", msg.session_id, e);
                }
            }
        }
        events.send(event.clone()).ok();
    }));

    Ok(input)
}

fn inject_outage(network: &MemoryNetwork, address: &str, mode: OutageMode, outage: Duration) {
    let network = network.clone();
    let address = address.to_string();
    let state = match mode {
        OutageMode::Down => LinkState::Down,
        OutageMode::Silent => LinkState::Silent,
    };

    tokio::spawn(async move {
        component_info!("drill", "Injecting {:?} outage on {} for {:?}", mode, address, outage);
        network.set_link_state(&address, state);
        tokio::time::sleep(outage).await;
        network.set_link_state(&address, LinkState::Up);
        component_info!("drill", "Link {} restored", address);
    });
}

/// Run the drill described by `config`
pub async fn run(config: &TetherConfig) -> Result<DrillReport> {
    let drill = &config.drill;
    let started = Instant::now();

    let network = MemoryNetwork::new();
    let messaging = ResilientMessaging::new(Arc::new(network.clone()), config.resilience.clone())?;

    let (server_tx, mut server_rx) = mpsc::unbounded_channel();
    let input = start_echo_server(&messaging, &drill.address, server_tx)?;
    input.start_listening().await?;

    let (client_tx, mut client_rx) = mpsc::unbounded_channel();
    let output = messaging.create_resilient_output(&drill.address, None)?;
    output.subscribe(Arc::new(move |event: &OutputEvent| {
        client_tx.send(event.clone()).ok();
    }));
    output.open_connection().await?;
    component_info!(
        "drill",
        "Client {} sending {} messages to {}",
        output.session_id(),
        drill.messages,
        drill.address
    );

    let mut report = DrillReport::default();
    let outage_at = drill.messages / 2;
    for i in 0..drill.messages {
        if i == outage_at && !drill.outage.is_zero() {
            inject_outage(&network, &drill.address, drill.outage_mode, drill.outage);
        }

        match output.send_message(Bytes::from(i.to_be_bytes().to_vec())) {
            Ok(()) => report.sent += 1,
            Err(ChannelError::Closed) => {
                component_warn!("drill", "Session closed after {} messages", report.sent);
                report.refused += drill.messages - i;
                break;
            }
            Err(e) => {
                component_debug!("drill", "Message {} refused: {}", i, e);
                report.refused += 1;
            }
        }
        tokio::time::sleep(drill.message_interval).await;
    }

    // Long enough for one full offline window plus a detection and a retry
    let resilience = &config.resilience;
    let settle = resilience.buffer.max_offline_time
        + resilience.heartbeat.ping_timeout
        + resilience.reconnect.retry_interval;
    let deadline = Instant::now() + settle;

    let mut seen = HashSet::new();
    let mut last_echo: Option<u32> = None;
    while report.echoed < report.sent && !report.session_closed {
        let event = match tokio::time::timeout_at(deadline, client_rx.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) | Err(_) => break,
        };
        *report
            .client_events
            .entry(output_kind(&event).to_string())
            .or_default() += 1;

        match event {
            OutputEvent::MessageReceived(msg) => {
                let Ok(raw) = <[u8; 4]>::try_from(msg.payload.as_ref()) else {
                    component_warn!("drill", "Unexpected echo of {} bytes", msg.payload.len());
                    continue;
                };
                let seq = u32::from_be_bytes(raw);
                if !seen.insert(seq) {
                    report.duplicates += 1;
                    continue;
                }
                if last_echo.is_some_and(|last| seq < last) {
                    report.out_of_order += 1;
                }
                last_echo = Some(seq);
                report.echoed += 1;
            }
            OutputEvent::ConnectionClosed(_) => report.session_closed = true,
            _ => {}
        }
    }

    output.close_connection();
    input.stop_listening();

    while let Ok(event) = client_rx.try_recv() {
        *report
            .client_events
            .entry(output_kind(&event).to_string())
            .or_default() += 1;
    }
    while let Ok(event) = server_rx.try_recv() {
        *report
            .server_events
            .entry(input_kind(&event).to_string())
            .or_default() += 1;
    }

    report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    component_info!(
        "drill",
        "Drill finished: sent={} echoed={} lost={} duplicates={}",
        report.sent,
        report.echoed,
        report.lost(),
        report.duplicates
    );
    Ok(report)
}
