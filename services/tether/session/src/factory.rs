//! The resilient composite.
//!
//! [`ResilientMessaging`] stacks the layers in their only sensible order:
//!
//! ```text
//! application <-> buffer (+ reconnect policy) <-> monitor <-> transport
//! ```
//!
//! The buffer sits on top so a connection the monitor declares dead is
//! treated as a transient drop and reconnected, instead of surfacing to the
//! application. Only the top layer delivers events through the application's
//! dispatcher; the inner layers hand events up on the thread that raised them.

use crate::buffer::{BufferedInputChannel, BufferedOutputChannel};
use crate::config::{ConfigError, ResilienceConfig};
use crate::monitor::{MonitoredInputChannel, MonitoredOutputChannel};
use crate::registry::SessionRegistry;
use crate::session::SessionInfo;
use std::sync::Arc;
use tether_channel::{
    ChannelError, ChannelResult, Dispatcher, InputChannel, MessagingSystem, OutputChannel,
    SyncDispatcher,
};
use tether_wire::{CborCodec, EnvelopeCodec};
use tracing::{debug, info};
use uuid::Uuid;

/// Messaging system producing monitored, buffered, self-reconnecting channels
pub struct ResilientMessaging {
    transport: Arc<dyn MessagingSystem>,
    config: ResilienceConfig,
    codec: Arc<dyn EnvelopeCodec>,
    dispatcher: Arc<dyn Dispatcher>,
    registry: Arc<SessionRegistry>,
}

impl ResilientMessaging {
    /// Build the composite over `transport`. Fails on an unusable
    /// configuration.
    pub fn new(
        transport: Arc<dyn MessagingSystem>,
        config: ResilienceConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            transport,
            config,
            codec: Arc::new(CborCodec),
            dispatcher: Arc::new(SyncDispatcher),
            registry: Arc::new(SessionRegistry::new()),
        })
    }

    /// Use a different envelope codec. Both ends must agree.
    pub fn with_codec(mut self, codec: Arc<dyn EnvelopeCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Deliver application events through `dispatcher`
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Share a registry with other composites
    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Configuration in effect
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Registry of channels created by this composite
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Create a resilient client channel. Without `session_id` a fresh one is
    /// generated; an explicit id lets a restarted client resume its session.
    pub fn create_resilient_output(
        &self,
        channel_id: &str,
        session_id: Option<&str>,
    ) -> ChannelResult<Arc<BufferedOutputChannel>> {
        let session_id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if self.registry.output_in_use(channel_id, &session_id) {
            return Err(ChannelError::DuplicateSession {
                channel_id: channel_id.to_string(),
                session_id,
            });
        }

        let transport = self
            .transport
            .create_output_channel(channel_id, Some(&session_id))?;
        let monitored: Arc<dyn OutputChannel> = Arc::new(MonitoredOutputChannel::new(
            transport,
            self.codec.clone(),
            self.config.heartbeat.clone(),
            Arc::new(SyncDispatcher),
        ));
        let buffered = Arc::new(BufferedOutputChannel::new(
            monitored,
            self.config.buffer.clone(),
            self.config.reconnect.clone(),
            self.dispatcher.clone(),
        ));

        self.registry.register_output(&buffered)?;
        debug!("Created resilient output {} -> {}", session_id, channel_id);
        Ok(buffered)
    }

    /// Create a resilient server channel
    pub fn create_resilient_input(
        &self,
        channel_id: &str,
    ) -> ChannelResult<Arc<BufferedInputChannel>> {
        if self.registry.input_in_use(channel_id) {
            return Err(ChannelError::AddressInUse(channel_id.to_string()));
        }

        let transport = self.transport.create_input_channel(channel_id)?;
        let monitored: Arc<dyn InputChannel> = Arc::new(MonitoredInputChannel::new(
            transport,
            self.codec.clone(),
            self.config.heartbeat.clone(),
            Arc::new(SyncDispatcher),
        ));
        let buffered = Arc::new(BufferedInputChannel::new(
            monitored,
            self.config.buffer.clone(),
            self.dispatcher.clone(),
        ));

        self.registry.register_input(&buffered)?;
        info!(
            "Created resilient input {} (codec {}, offline limit {:?})",
            channel_id,
            self.codec.name(),
            self.config.buffer.max_offline_time
        );
        Ok(buffered)
    }

    /// Snapshot of every live client session created here
    pub fn output_sessions(&self) -> Vec<SessionInfo> {
        self.registry.output_sessions()
    }

    /// Forget channels that were dropped or permanently closed
    pub fn reap(&self) -> usize {
        self.registry.reap()
    }
}

impl MessagingSystem for ResilientMessaging {
    fn create_output_channel(
        &self,
        channel_id: &str,
        session_id: Option<&str>,
    ) -> ChannelResult<Arc<dyn OutputChannel>> {
        let channel: Arc<dyn OutputChannel> =
            self.create_resilient_output(channel_id, session_id)?;
        Ok(channel)
    }

    fn create_input_channel(&self, channel_id: &str) -> ChannelResult<Arc<dyn InputChannel>> {
        let channel: Arc<dyn InputChannel> = self.create_resilient_input(channel_id)?;
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferConfig, HeartbeatConfig, ReconnectConfig};
    use crate::session::SessionState;
    use crate::test_support::{input_events, next_event, output_events, quiet_for};
    use bytes::Bytes;
    use std::time::Duration;
    use tether_channel::{
        ConnectionEvent, InputEvent, LinkState, MemoryNetwork, OutputEvent, SerialDispatcher,
    };
    use tether_wire::{JsonCodec, MAX_ENVELOPE_SIZE};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    const ADDR: &str = "memory://resilient";

    fn config(max_offline_ms: u64, retry_ms: u64, attempts: Option<u32>) -> ResilienceConfig {
        ResilienceConfig {
            heartbeat: HeartbeatConfig {
                ping_interval: Duration::from_millis(100),
                ping_timeout: Duration::from_millis(250),
            },
            buffer: BufferConfig {
                max_offline_time: Duration::from_millis(max_offline_ms),
                max_queue_length: None,
            },
            reconnect: ReconnectConfig {
                retry_interval: Duration::from_millis(retry_ms),
                max_reconnect_attempts: attempts,
            },
        }
    }

    fn composite(network: &MemoryNetwork, config: ResilienceConfig) -> ResilientMessaging {
        ResilientMessaging::new(Arc::new(network.clone()), config).unwrap()
    }

    fn payloads(events: &[InputEvent]) -> Vec<Bytes> {
        events
            .iter()
            .filter_map(|event| match event {
                InputEvent::MessageReceived(msg) => Some(msg.payload.clone()),
                _ => None,
            })
            .collect()
    }

    async fn connected_pair(
        messaging: &ResilientMessaging,
        session_id: &str,
    ) -> (
        Arc<BufferedInputChannel>,
        mpsc::UnboundedReceiver<InputEvent>,
        Arc<BufferedOutputChannel>,
        mpsc::UnboundedReceiver<OutputEvent>,
    ) {
        let input = messaging.create_resilient_input(ADDR).unwrap();
        let mut server = input_events(input.as_ref());
        input.start_listening().await.unwrap();

        let output = messaging
            .create_resilient_output(ADDR, Some(session_id))
            .unwrap();
        let mut client = output_events(output.as_ref());
        output.open_connection().await.unwrap();

        assert_eq!(
            next_event(&mut client).await,
            OutputEvent::ConnectionOpened(ConnectionEvent::new(ADDR, session_id))
        );
        assert_eq!(
            next_event(&mut server).await,
            InputEvent::SessionConnected(ConnectionEvent::new(ADDR, session_id))
        );
        (input, server, output, client)
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_outage_is_invisible() {
        let network = MemoryNetwork::new();
        let messaging = composite(&network, config(300, 50, None));
        let (_input, mut server, output, mut client) = connected_pair(&messaging, "client-a").await;

        output.send_message(Bytes::from_static(b"A")).unwrap();
        assert!(matches!(next_event(&mut server).await, InputEvent::MessageReceived(_)));

        network.set_link_state(ADDR, LinkState::Down);
        assert!(matches!(next_event(&mut client).await, OutputEvent::ConnectionOffline(_)));
        assert!(matches!(next_event(&mut server).await, InputEvent::SessionOffline(_)));

        output.send_message(Bytes::from_static(b"B")).unwrap();
        output.send_message(Bytes::from_static(b"C")).unwrap();
        assert_eq!(output.state(), SessionState::Buffering);

        tokio::time::sleep(Duration::from_millis(100)).await;
        network.set_link_state(ADDR, LinkState::Up);

        assert!(matches!(next_event(&mut client).await, OutputEvent::ConnectionOpened(_)));
        assert!(matches!(next_event(&mut server).await, InputEvent::SessionOnline(_)));

        let server_events = quiet_for(&mut server, Duration::from_millis(500)).await;
        assert_eq!(
            payloads(&server_events),
            vec![Bytes::from_static(b"B"), Bytes::from_static(b"C")]
        );
        assert!(server_events
            .iter()
            .all(|event| matches!(event, InputEvent::MessageReceived(_))));

        let client_events = quiet_for(&mut client, Duration::from_millis(10)).await;
        assert!(client_events.is_empty(), "unexpected {:?}", client_events);
        assert_eq!(output.state(), SessionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_outage_closes_once() {
        let network = MemoryNetwork::new();
        let messaging = composite(&network, config(300, 50, None));
        let (input, mut server, output, mut client) = connected_pair(&messaging, "client-b").await;

        network.set_link_state(ADDR, LinkState::Down);
        let down_at = Instant::now();
        assert!(matches!(next_event(&mut client).await, OutputEvent::ConnectionOffline(_)));
        assert!(matches!(next_event(&mut server).await, InputEvent::SessionOffline(_)));
        output.send_message(Bytes::from_static(b"lost")).unwrap();

        assert_eq!(
            next_event(&mut client).await,
            OutputEvent::ConnectionClosed(ConnectionEvent::new(ADDR, "client-b"))
        );
        let closed_after = down_at.elapsed();
        assert!(closed_after >= Duration::from_millis(300));
        assert!(closed_after < Duration::from_millis(350));

        assert_eq!(
            next_event(&mut server).await,
            InputEvent::SessionDisconnected(ConnectionEvent::new(ADDR, "client-b"))
        );

        // Link recovers at 400ms; the session stays closed
        tokio::time::sleep(Duration::from_millis(100)).await;
        network.set_link_state(ADDR, LinkState::Up);

        assert!(quiet_for(&mut client, Duration::from_secs(1)).await.is_empty());
        assert!(quiet_for(&mut server, Duration::from_millis(10)).await.is_empty());
        assert_eq!(
            output.send_message(Bytes::from_static(b"x")),
            Err(ChannelError::Closed)
        );
        assert_eq!(network.connection_count(ADDR), 0);
        assert!(input.sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_link_recovered_by_heartbeat() {
        let network = MemoryNetwork::new();
        let messaging = composite(&network, config(2_000, 50, None));
        let (_input, mut server, output, mut client) = connected_pair(&messaging, "client-c").await;

        network.set_link_state(ADDR, LinkState::Silent);
        assert!(matches!(next_event(&mut client).await, OutputEvent::ConnectionOffline(_)));
        output.send_message(Bytes::from_static(b"queued")).unwrap();

        network.set_link_state(ADDR, LinkState::Up);
        assert!(matches!(next_event(&mut client).await, OutputEvent::ConnectionOpened(_)));

        let server_events = quiet_for(&mut server, Duration::from_millis(500)).await;
        assert_eq!(payloads(&server_events), vec![Bytes::from_static(b"queued")]);
        assert!(!server_events
            .iter()
            .any(|event| matches!(event, InputEvent::SessionDisconnected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_are_terminal() {
        let network = MemoryNetwork::new();
        let messaging = composite(&network, config(10_000, 50, Some(2)));
        let (_input, _server, output, mut client) = connected_pair(&messaging, "client-d").await;

        network.set_link_state(ADDR, LinkState::Down);
        let down_at = Instant::now();
        assert!(matches!(next_event(&mut client).await, OutputEvent::ConnectionOffline(_)));
        assert!(matches!(next_event(&mut client).await, OutputEvent::ConnectionClosed(_)));
        assert!(down_at.elapsed() < Duration::from_millis(200));

        network.set_link_state(ADDR, LinkState::Up);
        assert!(quiet_for(&mut client, Duration::from_secs(1)).await.is_empty());
        assert_eq!(output.state(), SessionState::PermanentlyClosed);
        assert_eq!(output.open_connection().await, Err(ChannelError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_waits_for_late_server() {
        let network = MemoryNetwork::new();
        let messaging = composite(&network, config(1_000, 50, None));

        let output = messaging
            .create_resilient_output(ADDR, Some("early"))
            .unwrap();
        let mut client = output_events(output.as_ref());
        output.open_connection().await.unwrap();
        output.send_message(Bytes::from_static(b"first")).unwrap();
        assert_eq!(output.state(), SessionState::Connecting);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let input = messaging.create_resilient_input(ADDR).unwrap();
        let mut server = input_events(input.as_ref());
        input.start_listening().await.unwrap();

        assert!(matches!(next_event(&mut client).await, OutputEvent::ConnectionOpened(_)));
        assert!(matches!(next_event(&mut server).await, InputEvent::SessionConnected(_)));
        match next_event(&mut server).await {
            InputEvent::MessageReceived(msg) => {
                assert_eq!(msg.session_id, "early");
                assert_eq!(msg.payload, Bytes::from_static(b"first"));
            }
            other => panic!("Expected message, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_responses_survive_outage() {
        let network = MemoryNetwork::new();
        let messaging = composite(&network, config(500, 50, None));
        let (input, mut server, _output, mut client) = connected_pair(&messaging, "client-e").await;

        network.set_link_state(ADDR, LinkState::Down);
        assert!(matches!(next_event(&mut server).await, InputEvent::SessionOffline(_)));
        input.send_response("client-e", Bytes::from_static(b"r1")).unwrap();
        input.send_response("client-e", Bytes::from_static(b"r2")).unwrap();

        let sessions = messaging.registry().input_sessions(ADDR);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "client-e");
        assert_eq!(sessions[0].state, SessionState::Buffering);
        assert_eq!(sessions[0].queued, 2);
        assert!(messaging.registry().input_sessions("memory://nowhere").is_empty());

        tokio::time::sleep(Duration::from_millis(120)).await;
        network.set_link_state(ADDR, LinkState::Up);
        assert!(matches!(next_event(&mut server).await, InputEvent::SessionOnline(_)));

        let responses: Vec<Bytes> = quiet_for(&mut client, Duration::from_millis(500))
            .await
            .into_iter()
            .filter_map(|event| match event {
                OutputEvent::MessageReceived(msg) => Some(msg.payload),
                _ => None,
            })
            .collect();
        assert_eq!(
            responses,
            vec![Bytes::from_static(b"r1"), Bytes::from_static(b"r2")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_payloads_fail_without_outage() {
        let network = MemoryNetwork::new();
        let messaging = composite(&network, config(300, 50, None));
        let (input, mut server, output, mut client) = connected_pair(&messaging, "client-f").await;
        let huge = Bytes::from(vec![0u8; MAX_ENVELOPE_SIZE + 1]);

        assert!(matches!(
            output.send_message(huge.clone()),
            Err(ChannelError::Protocol(_))
        ));
        assert!(matches!(
            input.send_response("client-f", huge),
            Err(ChannelError::Protocol(_))
        ));
        assert_eq!(output.state(), SessionState::Open);
        assert_eq!(input.session_state("client-f"), Some(SessionState::Open));
        assert_eq!(network.connection_count(ADDR), 1);

        output.send_message(Bytes::from_static(b"B")).unwrap();
        input.send_response("client-f", Bytes::from_static(b"R")).unwrap();

        let server_events = quiet_for(&mut server, Duration::from_millis(500)).await;
        assert_eq!(server_events.len(), 1, "unexpected {:?}", server_events);
        assert_eq!(payloads(&server_events), vec![Bytes::from_static(b"B")]);

        let client_events = quiet_for(&mut client, Duration::from_millis(10)).await;
        match client_events.as_slice() {
            [OutputEvent::MessageReceived(msg)] => assert_eq!(msg.payload, Bytes::from_static(b"R")),
            other => panic!("Expected only the response, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unencodable_buffered_response_is_dropped() {
        let network = MemoryNetwork::new();
        let messaging = composite(&network, config(500, 50, None));
        let (input, mut server, _output, mut client) = connected_pair(&messaging, "client-g").await;

        network.set_link_state(ADDR, LinkState::Down);
        assert!(matches!(next_event(&mut server).await, InputEvent::SessionOffline(_)));
        assert!(matches!(
            input.send_response("client-g", Bytes::from(vec![0u8; MAX_ENVELOPE_SIZE + 1])),
            Err(ChannelError::Protocol(_))
        ));
        // Fits the queue but not an envelope once framed
        input
            .send_response("client-g", Bytes::from(vec![0u8; MAX_ENVELOPE_SIZE]))
            .unwrap();
        input.send_response("client-g", Bytes::from_static(b"r2")).unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        network.set_link_state(ADDR, LinkState::Up);
        assert!(matches!(next_event(&mut server).await, InputEvent::SessionOnline(_)));
        assert_eq!(input.session_state("client-g"), Some(SessionState::Open));

        let responses: Vec<Bytes> = quiet_for(&mut client, Duration::from_millis(500))
            .await
            .into_iter()
            .filter_map(|event| match event {
                OutputEvent::MessageReceived(msg) => Some(msg.payload),
                _ => None,
            })
            .collect();
        assert_eq!(responses, vec![Bytes::from_static(b"r2")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vetoed_session_closes_once() {
        let network = MemoryNetwork::new();
        let messaging = composite(&network, config(10_000, 50, Some(2)));
        let input = messaging.create_resilient_input(ADDR).unwrap();
        let mut server = input_events(input.as_ref());
        input.set_connect_validator(Some(Arc::new(|session_id: &str, _peer: &str| {
            session_id != "banned"
        })));
        input.start_listening().await.unwrap();

        let banned = messaging
            .create_resilient_output(ADDR, Some("banned"))
            .unwrap();
        let mut banned_events = output_events(banned.as_ref());
        banned.open_connection().await.unwrap();
        banned.send_message(Bytes::from_static(b"never")).unwrap();

        assert_eq!(
            next_event(&mut banned_events).await,
            OutputEvent::ConnectionClosed(ConnectionEvent::new(ADDR, "banned"))
        );
        assert!(quiet_for(&mut banned_events, Duration::from_secs(1)).await.is_empty());
        assert_eq!(banned.state(), SessionState::PermanentlyClosed);
        assert!(quiet_for(&mut server, Duration::from_millis(10)).await.is_empty());

        let allowed = messaging
            .create_resilient_output(ADDR, Some("allowed"))
            .unwrap();
        let mut allowed_events = output_events(allowed.as_ref());
        allowed.open_connection().await.unwrap();
        allowed.send_message(Bytes::from_static(b"hello")).unwrap();

        assert!(matches!(
            next_event(&mut allowed_events).await,
            OutputEvent::ConnectionOpened(_)
        ));
        assert_eq!(
            next_event(&mut server).await,
            InputEvent::SessionConnected(ConnectionEvent::new(ADDR, "allowed"))
        );
        match next_event(&mut server).await {
            InputEvent::MessageReceived(msg) => {
                assert_eq!(msg.session_id, "allowed");
                assert_eq!(msg.payload, Bytes::from_static(b"hello"));
            }
            other => panic!("Expected message, got {:?}", other),
        }
        assert_eq!(network.connection_count(ADDR), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_session_rejected_until_reaped() {
        let network = MemoryNetwork::new();
        let messaging = composite(&network, config(300, 50, None));

        let first = messaging.create_resilient_output(ADDR, Some("dup")).unwrap();
        assert_eq!(
            messaging
                .create_resilient_output(ADDR, Some("dup"))
                .err(),
            Some(ChannelError::DuplicateSession {
                channel_id: ADDR.to_string(),
                session_id: "dup".to_string(),
            })
        );

        let _input = messaging.create_resilient_input(ADDR).unwrap();
        assert_eq!(
            messaging.create_resilient_input(ADDR).err(),
            Some(ChannelError::AddressInUse(ADDR.to_string()))
        );

        first.close_connection();
        let second = messaging.create_resilient_output(ADDR, Some("dup")).unwrap();
        assert_eq!(second.state(), SessionState::Disconnected);
        assert_eq!(messaging.output_sessions().len(), 1);

        drop(first);
        drop(second);
        assert_eq!(messaging.reap(), 1);
        assert_eq!(messaging.registry().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generated_session_ids_are_unique() {
        let network = MemoryNetwork::new();
        let messaging = composite(&network, config(300, 50, None));

        let a = messaging.create_resilient_output(ADDR, None).unwrap();
        let b = messaging.create_resilient_output(ADDR, None).unwrap();
        assert_ne!(a.session_id(), b.session_id());
        assert!(Uuid::parse_str(a.session_id()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_json_codec_and_serial_dispatcher() {
        let network = MemoryNetwork::new();
        let messaging = composite(&network, config(300, 50, None))
            .with_codec(Arc::new(JsonCodec))
            .with_dispatcher(Arc::new(SerialDispatcher::new()));
        let (_input, mut server, output, _client) = connected_pair(&messaging, "json").await;

        for i in 0..20u8 {
            output.send_message(Bytes::from(vec![i])).unwrap();
        }
        let mut received = Vec::new();
        while received.len() < 20 {
            if let InputEvent::MessageReceived(msg) = next_event(&mut server).await {
                received.push(msg.payload[0]);
            }
        }
        assert_eq!(received, (0..20u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ResilienceConfig::default();
        config.heartbeat.ping_timeout = Duration::ZERO;
        assert_eq!(
            ResilientMessaging::new(Arc::new(MemoryNetwork::new()), config).err(),
            Some(ConfigError::ZeroDuration("ping_timeout"))
        );
    }
}
