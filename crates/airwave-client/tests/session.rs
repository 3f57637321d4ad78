use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use airwave_client::{
    ConnectCallback, Consumer, ConsumerEvent, ConsumerNotifier, Device, InboundRtpReport,
    PlaybackError, PlaybackSink, RecvTransport, SessionInput, SessionMachine, SignalSink,
    TransportEvent, TransportNotifier, UiEvent,
};
use airwave_common::rtp::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceParameters, MediaKind, RtcpParameters,
    RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
};
use airwave_common::{
    ClientMessage, ConnectionState, ConsumeRequest, ConsumerClosed, ConsumerInfo, Result,
    ServerInfo, ServerMessage, StreamInfo, TransportOptions,
};
use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};

#[derive(Default)]
struct Probe {
    transports: Mutex<Vec<TransportNotifier>>,
    connect_results: Mutex<Vec<oneshot::Receiver<Result<()>>>>,
    consumers: Mutex<Vec<ConsumerNotifier>>,
    closed_transports: Mutex<Vec<String>>,
    closed_consumers: Mutex<Vec<String>>,
    play_results: Mutex<VecDeque<std::result::Result<(), PlaybackError>>>,
    loads: Mutex<usize>,
}

struct FakeDevice {
    probe: Arc<Probe>,
    capabilities: Option<RtpCapabilities>,
}

#[async_trait]
impl Device for FakeDevice {
    async fn load(&mut self, router_capabilities: &RtpCapabilities) -> Result<()> {
        *self.probe.loads.lock().unwrap() += 1;
        self.capabilities = Some(router_capabilities.clone());
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.capabilities.is_some()
    }

    fn rtp_capabilities(&self) -> Option<RtpCapabilities> {
        self.capabilities.clone()
    }

    fn create_recv_transport(
        &mut self,
        options: &TransportOptions,
        notifier: TransportNotifier,
    ) -> Result<Box<dyn RecvTransport>> {
        let (callback, done) = ConnectCallback::new();
        notifier.notify(TransportEvent::Connect {
            dtls_parameters: dtls(),
            callback,
        });
        self.probe.connect_results.lock().unwrap().push(done);
        self.probe.transports.lock().unwrap().push(notifier);
        Ok(Box::new(FakeTransport {
            id: options.transport_id.clone(),
            probe: self.probe.clone(),
        }))
    }
}

struct FakeTransport {
    id: String,
    probe: Arc<Probe>,
}

#[async_trait]
impl RecvTransport for FakeTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn consume(
        &mut self,
        info: &ConsumerInfo,
        notifier: ConsumerNotifier,
    ) -> Result<Box<dyn Consumer>> {
        self.probe.consumers.lock().unwrap().push(notifier);
        Ok(Box::new(FakeConsumer {
            id: info.consumer_id.clone(),
            probe: self.probe.clone(),
        }))
    }

    fn close(&mut self) {
        self.probe.closed_transports.lock().unwrap().push(self.id.clone());
    }
}

struct FakeConsumer {
    id: String,
    probe: Arc<Probe>,
}

#[async_trait]
impl Consumer for FakeConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn stats(&self) -> Result<InboundRtpReport> {
        Ok(InboundRtpReport {
            bytes_received: 8_000,
            packets_received: 50,
            packets_lost: 0,
            codec_mime_type: Some("audio/PCMU".into()),
            ..Default::default()
        })
    }

    fn close(&mut self) {
        self.probe.closed_consumers.lock().unwrap().push(self.id.clone());
    }
}

struct FakeSink {
    probe: Arc<Probe>,
}

#[async_trait]
impl PlaybackSink for FakeSink {
    fn attach(&mut self, _info: &ConsumerInfo) {}

    async fn play(&mut self) -> std::result::Result<(), PlaybackError> {
        self.probe
            .play_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    fn detach(&mut self) {}
}

struct RecordingSignal(Arc<Mutex<Vec<ClientMessage>>>);

impl SignalSink for RecordingSignal {
    fn send(&self, message: ClientMessage) -> Result<()> {
        self.0.lock().unwrap().push(message);
        Ok(())
    }
}

fn dtls() -> DtlsParameters {
    DtlsParameters {
        role: Some(DtlsRole::Client),
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".into(),
            value: "AB:CD".into(),
        }],
    }
}

fn router_caps() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/PCMU".into(),
            preferred_payload_type: Some(0),
            clock_rate: 8000,
            channels: Some(1),
            parameters: Default::default(),
            rtcp_feedback: Vec::new(),
        }],
        header_extensions: Vec::new(),
    }
}

fn server_info() -> ServerMessage {
    ServerMessage::ServerInfo(ServerInfo {
        router_rtp_capabilities: router_caps(),
        available_streams: vec![
            StreamInfo {
                id: "radio1".into(),
                name: "Radio One".into(),
            },
            StreamInfo {
                id: "radio2".into(),
                name: "Radio Two".into(),
            },
        ],
    })
}

fn transport_created(transport_id: &str) -> ServerMessage {
    ServerMessage::TransportCreated(TransportOptions {
        transport_id: transport_id.into(),
        ice_parameters: IceParameters {
            username_fragment: "ufrag".into(),
            password: "password".into(),
            ice_lite: true,
        },
        ice_candidates: Vec::new(),
        dtls_parameters: dtls(),
    })
}

fn consumer_ready(consumer_id: &str, transport_id: &str, stream_id: &str) -> ServerMessage {
    ServerMessage::ConsumerReady(ConsumerInfo {
        producer_id: format!("producer-{stream_id}"),
        consumer_id: consumer_id.into(),
        kind: MediaKind::Audio,
        rtp_parameters: RtpParameters {
            mid: Some("0".into()),
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/PCMU".into(),
                payload_type: 0,
                clock_rate: 8000,
                channels: Some(1),
                parameters: Default::default(),
                rtcp_feedback: Vec::new(),
            }],
            header_extensions: Vec::new(),
            encodings: Vec::new(),
            rtcp: RtcpParameters::default(),
        },
        transport_id: transport_id.into(),
        stream_id: stream_id.into(),
    })
}

fn consume(stream_id: &str) -> ClientMessage {
    ClientMessage::Consume(ConsumeRequest {
        stream_id: stream_id.into(),
    })
}

struct Harness {
    machine: SessionMachine,
    probe: Arc<Probe>,
    sent: Arc<Mutex<Vec<ClientMessage>>>,
    ui: broadcast::Receiver<UiEvent>,
}

impl Harness {
    fn new() -> Self {
        let probe = Arc::new(Probe::default());
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (machine, handle) = SessionMachine::new(
            Box::new(FakeDevice {
                probe: probe.clone(),
                capabilities: None,
            }),
            Box::new(FakeSink {
                probe: probe.clone(),
            }),
            Arc::new(RecordingSignal(sent.clone())),
            Duration::from_secs(3600),
        );
        Self {
            machine,
            probe,
            sent,
            ui: handle.subscribe(),
        }
    }

    /// A machine that has seen serverInfo, with the bookkeeping cleared.
    async fn ready() -> Self {
        let mut harness = Self::new();
        harness.server(server_info()).await;
        harness.take_sent();
        harness.take_ui();
        harness
    }

    async fn input(&mut self, input: SessionInput) {
        self.machine.process(input).await;
        self.machine.drain().await;
    }

    async fn server(&mut self, message: ServerMessage) {
        self.input(SessionInput::Server(message)).await;
    }

    async fn start(&mut self, stream_id: &str) {
        self.input(SessionInput::StartConsuming(stream_id.into()))
            .await;
    }

    async fn transport_state(&mut self, index: usize, state: ConnectionState) {
        let notifier = self.probe.transports.lock().unwrap()[index].clone();
        notifier.notify(TransportEvent::StateChanged(state));
        self.machine.drain().await;
    }

    async fn consumer_event(&mut self, index: usize, event: ConsumerEvent) {
        let notifier = self.probe.consumers.lock().unwrap()[index].clone();
        notifier.notify(event);
        self.machine.drain().await;
    }

    /// Drives a fresh transport for `stream_id` up to an open consumer.
    async fn listen(&mut self, stream_id: &str) {
        self.start(stream_id).await;
        self.server(transport_created("t1")).await;
        self.transport_state(0, ConnectionState::Connected).await;
        self.server(consumer_ready("c1", "t1", stream_id)).await;
        self.take_sent();
        self.take_ui();
    }

    /// Like `listen`, but keeps the events of the consumer step.
    async fn listen_keep_events(&mut self, stream_id: &str) {
        self.start(stream_id).await;
        self.server(transport_created("t1")).await;
        self.transport_state(0, ConnectionState::Connected).await;
        self.take_ui();
        self.server(consumer_ready("c1", "t1", stream_id)).await;
    }

    fn take_sent(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    fn take_ui(&mut self) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.ui.try_recv() {
            events.push(event);
        }
        events
    }
}

fn states(events: &[UiEvent]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|event| match event {
            UiEvent::ConnectionStateChange { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

fn statuses(events: &[UiEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            UiEvent::Status(status) => Some(status.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn server_info_loads_device_and_declares_capabilities() {
    let mut harness = Harness::new();
    harness.server(server_info()).await;

    let events = harness.take_ui();
    assert!(matches!(
        &events[0],
        UiEvent::StreamsAvailable { streams } if streams.len() == 2
    ));
    assert!(events.contains(&UiEvent::DeviceReady));

    let sent = harness.take_sent();
    assert_eq!(sent.len(), 1);
    assert!(matches!(&sent[0], ClientMessage::SetRtpCapabilities(_)));
    assert_eq!(harness.machine.streams().len(), 2);
}

#[tokio::test]
async fn start_before_device_is_loaded_fails() {
    let mut harness = Harness::new();
    harness.start("radio1").await;

    assert!(harness.take_sent().is_empty());
    let events = harness.take_ui();
    assert_eq!(states(&events), vec![ConnectionState::Failed]);
}

#[tokio::test]
async fn pending_stream_is_consumed_once_transport_connects() {
    let mut harness = Harness::ready().await;

    harness.start("radio1").await;
    assert_eq!(harness.take_sent(), vec![ClientMessage::CreateWebRtcTransport]);
    assert_eq!(states(&harness.take_ui()), vec![ConnectionState::Connecting]);
    assert_eq!(harness.machine.pending_stream(), Some("radio1"));

    harness.server(transport_created("t1")).await;
    let sent = harness.take_sent();
    assert!(matches!(
        &sent[..],
        [ClientMessage::ConnectWebRtcTransport(connect)] if connect.transport_id == "t1"
    ));
    let done = harness.probe.connect_results.lock().unwrap().remove(0);
    assert!(done.await.unwrap().is_ok());

    harness.transport_state(0, ConnectionState::Connecting).await;
    assert!(harness.take_sent().is_empty());
    harness.transport_state(0, ConnectionState::Connected).await;
    assert_eq!(harness.take_sent(), vec![consume("radio1")]);
    let events = harness.take_ui();
    assert!(events.contains(&UiEvent::ConnectionStateChange {
        state: ConnectionState::Connected,
        stream_name: "Radio One".into(),
    }));
    assert!(statuses(&events).contains(&"Requesting stream: Radio One...".to_string()));

    harness.server(consumer_ready("c1", "t1", "radio1")).await;
    assert_eq!(harness.machine.consumer_id(), Some("c1"));
    assert_eq!(harness.machine.current_stream(), Some("radio1"));
    let events = harness.take_ui();
    assert_eq!(states(&events), vec![ConnectionState::Connected]);
    assert!(statuses(&events).contains(&"Listening to: Radio One".to_string()));
}

#[tokio::test]
async fn second_start_while_transport_pending_does_not_request_another() {
    let mut harness = Harness::ready().await;

    harness.start("radio1").await;
    harness.start("radio2").await;
    assert_eq!(harness.take_sent(), vec![ClientMessage::CreateWebRtcTransport]);

    harness.server(transport_created("t1")).await;
    harness.start("radio1").await;
    // transport exists but is not connected: reflect its state, no new request
    let sent = harness.take_sent();
    assert!(sent
        .iter()
        .all(|m| !matches!(m, ClientMessage::CreateWebRtcTransport)));
    assert_eq!(harness.machine.pending_stream(), Some("radio1"));
}

#[tokio::test]
async fn switching_streams_leaves_one_consumer_bound_to_the_latest() {
    let mut harness = Harness::ready().await;
    harness.start("radio1").await;
    harness.server(transport_created("t1")).await;
    harness.transport_state(0, ConnectionState::Connected).await;
    assert_eq!(harness.take_sent().last(), Some(&consume("radio1")));

    // B is requested before A's consumer is ready
    harness.start("radio2").await;
    assert_eq!(harness.take_sent(), vec![consume("radio2")]);

    harness.server(consumer_ready("c1", "t1", "radio1")).await;
    assert_eq!(harness.machine.consumer_id(), None);

    harness.server(consumer_ready("c2", "t1", "radio2")).await;
    assert_eq!(harness.machine.consumer_id(), Some("c2"));
    assert_eq!(harness.machine.current_stream(), Some("radio2"));
    assert_eq!(harness.probe.consumers.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn restarting_same_stream_binds_the_latest_consumer() {
    let mut harness = Harness::ready().await;
    harness.start("radio1").await;
    harness.server(transport_created("t1")).await;
    harness.transport_state(0, ConnectionState::Connected).await;
    harness.start("radio1").await;
    assert_eq!(harness.take_sent().last(), Some(&consume("radio1")));

    // the gateway replaced c1 with c2 when the second consume arrived
    harness.server(consumer_ready("c1", "t1", "radio1")).await;
    assert_eq!(harness.machine.consumer_id(), None);

    harness.server(consumer_ready("c2", "t1", "radio1")).await;
    assert_eq!(harness.machine.consumer_id(), Some("c2"));
    assert_eq!(harness.probe.consumers.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn error_for_abandoned_consume_keeps_the_live_request() {
    let mut harness = Harness::ready().await;
    harness.start("radio1").await;
    harness.server(transport_created("t1")).await;
    harness.transport_state(0, ConnectionState::Connected).await;
    harness.server(consumer_ready("c1", "t1", "radio1")).await;
    harness.take_ui();

    harness.start("radio9").await;
    harness.start("radio2").await;
    harness
        .server(ServerMessage::Error(
            "Stream radio9 not found or not active".into(),
        ))
        .await;
    assert!(!states(&harness.take_ui()).contains(&ConnectionState::Failed));

    harness.server(consumer_ready("c2", "t1", "radio2")).await;
    assert_eq!(harness.machine.consumer_id(), Some("c2"));
    assert_eq!(harness.machine.current_stream(), Some("radio2"));
    assert_eq!(
        states(&harness.take_ui()).last(),
        Some(&ConnectionState::Connected)
    );
}

#[tokio::test]
async fn consumer_ready_for_unconnected_transport_is_dropped() {
    let mut harness = Harness::ready().await;
    harness.start("radio1").await;
    harness.server(transport_created("t1")).await;

    harness.server(consumer_ready("c1", "t1", "radio1")).await;
    assert_eq!(harness.machine.consumer_id(), None);

    harness.transport_state(0, ConnectionState::Connected).await;
    harness.server(consumer_ready("c1", "other", "radio1")).await;
    assert_eq!(harness.machine.consumer_id(), None);
}

#[tokio::test]
async fn server_consumer_closed_is_reported_once() {
    let mut harness = Harness::ready().await;
    harness.listen("radio1").await;

    let closed = ServerMessage::ConsumerClosed(ConsumerClosed {
        consumer_id: "c1".into(),
    });
    harness.server(closed.clone()).await;
    harness.server(closed).await;
    harness.consumer_event(0, ConsumerEvent::TrackEnded).await;

    let events = harness.take_ui();
    assert_eq!(states(&events), vec![ConnectionState::Closed]);
    assert!(events.contains(&UiEvent::ConnectionStateChange {
        state: ConnectionState::Closed,
        stream_name: "Radio One".into(),
    }));
    assert!(events.contains(&UiEvent::StatsCleared));
    assert_eq!(harness.machine.consumer_id(), None);
    assert_eq!(*harness.probe.closed_consumers.lock().unwrap(), vec!["c1"]);
    // the stream list is left alone
    assert_eq!(harness.machine.streams().len(), 2);
}

#[tokio::test]
async fn track_end_closes_consumer() {
    let mut harness = Harness::ready().await;
    harness.listen("radio1").await;

    harness.consumer_event(0, ConsumerEvent::TrackEnded).await;
    assert_eq!(states(&harness.take_ui()), vec![ConnectionState::Closed]);
    assert_eq!(harness.machine.consumer_id(), None);
}

#[tokio::test]
async fn failed_transport_drops_consumer_and_transport() {
    let mut harness = Harness::ready().await;
    harness.listen("radio1").await;

    harness.transport_state(0, ConnectionState::Failed).await;
    assert_eq!(harness.machine.consumer_id(), None);
    assert_eq!(harness.machine.transport_state(), None);
    assert_eq!(*harness.probe.closed_transports.lock().unwrap(), vec!["t1"]);
    assert_eq!(states(&harness.take_ui()), vec![ConnectionState::Failed]);

    // the next start asks for a new transport
    harness.start("radio1").await;
    assert_eq!(harness.take_sent(), vec![ClientMessage::CreateWebRtcTransport]);
}

#[tokio::test]
async fn server_error_marks_session_failed() {
    let mut harness = Harness::ready().await;
    harness.listen("radio1").await;

    harness.start("radio9").await;
    harness
        .server(ServerMessage::Error(
            "Stream radio9 not found or not active".into(),
        ))
        .await;

    let events = harness.take_ui();
    assert_eq!(states(&events).last(), Some(&ConnectionState::Failed));
    assert!(statuses(&events).contains(&"Error: Stream radio9 not found or not active".to_string()));
    assert_eq!(harness.machine.pending_stream(), None);
}

#[tokio::test]
async fn blocked_playback_waits_for_interaction() {
    let mut harness = Harness::ready().await;
    harness
        .probe
        .play_results
        .lock()
        .unwrap()
        .push_back(Err(PlaybackError::NotAllowed));
    harness.listen_keep_events("radio1").await;

    let events = harness.take_ui();
    assert_eq!(states(&events).last(), Some(&ConnectionState::Connected));
    assert!(events.contains(&UiEvent::InteractionRequired));
    assert!(statuses(&events).contains(&"Ready. Click page or player to start audio.".to_string()));

    harness.input(SessionInput::UserInteraction).await;
    let events = harness.take_ui();
    assert_eq!(statuses(&events), vec!["Listening to: Radio One".to_string()]);

    // the retry is one-shot
    harness.input(SessionInput::UserInteraction).await;
    assert!(harness.take_ui().is_empty());
}

#[tokio::test]
async fn playback_failure_after_interaction_fails() {
    let mut harness = Harness::ready().await;
    {
        let mut results = harness.probe.play_results.lock().unwrap();
        results.push_back(Err(PlaybackError::NotAllowed));
        results.push_back(Err(PlaybackError::Failed("no output device".into())));
    }
    harness.listen("radio1").await;

    harness.input(SessionInput::UserInteraction).await;
    let events = harness.take_ui();
    assert_eq!(states(&events), vec![ConnectionState::Failed]);
    assert!(statuses(&events).contains(&"Could not start audio.".to_string()));
}

#[tokio::test]
async fn stats_ticks_produce_snapshots() {
    let mut harness = Harness::ready().await;
    harness.listen("radio1").await;

    harness.input(SessionInput::StatsTick).await;
    let events = harness.take_ui();
    match &events[..] {
        [UiEvent::StatsUpdated(snapshot)] => {
            assert_eq!(snapshot.codec, "PCMU");
            assert_eq!(snapshot.bitrate_kbps, 0);
        }
        other => panic!("expected one stats event, got {:?}", other),
    }
}

#[tokio::test]
async fn server_session_change_resumes_stream() {
    let mut harness = Harness::ready().await;
    harness.listen("radio2").await;

    // reconnect: the gateway greets us as a new session
    harness.server(server_info()).await;
    assert_eq!(harness.machine.consumer_id(), None);
    assert_eq!(*harness.probe.closed_transports.lock().unwrap(), vec!["t1"]);
    assert_eq!(*harness.probe.loads.lock().unwrap(), 1);

    let sent = harness.take_sent();
    assert!(matches!(&sent[0], ClientMessage::SetRtpCapabilities(_)));
    assert_eq!(sent[1], ClientMessage::CreateWebRtcTransport);
    assert_eq!(harness.machine.pending_stream(), Some("radio2"));
}

#[tokio::test]
async fn disconnect_clears_everything() {
    let mut harness = Harness::ready().await;
    harness.listen("radio1").await;

    harness.input(SessionInput::Disconnect).await;
    assert!(harness.machine.is_stopped());
    assert_eq!(harness.machine.consumer_id(), None);
    assert_eq!(harness.machine.transport_state(), None);
    assert!(harness.machine.streams().is_empty());
    assert!(harness.machine.router_capabilities().is_none());
    assert_eq!(states(&harness.take_ui()), vec![ConnectionState::Closed]);

    // a stopped machine ignores further input
    harness.start("radio1").await;
    assert!(harness.take_sent().is_empty());
}
