//! Client session state machine.
//!
//! One owned struct, driven by one task, turns server messages, local
//! transport/consumer events and user commands into signaling requests and
//! UI events. Nothing here blocks: every suspension point is an engine or
//! playback call awaited inside `process`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use airwave_common::rtp::RtpCapabilities;
use airwave_common::{
    ClientMessage, ConnectTransport, ConnectionState, ConsumeRequest, ConsumerInfo, Result,
    ServerInfo, ServerMessage, SetRtpCapabilities, StreamInfo, TransportOptions,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::device::{
    Consumer, ConsumerEvent, ConsumerNotifier, Device, PlaybackError, PlaybackSink,
    RecvTransport, TransportEvent, TransportNotifier,
};
use crate::signaling::SignalingChannel;
use crate::stats::StatsTracker;
use crate::types::UiEvent;

const UI_CAPACITY: usize = 128;
const UNKNOWN_STREAM: &str = "Unknown Stream";

/// Outbound half of the signaling protocol as seen by the machine.
pub trait SignalSink: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<()>;
}

impl SignalSink for SignalingChannel {
    fn send(&self, message: ClientMessage) -> Result<()> {
        SignalingChannel::send(self, message)
    }
}

#[derive(Debug)]
pub enum SessionInput {
    Server(ServerMessage),
    Transport {
        transport_id: String,
        event: TransportEvent,
    },
    Consumer {
        consumer_id: String,
        event: ConsumerEvent,
    },
    StartConsuming(String),
    UserInteraction,
    StatsTick,
    Disconnect,
}

/// Cloneable control surface for a running machine.
#[derive(Clone)]
pub struct SessionHandle {
    inputs: mpsc::UnboundedSender<SessionInput>,
    ui: broadcast::Sender<UiEvent>,
}

impl SessionHandle {
    pub fn start_consuming(&self, stream_id: impl Into<String>) -> bool {
        self.inputs
            .send(SessionInput::StartConsuming(stream_id.into()))
            .is_ok()
    }

    pub fn user_interaction(&self) -> bool {
        self.inputs.send(SessionInput::UserInteraction).is_ok()
    }

    pub fn disconnect(&self) -> bool {
        self.inputs.send(SessionInput::Disconnect).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.ui.subscribe()
    }
}

struct ActiveTransport {
    inner: Box<dyn RecvTransport>,
    state: ConnectionState,
}

struct ActiveConsumer {
    inner: Box<dyn Consumer>,
    stream_id: String,
}

struct StatsPoller {
    ticker: JoinHandle<()>,
    tracker: StatsTracker,
}

pub struct SessionMachine {
    device: Box<dyn Device>,
    sink: Box<dyn PlaybackSink>,
    signal: Arc<dyn SignalSink>,
    ui: broadcast::Sender<UiEvent>,
    inputs_tx: mpsc::UnboundedSender<SessionInput>,
    inputs_rx: mpsc::UnboundedReceiver<SessionInput>,
    stats_interval: Duration,

    router_capabilities: Option<RtpCapabilities>,
    streams: Vec<StreamInfo>,
    transport: Option<ActiveTransport>,
    transport_requested: bool,
    consumer: Option<ActiveConsumer>,
    /// Stream waiting for the transport to connect.
    pending: Option<String>,
    /// Stream whose `consume` request is in flight.
    requested: Option<String>,
    /// `consume` requests the server has not answered yet. Replies come back
    /// in request order, so only the last one can still be current.
    consumes_in_flight: usize,
    awaiting_interaction: bool,
    stats: Option<StatsPoller>,
    stopped: bool,
}

impl SessionMachine {
    pub fn new(
        device: Box<dyn Device>,
        sink: Box<dyn PlaybackSink>,
        signal: Arc<dyn SignalSink>,
        stats_interval: Duration,
    ) -> (Self, SessionHandle) {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (ui, _) = broadcast::channel(UI_CAPACITY);
        let handle = SessionHandle {
            inputs: inputs_tx.clone(),
            ui: ui.clone(),
        };
        let machine = Self {
            device,
            sink,
            signal,
            ui,
            inputs_tx,
            inputs_rx,
            stats_interval,
            router_capabilities: None,
            streams: Vec::new(),
            transport: None,
            transport_requested: false,
            consumer: None,
            pending: None,
            requested: None,
            consumes_in_flight: 0,
            awaiting_interaction: false,
            stats: None,
            stopped: false,
        };
        (machine, handle)
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            inputs: self.inputs_tx.clone(),
            ui: self.ui.clone(),
        }
    }

    /// Runs until `disconnect` or until the signaling channel goes away.
    pub async fn run(mut self, mut server: broadcast::Receiver<ServerMessage>) {
        loop {
            let input = tokio::select! {
                input = self.inputs_rx.recv() => input,
                message = server.recv() => match message {
                    Ok(message) => Some(SessionInput::Server(message)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("session fell behind, {} server message(s) lost", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => None,
                },
            };
            self.process(input.unwrap_or(SessionInput::Disconnect)).await;
            if self.stopped {
                break;
            }
        }
    }

    /// Processes inputs already queued by local resources.
    pub async fn drain(&mut self) {
        while let Ok(input) = self.inputs_rx.try_recv() {
            self.process(input).await;
        }
    }

    pub async fn process(&mut self, input: SessionInput) {
        if self.stopped {
            return;
        }
        match input {
            SessionInput::Server(message) => self.on_server_message(message).await,
            SessionInput::Transport {
                transport_id,
                event,
            } => self.on_transport_event(&transport_id, event),
            SessionInput::Consumer { consumer_id, event } => {
                let reason = match event {
                    ConsumerEvent::TrackEnded => "track ended",
                    ConsumerEvent::TransportClosed => "transport closed",
                };
                self.consumer_ended(&consumer_id, reason)
            }
            SessionInput::StartConsuming(stream_id) => self.start_consuming(stream_id),
            SessionInput::UserInteraction => self.on_user_interaction().await,
            SessionInput::StatsTick => self.poll_stats().await,
            SessionInput::Disconnect => self.disconnect(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    pub fn router_capabilities(&self) -> Option<&RtpCapabilities> {
        self.router_capabilities.as_ref()
    }

    pub fn transport_state(&self) -> Option<ConnectionState> {
        self.transport.as_ref().map(|t| t.state)
    }

    pub fn consumer_id(&self) -> Option<&str> {
        self.consumer.as_ref().map(|c| c.inner.id())
    }

    pub fn current_stream(&self) -> Option<&str> {
        self.consumer.as_ref().map(|c| c.stream_id.as_str())
    }

    pub fn pending_stream(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    async fn on_server_message(&mut self, message: ServerMessage) {
        debug!("handling {}", message.action());
        match message {
            ServerMessage::ServerInfo(info) => self.on_server_info(info).await,
            ServerMessage::TransportCreated(options) => self.on_transport_created(options),
            ServerMessage::ConsumerReady(info) => self.on_consumer_ready(info).await,
            ServerMessage::ConsumerClosed(closed) => {
                self.consumer_ended(&closed.consumer_id, "closed by server")
            }
            ServerMessage::Error(message) => {
                if self.answer_consume() > 0 {
                    warn!("server error for an abandoned consume: {}", message);
                    return;
                }
                warn!("server error: {}", message);
                self.dispatch_state(ConnectionState::Failed);
                self.emit_status(format!("Error: {message}"));
                self.pending = None;
                self.requested = None;
                if self.transport.is_none() {
                    self.transport_requested = false;
                }
            }
            ServerMessage::RouterCapabilities(capabilities) => {
                self.router_capabilities = Some(capabilities);
            }
        }
    }

    async fn on_server_info(&mut self, info: ServerInfo) {
        let ServerInfo {
            router_rtp_capabilities,
            available_streams,
        } = info;

        // A second serverInfo means a new server-side session.
        let resume = if self.transport.is_some()
            || self.consumer.is_some()
            || self.transport_requested
        {
            info!("server session changed, rebuilding local transport");
            let resume = self
                .consumer
                .as_ref()
                .map(|c| c.stream_id.clone())
                .or_else(|| self.pending.take())
                .or_else(|| self.requested.take());
            self.close_consumer();
            self.drop_transport();
            self.transport_requested = false;
            self.pending = None;
            self.requested = None;
            self.consumes_in_flight = 0;
            resume
        } else {
            None
        };

        self.streams = available_streams;
        self.emit(UiEvent::StreamsAvailable {
            streams: self.streams.clone(),
        });

        if !self.device.is_loaded() {
            if let Err(err) = self.device.load(&router_rtp_capabilities).await {
                error!("failed to load device: {}", err);
                self.fail(format!("Failed to load device: {err}"));
                return;
            }
            info!("device loaded");
            self.emit(UiEvent::DeviceReady);
        }
        self.router_capabilities = Some(router_rtp_capabilities);

        let Some(rtp_capabilities) = self.device.rtp_capabilities() else {
            self.fail("Device has no receive capabilities".into());
            return;
        };
        let declare = ClientMessage::SetRtpCapabilities(SetRtpCapabilities { rtp_capabilities });
        if let Err(err) = self.signal.send(declare) {
            self.fail(format!("Failed to declare capabilities: {err}"));
            return;
        }

        if let Some(stream_id) = resume {
            if self.streams.iter().any(|s| s.id == stream_id) {
                info!(stream_id = %stream_id, "resuming stream");
                self.start_consuming(stream_id);
            } else {
                info!(stream_id = %stream_id, "stream no longer offered, not resuming");
            }
        }
    }

    fn start_consuming(&mut self, stream_id: String) {
        self.close_consumer();
        self.requested = None;

        if !self.device.is_loaded() {
            warn!(stream_id = %stream_id, "start requested before the device was loaded");
            self.fail("Device not ready. Cannot start stream.".into());
            return;
        }

        match self.transport.as_ref().map(|t| t.state) {
            Some(ConnectionState::Connected) => self.request_consume(stream_id),
            Some(state) if !state.is_terminal() => {
                debug!(stream_id = %stream_id, "transport not connected yet ({})", state);
                self.pending = Some(stream_id);
                self.dispatch_state(state);
            }
            _ => {
                self.drop_transport();
                self.pending = Some(stream_id);
                self.dispatch_state(ConnectionState::Connecting);
                if self.transport_requested {
                    debug!("transport creation already in flight");
                } else {
                    self.request_transport();
                }
            }
        }
    }

    fn request_transport(&mut self) {
        self.transport_requested = true;
        if let Err(err) = self.signal.send(ClientMessage::CreateWebRtcTransport) {
            self.transport_requested = false;
            self.fail(format!("Failed to request transport: {err}"));
        }
    }

    fn request_consume(&mut self, stream_id: String) {
        let name = self.stream_name(Some(&stream_id));
        self.emit_status(format!("Requesting stream: {name}..."));
        self.requested = Some(stream_id.clone());
        match self
            .signal
            .send(ClientMessage::Consume(ConsumeRequest { stream_id }))
        {
            Ok(()) => self.consumes_in_flight += 1,
            Err(err) => {
                self.requested = None;
                self.fail(format!("Failed to request stream: {err}"));
            }
        }
    }

    /// Counts off one answered `consume` and returns how many remain.
    fn answer_consume(&mut self) -> usize {
        self.consumes_in_flight = self.consumes_in_flight.saturating_sub(1);
        self.consumes_in_flight
    }

    fn on_transport_created(&mut self, options: TransportOptions) {
        self.transport_requested = false;
        if !self.device.is_loaded() {
            self.fail("Device not ready".into());
            return;
        }
        if self.transport.is_some() {
            debug!("replacing receive transport");
            self.close_consumer();
            self.drop_transport();
        }

        let notifier = TransportNotifier::new(options.transport_id.clone(), self.inputs_tx.clone());
        match self.device.create_recv_transport(&options, notifier) {
            Ok(inner) => {
                info!(transport_id = %options.transport_id, "receive transport created");
                self.transport = Some(ActiveTransport {
                    inner,
                    state: ConnectionState::New,
                });
            }
            Err(err) => {
                error!("failed to create receive transport: {}", err);
                self.fail(format!("Failed to create connection: {err}"));
            }
        }
    }

    fn on_transport_event(&mut self, transport_id: &str, event: TransportEvent) {
        let current = self
            .transport
            .as_ref()
            .is_some_and(|t| t.inner.id() == transport_id);

        match event {
            TransportEvent::Connect {
                dtls_parameters,
                callback,
            } => {
                if !current {
                    callback.fail(airwave_common::Error::not_found(format!(
                        "Transport {transport_id} is no longer in use"
                    )));
                    return;
                }
                let message = ClientMessage::ConnectWebRtcTransport(ConnectTransport {
                    transport_id: transport_id.to_string(),
                    dtls_parameters,
                });
                match self.signal.send(message) {
                    Ok(()) => callback.succeed(),
                    Err(err) => {
                        warn!("failed to send transport connect: {}", err);
                        callback.fail(err);
                    }
                }
            }
            TransportEvent::StateChanged(state) => {
                let Some(active) = self.transport.as_mut().filter(|_| current) else {
                    debug!(transport_id, "ignoring state of a replaced transport");
                    return;
                };
                active.state = state;
                info!(transport_id, "transport {}", state);
                self.dispatch_state(state);

                match state {
                    ConnectionState::Connected => {
                        if let Some(stream_id) = self.pending.take() {
                            self.request_consume(stream_id);
                        }
                    }
                    ConnectionState::Failed | ConnectionState::Closed => {
                        self.close_consumer();
                        self.drop_transport();
                    }
                    _ => {}
                }
            }
        }
    }

    async fn on_consumer_ready(&mut self, info: ConsumerInfo) {
        if self.consumes_in_flight == 0 {
            warn!(consumer_id = %info.consumer_id, "dropping unsolicited consumerReady");
            return;
        }
        if self.answer_consume() > 0 {
            debug!(consumer_id = %info.consumer_id, "dropping reply to a superseded consume");
            return;
        }
        let transport_ready = self.transport.as_ref().is_some_and(|t| {
            t.inner.id() == info.transport_id && t.state == ConnectionState::Connected
        });
        let expected = self.requested.as_deref() == Some(info.stream_id.as_str());
        if !transport_ready || !expected || !self.device.is_loaded() {
            warn!(
                consumer_id = %info.consumer_id,
                stream_id = %info.stream_id,
                "dropping consumerReady that no longer matches local state"
            );
            return;
        }

        self.requested = None;
        self.close_consumer();

        let notifier = ConsumerNotifier::new(info.consumer_id.clone(), self.inputs_tx.clone());
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let consumer = match transport.inner.consume(&info, notifier).await {
            Ok(consumer) => consumer,
            Err(err) => {
                error!("failed to create consumer: {}", err);
                self.fail(format!("Failed to start stream: {err}"));
                return;
            }
        };
        info!(consumer_id = %info.consumer_id, stream_id = %info.stream_id, "consumer ready");
        self.consumer = Some(ActiveConsumer {
            inner: consumer,
            stream_id: info.stream_id.clone(),
        });

        self.sink.attach(&info);
        match self.sink.play().await {
            Ok(()) => {
                self.dispatch_state(ConnectionState::Connected);
                self.start_stats();
            }
            Err(PlaybackError::NotAllowed) => {
                self.dispatch_state(ConnectionState::Connected);
                self.awaiting_interaction = true;
                self.emit_status("Ready. Click page or player to start audio.".into());
                self.emit(UiEvent::InteractionRequired);
            }
            Err(PlaybackError::Failed(reason)) => {
                warn!("playback failed: {}", reason);
                self.fail(format!("Could not start audio: {reason}"));
            }
        }
    }

    async fn on_user_interaction(&mut self) {
        if !self.awaiting_interaction {
            return;
        }
        self.awaiting_interaction = false;
        if self.consumer.is_none() {
            return;
        }

        match self.sink.play().await {
            Ok(()) => {
                let name = self.stream_name(self.current_stream());
                self.emit_status(format!("Listening to: {name}"));
                self.start_stats();
            }
            Err(err) => {
                warn!("playback failed after interaction: {}", err);
                self.dispatch_state(ConnectionState::Failed);
                self.emit_status("Could not start audio.".into());
            }
        }
    }

    /// Closes the active consumer if `consumer_id` is still the active one.
    fn consumer_ended(&mut self, consumer_id: &str, reason: &str) {
        if self.consumer_id() != Some(consumer_id) {
            debug!(consumer_id, "ignoring close of an inactive consumer");
            return;
        }
        info!(consumer_id, "consumer ended: {}", reason);
        let stream_id = self.consumer.as_ref().map(|c| c.stream_id.clone());
        self.close_consumer();
        self.dispatch_state_for(ConnectionState::Closed, stream_id.as_deref());
    }

    async fn poll_stats(&mut self) {
        let (Some(poller), Some(active)) = (self.stats.as_mut(), self.consumer.as_ref()) else {
            return;
        };
        let snapshot = match active.inner.stats().await {
            Ok(report) => poller.tracker.sample(&report, Instant::now()),
            Err(err) => {
                debug!("stats unavailable: {}", err);
                return;
            }
        };
        self.emit(UiEvent::StatsUpdated(snapshot));
    }

    fn start_stats(&mut self) {
        if self.stats.is_some() {
            return;
        }
        let inputs = self.inputs_tx.clone();
        let period = self.stats_interval;
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                if inputs.send(SessionInput::StatsTick).is_err() {
                    break;
                }
            }
        });
        self.stats = Some(StatsPoller {
            ticker,
            tracker: StatsTracker::new(),
        });
    }

    fn stop_stats(&mut self) {
        if let Some(poller) = self.stats.take() {
            poller.ticker.abort();
            self.emit(UiEvent::StatsCleared);
        }
    }

    fn close_consumer(&mut self) {
        let Some(mut active) = self.consumer.take() else {
            return;
        };
        self.stop_stats();
        self.awaiting_interaction = false;
        self.sink.detach();
        active.inner.close();
        debug!(consumer_id = %active.inner.id(), "local consumer closed");
    }

    fn drop_transport(&mut self) {
        if let Some(mut active) = self.transport.take() {
            active.inner.close();
            debug!(transport_id = %active.inner.id(), "local transport closed");
        }
    }

    fn disconnect(&mut self) {
        self.close_consumer();
        self.drop_transport();
        self.dispatch_state(ConnectionState::Closed);
        self.router_capabilities = None;
        self.streams.clear();
        self.pending = None;
        self.requested = None;
        self.consumes_in_flight = 0;
        self.transport_requested = false;
        self.stopped = true;
        info!("session stopped");
    }

    fn active_stream(&self) -> Option<&str> {
        self.current_stream()
            .or(self.pending.as_deref())
            .or(self.requested.as_deref())
    }

    fn stream_name(&self, stream_id: Option<&str>) -> String {
        stream_id
            .and_then(|id| self.streams.iter().find(|s| s.id == id))
            .map(|s| s.name.clone())
            .unwrap_or_else(|| UNKNOWN_STREAM.to_string())
    }

    fn dispatch_state(&self, state: ConnectionState) {
        self.dispatch_state_for(state, self.active_stream());
    }

    fn dispatch_state_for(&self, state: ConnectionState, stream_id: Option<&str>) {
        let stream_name = self.stream_name(stream_id);
        let status = match state {
            ConnectionState::Connected if stream_id.is_some() => {
                format!("Listening to: {stream_name}")
            }
            ConnectionState::Failed => "Failed".to_string(),
            ConnectionState::Closed => "Disconnected".to_string(),
            ConnectionState::Connecting | ConnectionState::Checking => "Connecting...".to_string(),
            other => format!("Connection: {other}"),
        };
        self.emit(UiEvent::ConnectionStateChange { state, stream_name });
        self.emit_status(status);
    }

    fn fail(&self, status: String) {
        self.dispatch_state(ConnectionState::Failed);
        self.emit_status(status);
    }

    fn emit_status(&self, status: String) {
        self.emit(UiEvent::Status(status));
    }

    fn emit(&self, event: UiEvent) {
        let _ = self.ui.send(event);
    }
}
