use std::net::SocketAddr;
use std::sync::Arc;

use airwave_common::{
    ClientMessage, ConnectTransport, ConsumeRequest, ConsumerClosed, ConsumerInfo, Error, Result,
    ServerInfo, ServerMessage, TransportOptions,
};
use airwave_media::{
    ConsumerEvent, EngineConsumer, EngineTransport, MediaEngine, StreamCatalog, TransportEvent,
    TransportKind,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use futures::{stream::StreamExt, SinkExt};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::{ClientSession, ConsumerEntry, SessionRegistry, TransportEntry};
use crate::AppState;

const WS_OUTBOX_CAPACITY: usize = 128;

/// Notification from an engine resource, tagged with the resource id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    Transport {
        transport_id: String,
        event: TransportEvent,
    },
    Consumer {
        consumer_id: String,
        event: ConsumerEvent,
    },
}

/// Maps protocol actions onto engine operations for every connection.
#[derive(Clone)]
pub struct SignalRouter {
    engine: Arc<dyn MediaEngine>,
    catalog: Arc<dyn StreamCatalog>,
    registry: Arc<SessionRegistry>,
}

impl SignalRouter {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        catalog: Arc<dyn StreamCatalog>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            engine,
            catalog,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<dyn StreamCatalog> {
        &self.catalog
    }

    /// Open a session for a new connection and push `serverInfo` to it
    /// before anything else.
    pub async fn accept(&self, outbox: mpsc::Sender<ServerMessage>) -> Result<Connection> {
        let session = self.registry.create().await;
        let id = session.lock().await.id;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Connection {
            router: self.clone(),
            id,
            session,
            outbox,
            events_tx,
            events_rx,
            closed: false,
        };

        connection
            .send(ServerMessage::ServerInfo(ServerInfo {
                router_rtp_capabilities: self.engine.receive_capabilities(),
                available_streams: self.catalog.list_available(),
            }))
            .await?;
        info!(session = %id, "session opened");
        Ok(connection)
    }
}

/// One signaling connection and the session it owns. Every message is handled
/// to completion before the next one, so the session is only mutated from
/// here.
pub struct Connection {
    router: SignalRouter,
    id: Uuid,
    session: Arc<Mutex<ClientSession>>,
    outbox: mpsc::Sender<ServerMessage>,
    events_tx: mpsc::UnboundedSender<ResourceEvent>,
    events_rx: mpsc::UnboundedReceiver<ResourceEvent>,
    closed: bool,
}

impl Connection {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session(&self) -> &Arc<Mutex<ClientSession>> {
        &self.session
    }

    async fn send(&self, message: ServerMessage) -> Result<()> {
        self.outbox
            .send(message)
            .await
            .map_err(|_| Error::channel("connection outbox closed"))
    }

    pub async fn send_error(&self, message: impl Into<String>) {
        let message = message.into();
        if self.send(ServerMessage::Error(message)).await.is_err() {
            debug!(session = %self.id, "dropping error event for closed connection");
        }
    }

    /// Decode and dispatch one text frame. Failures are reported to the
    /// client and never end the connection.
    pub async fn handle_text(&mut self, text: &str) {
        let result = match ClientMessage::decode(text) {
            Ok(message) => self.handle_message(message).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!(session = %self.id, "request failed: {}", err);
            self.send_error(err.to_string()).await;
        }
    }

    pub async fn handle_message(&mut self, message: ClientMessage) -> Result<()> {
        if self.closed {
            return Err(Error::channel("session is closed"));
        }
        debug!(session = %self.id, action = message.action(), "request");
        match message {
            ClientMessage::SetRtpCapabilities(payload) => {
                self.session.lock().await.rtp_capabilities = Some(payload.rtp_capabilities);
                Ok(())
            }
            ClientMessage::GetRouterRtpCapabilities => {
                self.send(ServerMessage::RouterCapabilities(
                    self.router.engine.receive_capabilities(),
                ))
                .await
            }
            ClientMessage::CreateWebRtcTransport => self.create_transport().await,
            ClientMessage::ConnectWebRtcTransport(payload) => self.connect_transport(payload).await,
            ClientMessage::Consume(payload) => self.consume(payload).await,
        }
    }

    async fn create_transport(&mut self) -> Result<()> {
        let transport = self
            .router
            .engine
            .create_transport(self.id)
            .await
            .map_err(|err| Error::engine(format!("Failed to create transport: {err}")))?;
        let transport_id = transport.id().to_string();

        {
            let mut session = self.session.lock().await;
            // A newer transport replaces the old one, along with its consumers.
            for (_, entry) in session.consumers.drain() {
                entry.consumer.close();
            }
            for (old_id, entry) in session.transports.drain() {
                info!(session = %self.id, transport = %old_id, "replacing transport");
                entry.transport.close();
            }
            session.transports.insert(
                transport_id.clone(),
                TransportEntry {
                    transport: transport.clone(),
                    state: transport.state(),
                },
            );
        }
        self.watch_transport(&transport_id, transport.subscribe());
        info!(session = %self.id, transport = %transport_id, "transport created");

        self.send(ServerMessage::TransportCreated(TransportOptions {
            transport_id,
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
        }))
        .await
    }

    async fn connect_transport(&mut self, payload: ConnectTransport) -> Result<()> {
        let ConnectTransport {
            transport_id,
            dtls_parameters,
        } = payload;
        let transport = {
            let session = self.session.lock().await;
            match session.transports.get(&transport_id) {
                Some(entry) if entry.transport.kind() == TransportKind::WebRtc => {
                    entry.transport.clone()
                }
                Some(_) => {
                    return Err(Error::wrong_type(format!(
                        "{transport_id} is not a WebRTC transport"
                    )))
                }
                None if session.consumers.contains_key(&transport_id) => {
                    return Err(Error::wrong_type(format!(
                        "{transport_id} is a consumer, not a transport"
                    )))
                }
                None => {
                    return Err(Error::not_found(format!(
                        "Transport {transport_id} not found"
                    )))
                }
            }
        };

        transport
            .connect(dtls_parameters)
            .await
            .map_err(|err| match err {
                Error::EngineFailure(_) => err,
                other => Error::engine(other),
            })?;
        debug!(session = %self.id, transport = %transport_id, "transport connect accepted");
        Ok(())
    }

    async fn consume(&mut self, payload: ConsumeRequest) -> Result<()> {
        let stream_id = payload.stream_id;
        let source = self.router.catalog.source_handle(&stream_id).ok_or_else(|| {
            Error::not_found(format!("Stream {stream_id} not found or not active"))
        })?;

        let (transport, capabilities) = {
            let session = self.session.lock().await;
            let transport = session
                .client_transport()
                .map(|entry| entry.transport.clone())
                .ok_or_else(|| {
                    Error::no_transport("No transport available, create a WebRTC transport first")
                })?;
            let capabilities = session.rtp_capabilities.clone().ok_or_else(|| {
                Error::incompatible("Receive capabilities have not been declared")
            })?;
            (transport, capabilities)
        };

        if !self.router.engine.can_consume(&source, &capabilities) {
            return Err(Error::incompatible(format!(
                "Cannot consume stream {stream_id}: no codec in common"
            )));
        }

        {
            // One stream at a time; the client asked for a new one.
            let mut session = self.session.lock().await;
            for (consumer_id, entry) in session.consumers.drain() {
                debug!(session = %self.id, consumer = %consumer_id, "closing previous consumer");
                entry.consumer.close();
            }
        }

        let consumer = transport.consume(&source, &capabilities, true).await?;
        let consumer_id = consumer.id().to_string();
        self.session.lock().await.consumers.insert(
            consumer_id.clone(),
            ConsumerEntry {
                consumer: consumer.clone(),
                stream_id: stream_id.clone(),
                transport_id: transport.id().to_string(),
            },
        );
        self.watch_consumer(&consumer_id, consumer.subscribe());
        info!(
            session = %self.id,
            consumer = %consumer_id,
            stream = %stream_id,
            "consumer created"
        );

        self.send(ServerMessage::ConsumerReady(ConsumerInfo {
            producer_id: consumer.producer_id().to_string(),
            consumer_id: consumer_id.clone(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            transport_id: transport.id().to_string(),
            stream_id,
        }))
        .await?;

        if let Err(err) = consumer.resume().await {
            warn!(session = %self.id, consumer = %consumer_id, "resume failed: {}", err);
            self.send_error(format!("Failed to resume consumer: {err}")).await;
        }
        Ok(())
    }

    fn watch_transport(&self, transport_id: &str, rx: broadcast::Receiver<TransportEvent>) {
        let transport_id = transport_id.to_string();
        forward(rx, self.events_tx.clone(), move |event| {
            let last = event == TransportEvent::Closed;
            (
                ResourceEvent::Transport {
                    transport_id: transport_id.clone(),
                    event,
                },
                last,
            )
        });
    }

    fn watch_consumer(&self, consumer_id: &str, rx: broadcast::Receiver<ConsumerEvent>) {
        let consumer_id = consumer_id.to_string();
        forward(rx, self.events_tx.clone(), move |event| {
            let last = event == ConsumerEvent::Closed;
            (
                ResourceEvent::Consumer {
                    consumer_id: consumer_id.clone(),
                    event,
                },
                last,
            )
        });
    }

    /// Next engine notification for one of this session's resources.
    pub async fn next_resource_event(&mut self) -> Option<ResourceEvent> {
        self.events_rx.recv().await
    }

    pub async fn handle_resource_event(&mut self, event: ResourceEvent) {
        match event {
            ResourceEvent::Transport {
                transport_id,
                event: TransportEvent::StateChanged(state),
            } => {
                let known = {
                    let mut session = self.session.lock().await;
                    match session.transports.get_mut(&transport_id) {
                        Some(entry) => {
                            entry.state = state;
                            true
                        }
                        None => false,
                    }
                };
                if !known {
                    return;
                }
                info!(session = %self.id, transport = %transport_id, %state, "transport state changed");
                if state.is_terminal() {
                    self.drop_transport(&transport_id).await;
                }
            }
            ResourceEvent::Transport {
                transport_id,
                event: TransportEvent::Closed,
            } => {
                self.drop_transport(&transport_id).await;
            }
            ResourceEvent::Consumer { consumer_id, event } => {
                let removed = self.session.lock().await.consumers.remove(&consumer_id);
                let Some(entry) = removed else {
                    return;
                };
                if event == ConsumerEvent::ProducerClosed {
                    info!(
                        session = %self.id,
                        consumer = %consumer_id,
                        stream = %entry.stream_id,
                        "source closed"
                    );
                }
                entry.consumer.close();
                self.notify_consumer_closed(consumer_id).await;
            }
        }
    }

    /// Close a transport that failed or was closed underneath us, together
    /// with its consumers. The client is told about each consumer.
    async fn drop_transport(&mut self, transport_id: &str) {
        let (transport, consumers) = {
            let mut session = self.session.lock().await;
            let Some(entry) = session.transports.remove(transport_id) else {
                return;
            };
            (entry.transport, session.take_consumers_on(transport_id))
        };
        for (consumer_id, entry) in consumers {
            entry.consumer.close();
            self.notify_consumer_closed(consumer_id).await;
        }
        transport.close();
        info!(session = %self.id, transport = %transport_id, "transport dropped");
    }

    async fn notify_consumer_closed(&self, consumer_id: String) {
        let message = ServerMessage::ConsumerClosed(ConsumerClosed { consumer_id });
        if self.send(message).await.is_err() {
            debug!(session = %self.id, "connection gone before consumerClosed");
        }
    }

    /// Release every resource of the session and forget it. Safe to call more
    /// than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.session.lock().await.close_all();
        self.router.registry.remove(&self.id).await;
        info!(session = %self.id, "session closed");
    }
}

fn forward<E, F>(
    mut rx: broadcast::Receiver<E>,
    tx: mpsc::UnboundedSender<ResourceEvent>,
    mut tag: F,
) where
    E: Clone + Send + 'static,
    F: FnMut(E) -> (ResourceEvent, bool) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let (event, last) = tag(event);
                    if tx.send(event).is_err() || last {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("resource event subscriber lagged by {}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.max_message_size(state.max_message_bytes)
        .max_frame_size(state.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state.router, addr))
}

async fn handle_socket(stream: WebSocket, router: SignalRouter, addr: SocketAddr) {
    info!("client connecting from {}", addr);
    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(WS_OUTBOX_CAPACITY);
    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match message.encode() {
                Ok(text) => text,
                Err(err) => {
                    warn!("failed to encode {}: {}", message.action(), err);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = disconnect_tx.try_send(());
    });

    let mut connection = match router.accept(tx).await {
        Ok(connection) => connection,
        Err(err) => {
            warn!("failed to open session for {}: {}", addr, err);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => break,
            Some(event) = connection.next_resource_event() => {
                connection.handle_resource_event(event).await;
            }
            msg = receiver.next() => {
                let Some(msg) = msg else { break; };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!("socket error from {}: {}", addr, err);
                        break;
                    }
                };
                match msg {
                    Message::Text(text) => connection.handle_text(&text).await,
                    Message::Binary(_) => {
                        connection
                            .send_error("Binary messages are not supported")
                            .await;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    connection.close().await;
    info!("client disconnected: {}", addr);
}
