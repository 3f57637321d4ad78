//! WebSocket signaling channel with an outbound queue and fixed-delay
//! reconnects.
//!
//! The socket is owned by a single actor task. Connection attempts, the
//! socket reader and the reconnect timer run as helper tasks that report back
//! to the actor tagged with the generation they were started under, so a
//! report from a superseded connection is ignored.

use std::collections::VecDeque;

use airwave_common::{ClientMessage, Error, Result, ServerMessage};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::types::ReconnectPolicy;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const LISTENER_CAPACITY: usize = 64;

enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Send(ClientMessage),
    Disconnect(oneshot::Sender<()>),
}

enum LinkEvent {
    Opened { generation: u64, ws: Box<WsStream> },
    Failed { generation: u64, reason: String },
    Frame { generation: u64, text: String },
    Closed { generation: u64 },
    Retry { generation: u64 },
}

/// Handle to the signaling actor. Cheap to clone; the actor stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct SignalingChannel {
    commands: mpsc::UnboundedSender<Command>,
    listeners: broadcast::Sender<ServerMessage>,
}

impl SignalingChannel {
    /// Spawns the actor. Nothing is dialed until `connect` or `send`.
    pub fn new(url: Url, policy: ReconnectPolicy) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (listeners, _) = broadcast::channel(LISTENER_CAPACITY);

        let actor = Actor {
            url,
            policy,
            listeners: listeners.clone(),
            link_tx,
            link: Link::Idle,
            generation: 0,
            attempts: 0,
            queue: VecDeque::new(),
            waiters: Vec::new(),
            retry: None,
        };
        tokio::spawn(actor.run(command_rx, link_rx));

        Self {
            commands,
            listeners,
        }
    }

    /// Resolves once the socket is open. Concurrent callers share the attempt
    /// in flight. Fails once the reconnect ceiling is reached.
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect(tx))
            .map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Sends now if open, otherwise queues the message in order.
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        self.commands
            .send(Command::Send(message))
            .map_err(|_| actor_gone())
    }

    /// Decoded server messages. Messages that arrive while nobody is
    /// subscribed are lost, so subscribe before connecting.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.listeners.subscribe()
    }

    /// Drops the queue, closes the socket and suppresses reconnects until the
    /// next explicit `connect`.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

fn actor_gone() -> Error {
    Error::channel("Signaling channel has stopped")
}

enum Link {
    Idle,
    Connecting,
    Open(SplitSink<WsStream, Message>),
}

struct Actor {
    url: Url,
    policy: ReconnectPolicy,
    listeners: broadcast::Sender<ServerMessage>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link: Link,
    generation: u64,
    attempts: u32,
    queue: VecDeque<String>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    retry: Option<JoinHandle<()>>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some(event) = link_rx.recv() => self.on_link_event(event).await,
            }
        }

        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
        if let Link::Open(mut sink) = std::mem::replace(&mut self.link, Link::Idle) {
            let _ = sink.close().await;
        }
        debug!("signaling actor stopped");
    }

    fn exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    /// Idle with no timer pending: nothing will dial unless we do.
    fn dormant(&self) -> bool {
        matches!(self.link, Link::Idle) && self.retry.is_none()
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect(waiter) => {
                if matches!(self.link, Link::Open(_)) {
                    let _ = waiter.send(Ok(()));
                    return;
                }
                self.waiters.push(waiter);
                if self.dormant() {
                    // an explicit connect gets a fresh retry budget
                    self.attempts = 0;
                    self.start_attempt();
                }
            }
            Command::Send(message) => {
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("failed to encode {}: {}", message.action(), err);
                        return;
                    }
                };
                self.queue.push_back(text);
                match self.link {
                    Link::Open(_) => self.flush().await,
                    Link::Idle if self.retry.is_none() && !self.exhausted() => {
                        self.start_attempt()
                    }
                    _ => debug!("queued {} ({} pending)", message.action(), self.queue.len()),
                }
            }
            Command::Disconnect(done) => {
                self.queue.clear();
                self.attempts = self.policy.max_attempts;
                if let Some(retry) = self.retry.take() {
                    retry.abort();
                }
                self.generation += 1;
                if let Link::Open(mut sink) = std::mem::replace(&mut self.link, Link::Idle) {
                    let _ = sink.close().await;
                }
                self.reject_waiters("Signaling channel disconnected");
                info!("signaling channel disconnected");
                let _ = done.send(());
            }
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened { generation, ws } if generation == self.generation => {
                let (sink, stream) = (*ws).split();
                spawn_reader(stream, generation, self.link_tx.clone());
                self.link = Link::Open(sink);
                self.attempts = 0;
                info!("signaling channel open: {}", self.url);

                self.flush().await;
                if matches!(self.link, Link::Open(_)) {
                    for waiter in self.waiters.drain(..) {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }
            LinkEvent::Opened { ws, .. } => {
                let mut ws = *ws;
                let _ = ws.close(None).await;
            }
            LinkEvent::Failed { generation, reason } if generation == self.generation => {
                warn!("signaling connection failed: {}", reason);
                self.link_lost();
            }
            LinkEvent::Frame { generation, text } if generation == self.generation => {
                match ServerMessage::decode(&text) {
                    Ok(message) => {
                        debug!("received {}", message.action());
                        let _ = self.listeners.send(message);
                    }
                    Err(err) => warn!("dropping signaling frame: {}", err),
                }
            }
            LinkEvent::Closed { generation } if generation == self.generation => {
                info!("signaling connection closed");
                self.link_lost();
            }
            LinkEvent::Retry { generation } if generation == self.generation => {
                self.retry = None;
                self.start_attempt();
            }
            _ => debug!("ignoring event from a superseded connection"),
        }
    }

    fn start_attempt(&mut self) {
        self.generation += 1;
        self.link = Link::Connecting;

        let generation = self.generation;
        let url = self.url.clone();
        let link_tx = self.link_tx.clone();
        debug!(generation, "dialing {}", url);
        tokio::spawn(async move {
            let event = match connect_async(url.as_str()).await {
                Ok((ws, _)) => LinkEvent::Opened {
                    generation,
                    ws: Box::new(ws),
                },
                Err(err) => LinkEvent::Failed {
                    generation,
                    reason: err.to_string(),
                },
            };
            let _ = link_tx.send(event);
        });
    }

    fn link_lost(&mut self) {
        self.link = Link::Idle;
        self.generation += 1;

        if self.exhausted() {
            error!(
                "signaling channel gave up after {} reconnect attempts",
                self.policy.max_attempts
            );
            self.reject_waiters("Signaling channel disconnected permanently after retries");
            return;
        }

        self.attempts += 1;
        let generation = self.generation;
        let delay = self.policy.delay;
        let link_tx = self.link_tx.clone();
        info!(
            "reconnecting in {:?} (attempt {}/{})",
            delay, self.attempts, self.policy.max_attempts
        );
        self.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = link_tx.send(LinkEvent::Retry { generation });
        }));
    }

    async fn flush(&mut self) {
        while let Some(text) = self.queue.pop_front() {
            let Link::Open(sink) = &mut self.link else {
                self.queue.push_front(text);
                return;
            };
            if let Err(err) = sink.send(Message::Text(text.clone().into())).await {
                warn!("signaling send failed: {}", err);
                self.queue.push_front(text);
                self.link_lost();
                return;
            }
        }
    }

    fn reject_waiters(&mut self, reason: &str) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(Error::channel(reason)));
        }
    }
}

fn spawn_reader(
    mut stream: SplitStream<WsStream>,
    generation: u64,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
) {
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    let frame = LinkEvent::Frame {
                        generation,
                        text: text.to_string(),
                    };
                    if link_tx.send(frame).is_err() {
                        return;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!("signaling read error: {}", err);
                    break;
                }
            }
        }
        let _ = link_tx.send(LinkEvent::Closed { generation });
    });
}
