//! Client-side media boundary.
//!
//! The session machine only talks to these traits. A browser build backs them
//! with WebRTC objects; the CLI uses the headless implementations in
//! [`crate::headless`]. Local resources report back through notifiers that
//! feed the machine's input queue, tagged with the resource id so the machine
//! can drop reports from resources it has already replaced.

use std::fmt;

use airwave_common::rtp::{DtlsParameters, RtpCapabilities};
use airwave_common::{ConnectionState, ConsumerInfo, Error, Result, TransportOptions};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::session::SessionInput;
use crate::stats::InboundRtpReport;

/// Completion handle for the DTLS step of a local transport. Consuming `self`
/// guarantees the engine hears back exactly once.
pub struct ConnectCallback {
    done: oneshot::Sender<Result<()>>,
}

impl ConnectCallback {
    pub fn new() -> (Self, oneshot::Receiver<Result<()>>) {
        let (done, rx) = oneshot::channel();
        (Self { done }, rx)
    }

    pub fn succeed(self) {
        let _ = self.done.send(Ok(()));
    }

    pub fn fail(self, err: Error) {
        let _ = self.done.send(Err(err));
    }
}

impl fmt::Debug for ConnectCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectCallback")
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    /// Local DTLS parameters are ready and must reach the server.
    Connect {
        dtls_parameters: DtlsParameters,
        callback: ConnectCallback,
    },
    StateChanged(ConnectionState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerEvent {
    TrackEnded,
    TransportClosed,
}

#[derive(Clone)]
pub struct TransportNotifier {
    transport_id: String,
    inputs: mpsc::UnboundedSender<SessionInput>,
}

impl TransportNotifier {
    pub(crate) fn new(transport_id: String, inputs: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self {
            transport_id,
            inputs,
        }
    }

    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    /// Returns false once the session has stopped.
    pub fn notify(&self, event: TransportEvent) -> bool {
        self.inputs
            .send(SessionInput::Transport {
                transport_id: self.transport_id.clone(),
                event,
            })
            .is_ok()
    }
}

#[derive(Clone)]
pub struct ConsumerNotifier {
    consumer_id: String,
    inputs: mpsc::UnboundedSender<SessionInput>,
}

impl ConsumerNotifier {
    pub(crate) fn new(consumer_id: String, inputs: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self {
            consumer_id,
            inputs,
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn notify(&self, event: ConsumerEvent) -> bool {
        self.inputs
            .send(SessionInput::Consumer {
                consumer_id: self.consumer_id.clone(),
                event,
            })
            .is_ok()
    }
}

#[async_trait]
pub trait Device: Send {
    /// Loads the router's capabilities. Must succeed before any transport is
    /// created.
    async fn load(&mut self, router_capabilities: &RtpCapabilities) -> Result<()>;

    fn is_loaded(&self) -> bool;

    /// What this device can receive, declared to the server after loading.
    fn rtp_capabilities(&self) -> Option<RtpCapabilities>;

    fn create_recv_transport(
        &mut self,
        options: &TransportOptions,
        notifier: TransportNotifier,
    ) -> Result<Box<dyn RecvTransport>>;
}

#[async_trait]
pub trait RecvTransport: Send {
    fn id(&self) -> &str;

    async fn consume(
        &mut self,
        info: &ConsumerInfo,
        notifier: ConsumerNotifier,
    ) -> Result<Box<dyn Consumer>>;

    fn close(&mut self);
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> &str;

    async fn stats(&self) -> Result<InboundRtpReport>;

    fn close(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaybackError {
    /// The platform refuses to start audio without a user gesture.
    #[error("playback requires a user interaction")]
    NotAllowed,
    #[error("{0}")]
    Failed(String),
}

/// Where received audio ends up.
#[async_trait]
pub trait PlaybackSink: Send {
    fn attach(&mut self, info: &ConsumerInfo);

    async fn play(&mut self) -> std::result::Result<(), PlaybackError>;

    fn detach(&mut self);
}
