//! The capability surface the signaling core needs from a media engine.
//!
//! The engine owns ICE/DTLS negotiation and RTP forwarding; the core only
//! creates, connects and closes resources through these traits and listens to
//! their notifications.

use std::sync::Arc;

use airwave_common::rtp::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpCodecCapability,
    RtpParameters,
};
use airwave_common::{ConnectionState, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Engine-side handle of an ingest source (a producer) that consumers can be
/// bound to.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceHandle {
    pub producer_id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    pub codec: RtpCodecCapability,
    pub ssrc: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// ICE/DTLS transport towards a browser
    WebRtc,
    /// Plain RTP transport, used for ingest
    Plain,
}

/// Notifications emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Security (DTLS) state changed; `failed` and `closed` are terminal.
    StateChanged(ConnectionState),
    /// The transport was closed, by anyone.
    Closed,
}

/// Notifications emitted by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    /// The producer feeding this consumer went away. `Closed` follows.
    ProducerClosed,
    /// The consumer was closed, by anyone.
    Closed,
}

#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Codecs and header extensions the router can forward.
    fn receive_capabilities(&self) -> RtpCapabilities;

    /// Create a client-facing transport scoped to one signaling session.
    async fn create_transport(&self, session_id: Uuid) -> Result<Arc<dyn EngineTransport>>;

    /// Whether a receiver with `capabilities` can decode `source`.
    fn can_consume(&self, source: &SourceHandle, capabilities: &RtpCapabilities) -> bool;

    /// Resolves with a reason once the engine worker is gone. The process
    /// cannot continue after that.
    async fn died(&self) -> String;
}

#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TransportKind;
    fn ice_parameters(&self) -> IceParameters;
    fn ice_candidates(&self) -> Vec<IceCandidate>;
    fn dtls_parameters(&self) -> DtlsParameters;
    fn state(&self) -> ConnectionState;

    /// Hand the remote DTLS parameters to the engine. Fails on bad parameters
    /// or when called twice.
    async fn connect(&self, remote: DtlsParameters) -> Result<()>;

    async fn consume(
        &self,
        source: &SourceHandle,
        capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn EngineConsumer>>;

    /// Idempotent. Closes every consumer created on this transport.
    fn close(&self);
    fn is_closed(&self) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

#[async_trait]
pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> &str;
    fn producer_id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    fn is_paused(&self) -> bool;
    async fn resume(&self) -> Result<()>;

    /// Idempotent.
    fn close(&self);
    fn is_closed(&self) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent>;
}
