//! Device implementation without a media stack, used by `airwave-listen`.
//!
//! It negotiates like a real receiver (capabilities, DTLS parameters,
//! consumers) but renders nothing. Its transports treat the DTLS step as done
//! once the connect message has been handed to the signaling channel.

use airwave_common::rtp::{DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind, RtpCapabilities};
use airwave_common::{ConnectionState, ConsumerInfo, Error, Result, TransportOptions};
use async_trait::async_trait;
use rand::RngCore;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::device::{
    ConnectCallback, Consumer, ConsumerEvent, ConsumerNotifier, Device, PlaybackError,
    PlaybackSink, RecvTransport, TransportEvent, TransportNotifier,
};
use crate::stats::InboundRtpReport;

fn random_fingerprint() -> String {
    let mut digest = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut digest);
    digest
        .iter()
        .map(|byte| hex::encode_upper([*byte]))
        .collect::<Vec<_>>()
        .join(":")
}

#[derive(Debug, Default)]
pub struct HeadlessDevice {
    capabilities: Option<RtpCapabilities>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Device for HeadlessDevice {
    async fn load(&mut self, router_capabilities: &RtpCapabilities) -> Result<()> {
        let mut capabilities = router_capabilities.clone();
        capabilities.codecs.retain(|codec| codec.kind == MediaKind::Audio);
        if capabilities.codecs.is_empty() {
            return Err(Error::incompatible("Router offers no audio codec"));
        }
        debug!("device loaded with {} audio codec(s)", capabilities.codecs.len());
        self.capabilities = Some(capabilities);
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
        if !self.is_loaded() {
            return Err(Error::engine("Device is not loaded"));
        }
        if options.dtls_parameters.fingerprints.is_empty() {
            return Err(Error::engine("Server DTLS parameters carry no fingerprint"));
        }

        let (callback, done) = ConnectCallback::new();
        notifier.notify(TransportEvent::Connect {
            dtls_parameters: DtlsParameters {
                role: Some(DtlsRole::Client),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".into(),
                    value: random_fingerprint(),
                }],
            },
            callback,
        });

        let events = notifier.clone();
        let handshake = tokio::spawn(async move {
            match done.await {
                Ok(Ok(())) => {
                    events.notify(TransportEvent::StateChanged(ConnectionState::Connecting));
                    events.notify(TransportEvent::StateChanged(ConnectionState::Connected));
                }
                Ok(Err(err)) => {
                    debug!("transport connect failed: {}", err);
                    events.notify(TransportEvent::StateChanged(ConnectionState::Failed));
                }
                Err(_) => {
                    events.notify(TransportEvent::StateChanged(ConnectionState::Failed));
                }
            }
        });

        Ok(Box::new(HeadlessTransport {
            id: options.transport_id.clone(),
            notifier,
            handshake,
            consumers: Vec::new(),
            closed: false,
        }))
    }
}

pub struct HeadlessTransport {
    id: String,
    notifier: TransportNotifier,
    handshake: JoinHandle<()>,
    consumers: Vec<ConsumerNotifier>,
    closed: bool,
}

#[async_trait]
impl RecvTransport for HeadlessTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn consume(
        &mut self,
        info: &ConsumerInfo,
        notifier: ConsumerNotifier,
    ) -> Result<Box<dyn Consumer>> {
        if self.closed {
            return Err(Error::engine(format!("Transport {} is closed", self.id)));
        }
        if info.kind != MediaKind::Audio {
            return Err(Error::incompatible(format!("Cannot play {} media", info.kind)));
        }
        self.consumers.push(notifier);
        Ok(Box::new(HeadlessConsumer {
            id: info.consumer_id.clone(),
            codec: info
                .rtp_parameters
                .codecs
                .first()
                .map(|codec| codec.mime_type.clone()),
            closed: false,
        }))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.handshake.abort();
        for consumer in self.consumers.drain(..) {
            consumer.notify(ConsumerEvent::TransportClosed);
        }
        debug!(transport_id = %self.notifier.transport_id(), "transport closed");
    }
}

impl Drop for HeadlessTransport {
    fn drop(&mut self) {
        self.handshake.abort();
    }
}

pub struct HeadlessConsumer {
    id: String,
    codec: Option<String>,
    closed: bool,
}

#[async_trait]
impl Consumer for HeadlessConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn stats(&self) -> Result<InboundRtpReport> {
        if self.closed {
            return Err(Error::not_found(format!("Consumer {} is closed", self.id)));
        }
        Ok(InboundRtpReport {
            codec_mime_type: self.codec.clone(),
            ..Default::default()
        })
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Sink that accepts playback without rendering anything.
#[derive(Debug, Default)]
pub struct NullSink {
    attached: Option<String>,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlaybackSink for NullSink {
    fn attach(&mut self, info: &ConsumerInfo) {
        self.attached = Some(info.consumer_id.clone());
    }

    async fn play(&mut self) -> std::result::Result<(), PlaybackError> {
        match &self.attached {
            Some(consumer_id) => {
                info!(consumer_id = %consumer_id, "playback started");
                Ok(())
            }
            None => Err(PlaybackError::Failed("No consumer attached".into())),
        }
    }

    fn detach(&mut self) {
        self.attached = None;
    }
}
