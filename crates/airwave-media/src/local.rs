//! In-process media engine.
//!
//! Hands out transports and consumers with real negotiation parameters (ICE
//! credentials, candidates on the announced address, DTLS fingerprints, RTP
//! parameters negotiated against the receiver) and drives their lifecycle
//! events. It does not move media itself.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use airwave_common::rtp::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    RtcpParameters, RtpCapabilities, RtpCodecCapability, RtpCodecParameters,
    RtpEncodingParameters, RtpHeaderExtension, RtpParameters,
};
use airwave_common::{ConnectionState, Error, Result};
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::{
    ConsumerEvent, EngineConsumer, EngineTransport, MediaEngine, SourceHandle, TransportEvent,
    TransportKind,
};

const EVENT_CAPACITY: usize = 16;
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;
const SUPPORTED_FINGERPRINTS: &[&str] = &["sha-1", "sha-224", "sha-256", "sha-384", "sha-512"];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An ingest source to open on the engine.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub stream_id: String,
    /// Local port the ingest pipeline sends RTP to.
    pub rtp_port: u16,
    pub ssrc: u32,
    pub payload_type: u8,
    pub mime_type: String,
}

struct Source {
    handle: SourceHandle,
    rtp_port: u16,
    consumers: Vec<Weak<LocalConsumer>>,
}

struct Inner {
    config: EngineConfig,
    capabilities: RtpCapabilities,
    ports: Mutex<BTreeSet<u16>>,
    transports: Mutex<HashMap<String, Weak<LocalTransport>>>,
    sources: Mutex<HashMap<String, Source>>,
    died: watch::Sender<Option<String>>,
}

impl Inner {
    fn allocate_port(&self) -> Result<u16> {
        let mut used = lock(&self.ports);
        let port = (self.config.rtc_min_port..=self.config.rtc_max_port)
            .find(|port| !used.contains(port))
            .ok_or_else(|| {
                Error::engine(format!(
                    "no free RTC port in {}-{}",
                    self.config.rtc_min_port, self.config.rtc_max_port
                ))
            })?;
        used.insert(port);
        Ok(port)
    }

    fn release_port(&self, port: u16) {
        lock(&self.ports).remove(&port);
    }
}

/// Media engine living inside the gateway process.
#[derive(Clone)]
pub struct LocalEngine {
    inner: Arc<Inner>,
}

impl LocalEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let capabilities = router_capabilities(&config.media_codecs);
        let (died, _) = watch::channel(None);
        info!(
            "media engine ready: {} codec(s), RTC ports {}-{}",
            capabilities.codecs.len(),
            config.rtc_min_port,
            config.rtc_max_port
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                capabilities,
                ports: Mutex::new(BTreeSet::new()),
                transports: Mutex::new(HashMap::new()),
                sources: Mutex::new(HashMap::new()),
                died,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Open an ingest source. The codec must be one the router was
    /// configured with.
    pub fn create_source(&self, spec: &SourceSpec) -> Result<SourceHandle> {
        let router_codec = self
            .inner
            .capabilities
            .codecs
            .iter()
            .find(|codec| codec.mime_type.eq_ignore_ascii_case(&spec.mime_type))
            .ok_or_else(|| {
                Error::incompatible(format!(
                    "codec {} is not supported by the router",
                    spec.mime_type
                ))
            })?;

        let mut sources = lock(&self.inner.sources);
        if sources.values().any(|s| s.rtp_port == spec.rtp_port) {
            return Err(Error::engine(format!(
                "RTP port {} is already used by another source",
                spec.rtp_port
            )));
        }
        if sources.values().any(|s| s.handle.stream_id == spec.stream_id) {
            return Err(Error::engine(format!(
                "stream {} already has a source",
                spec.stream_id
            )));
        }

        let mut codec = router_codec.clone();
        codec.preferred_payload_type = Some(spec.payload_type);
        let handle = SourceHandle {
            producer_id: Uuid::new_v4().to_string(),
            stream_id: spec.stream_id.clone(),
            kind: codec.kind,
            codec,
            ssrc: spec.ssrc,
        };
        sources.insert(
            handle.producer_id.clone(),
            Source {
                handle: handle.clone(),
                rtp_port: spec.rtp_port,
                consumers: Vec::new(),
            },
        );
        info!(
            "source {} for stream {} listening on RTP port {}",
            handle.producer_id, spec.stream_id, spec.rtp_port
        );
        Ok(handle)
    }

    /// Close an ingest source. Every consumer bound to it observes
    /// `ProducerClosed` followed by `Closed`.
    pub fn close_source(&self, producer_id: &str) -> Option<SourceHandle> {
        let source = lock(&self.inner.sources).remove(producer_id)?;
        info!(
            "source {} for stream {} closed",
            producer_id, source.handle.stream_id
        );
        for consumer in source.consumers.iter().filter_map(Weak::upgrade) {
            consumer.producer_closed();
        }
        Some(source.handle)
    }

    /// Live transport by id.
    pub fn transport(&self, id: &str) -> Option<Arc<LocalTransport>> {
        lock(&self.inner.transports).get(id).and_then(Weak::upgrade)
    }

    pub fn transport_count(&self) -> usize {
        lock(&self.inner.transports)
            .values()
            .filter(|t| t.strong_count() > 0)
            .count()
    }

    /// Mark the engine as dead. Whoever awaits [`MediaEngine::died`] is woken.
    pub fn kill(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!("media engine died: {}", reason);
        self.inner.died.send_replace(Some(reason));
    }

    fn register_consumer(&self, producer_id: &str, consumer: &Arc<LocalConsumer>) -> bool {
        let mut sources = lock(&self.inner.sources);
        match sources.get_mut(producer_id) {
            Some(source) => {
                source.consumers.retain(|c| c.strong_count() > 0);
                source.consumers.push(Arc::downgrade(consumer));
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    fn receive_capabilities(&self) -> RtpCapabilities {
        self.inner.capabilities.clone()
    }

    async fn create_transport(&self, session_id: Uuid) -> Result<Arc<dyn EngineTransport>> {
        if self.inner.died.borrow().is_some() {
            return Err(Error::engine("media engine is not running"));
        }
        let port = self.inner.allocate_port()?;
        let transport = Arc::new(LocalTransport::new(self.clone(), session_id, port));
        lock(&self.inner.transports).insert(transport.id.clone(), Arc::downgrade(&transport));
        debug!(
            "transport {} created for session {} on port {}",
            transport.id, session_id, port
        );
        Ok(transport)
    }

    fn can_consume(&self, source: &SourceHandle, capabilities: &RtpCapabilities) -> bool {
        capabilities.find_codec(&source.codec).is_some()
    }

    async fn died(&self) -> String {
        let mut rx = self.inner.died.subscribe();
        let result = rx.wait_for(|reason| reason.is_some()).await;
        match result {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "media engine dropped".to_string(),
        }
    }
}

pub struct LocalTransport {
    id: String,
    session_id: Uuid,
    port: u16,
    engine: LocalEngine,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    state: Mutex<ConnectionState>,
    remote_dtls: Mutex<Option<DtlsParameters>>,
    consumers: Mutex<HashMap<String, Arc<LocalConsumer>>>,
    next_mid: AtomicU32,
    closed: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl LocalTransport {
    fn new(engine: LocalEngine, session_id: Uuid, port: u16) -> Self {
        let config = &engine.inner.config;
        let address = config.announced_address();
        let mut ice_candidates = Vec::new();
        if config.enable_udp {
            ice_candidates.push(IceCandidate {
                foundation: "udpcandidate".into(),
                priority: 1_076_302_079,
                ip: address.clone(),
                port,
                candidate_type: "host".into(),
                protocol: "udp".into(),
                tcp_type: None,
            });
        }
        if config.enable_tcp {
            ice_candidates.push(IceCandidate {
                foundation: "tcpcandidate".into(),
                priority: 1_076_276_479,
                ip: address,
                port,
                candidate_type: "host".into(),
                protocol: "tcp".into(),
                tcp_type: Some("passive".into()),
            });
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            port,
            ice_parameters: IceParameters {
                username_fragment: random_token(16),
                password: random_token(32),
                ice_lite: true,
            },
            ice_candidates,
            dtls_parameters: DtlsParameters {
                role: Some(DtlsRole::Auto),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".into(),
                    value: random_fingerprint(),
                }],
            },
            engine,
            state: Mutex::new(ConnectionState::New),
            remote_dtls: Mutex::new(None),
            consumers: Mutex::new(HashMap::new()),
            next_mid: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            events,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Open consumers on this transport.
    pub fn consumer_count(&self) -> usize {
        let mut consumers = lock(&self.consumers);
        consumers.retain(|_, c| !c.is_closed());
        consumers.len()
    }

    /// Move the transport to a new connection state, as the ICE/DTLS stack
    /// would. Reaching `closed` also closes the transport.
    pub fn set_state(&self, state: ConnectionState) {
        if self.is_closed() {
            return;
        }
        *lock(&self.state) = state;
        debug!("transport {} state -> {}", self.id, state);
        let _ = self.events.send(TransportEvent::StateChanged(state));
        if state == ConnectionState::Closed {
            self.close();
        }
    }
}

#[async_trait]
impl EngineTransport for LocalTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebRtc
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    async fn connect(&self, remote: DtlsParameters) -> Result<()> {
        if self.is_closed() {
            return Err(Error::engine(format!("transport {} is closed", self.id)));
        }
        if remote.fingerprints.is_empty() {
            return Err(Error::engine("DTLS parameters carry no fingerprint"));
        }
        if let Some(unsupported) = remote
            .fingerprints
            .iter()
            .find(|f| !SUPPORTED_FINGERPRINTS.contains(&f.algorithm.to_ascii_lowercase().as_str()))
        {
            return Err(Error::engine(format!(
                "unsupported fingerprint algorithm {}",
                unsupported.algorithm
            )));
        }
        {
            let mut current = lock(&self.remote_dtls);
            if current.is_some() {
                return Err(Error::engine(format!(
                    "transport {} is already connected",
                    self.id
                )));
            }
            *current = Some(remote);
        }
        self.set_state(ConnectionState::Connecting);
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn consume(
        &self,
        source: &SourceHandle,
        capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn EngineConsumer>> {
        if self.is_closed() {
            return Err(Error::engine(format!("transport {} is closed", self.id)));
        }
        let receiver_codec = capabilities.find_codec(&source.codec).ok_or_else(|| {
            Error::incompatible(format!(
                "receiver cannot decode {} for stream {}",
                source.codec.mime_type, source.stream_id
            ))
        })?;

        let mid = self.next_mid.fetch_add(1, Ordering::SeqCst);
        let rtp_parameters = consumer_rtp_parameters(&source.codec, receiver_codec, mid);
        let consumer = Arc::new(LocalConsumer::new(
            source.producer_id.clone(),
            source.kind,
            rtp_parameters,
            paused,
        ));
        if !self.engine.register_consumer(&source.producer_id, &consumer) {
            return Err(Error::not_found(format!(
                "producer {} is not active",
                source.producer_id
            )));
        }
        {
            let mut consumers = lock(&self.consumers);
            consumers.retain(|_, c| !c.is_closed());
            consumers.insert(consumer.id.clone(), consumer.clone());
        }
        debug!(
            "consumer {} on transport {} for producer {}",
            consumer.id, self.id, source.producer_id
        );
        Ok(consumer)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *lock(&self.state) = ConnectionState::Closed;
        let consumers: Vec<_> = lock(&self.consumers).drain().map(|(_, c)| c).collect();
        for consumer in consumers {
            consumer.close();
        }
        self.engine.inner.release_port(self.port);
        lock(&self.engine.inner.transports).remove(&self.id);
        let _ = self.events.send(TransportEvent::Closed);
        debug!("transport {} closed", self.id);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!("transport {} dropped without close", self.id);
            self.close();
        }
    }
}

pub struct LocalConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<ConsumerEvent>,
}

impl LocalConsumer {
    fn new(producer_id: String, kind: MediaKind, rtp_parameters: RtpParameters, paused: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id: Uuid::new_v4().to_string(),
            producer_id,
            kind,
            rtp_parameters,
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            events,
        }
    }

    fn producer_closed(&self) {
        if self.is_closed() {
            return;
        }
        let _ = self.events.send(ConsumerEvent::ProducerClosed);
        self.close();
    }
}

#[async_trait]
impl EngineConsumer for LocalConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::engine(format!("consumer {} is closed", self.id)));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(ConsumerEvent::Closed);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.events.subscribe()
    }
}

/// Router capabilities derived from the configured codecs. Codecs without a
/// preferred payload type get one from the dynamic range.
fn router_capabilities(codecs: &[RtpCodecCapability]) -> RtpCapabilities {
    let mut next_dynamic = FIRST_DYNAMIC_PAYLOAD_TYPE;
    let codecs = codecs
        .iter()
        .cloned()
        .map(|mut codec| {
            if codec.preferred_payload_type.is_none() {
                codec.preferred_payload_type = Some(next_dynamic);
                next_dynamic = next_dynamic.saturating_add(1);
            }
            codec
        })
        .collect();

    let extension = |uri: &str, id: u16| RtpHeaderExtension {
        kind: Some(MediaKind::Audio),
        uri: uri.to_string(),
        preferred_id: id,
        preferred_encrypt: false,
        direction: Some("sendrecv".into()),
    };

    RtpCapabilities {
        codecs,
        header_extensions: vec![
            extension("urn:ietf:params:rtp-hdrext:sdes:mid", 1),
            extension("http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time", 4),
            extension(
                "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
                5,
            ),
            extension("urn:ietf:params:rtp-hdrext:ssrc-audio-level", 10),
        ],
    }
}

fn consumer_rtp_parameters(
    router_codec: &RtpCodecCapability,
    receiver_codec: &RtpCodecCapability,
    mid: u32,
) -> RtpParameters {
    let payload_type = receiver_codec
        .preferred_payload_type
        .or(router_codec.preferred_payload_type)
        .unwrap_or(FIRST_DYNAMIC_PAYLOAD_TYPE);
    let rtcp_feedback = router_codec
        .rtcp_feedback
        .iter()
        .filter(|fb| receiver_codec.rtcp_feedback.contains(fb))
        .cloned()
        .collect();

    RtpParameters {
        mid: Some(mid.to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: router_codec.mime_type.clone(),
            payload_type,
            clock_rate: router_codec.clock_rate,
            channels: router_codec.channels,
            parameters: router_codec.parameters.clone(),
            rtcp_feedback,
        }],
        header_extensions: Vec::new(),
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(rand::thread_rng().gen_range(100_000_000..=999_999_999)),
        }],
        rtcp: RtcpParameters {
            cname: Some(hex::encode(rand::random::<[u8; 8]>())),
            reduced_size: true,
        },
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

fn random_fingerprint() -> String {
    rand::random::<[u8; 32]>()
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(":")
}
