//! Per-connection resource bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;

use airwave_common::rtp::RtpCapabilities;
use airwave_common::ConnectionState;
use airwave_media::{EngineConsumer, EngineTransport, TransportKind};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

pub struct TransportEntry {
    pub transport: Arc<dyn EngineTransport>,
    pub state: ConnectionState,
}

pub struct ConsumerEntry {
    pub consumer: Arc<dyn EngineConsumer>,
    pub stream_id: String,
    pub transport_id: String,
}

/// Resources owned by one signaling connection. Only the connection's own
/// handler chain and its cleanup path touch these maps.
pub struct ClientSession {
    pub id: Uuid,
    pub rtp_capabilities: Option<RtpCapabilities>,
    pub transports: HashMap<String, TransportEntry>,
    pub consumers: HashMap<String, ConsumerEntry>,
}

impl ClientSession {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            rtp_capabilities: None,
            transports: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    /// The session's client-facing transport, if it has a live one.
    pub fn client_transport(&self) -> Option<&TransportEntry> {
        self.transports.values().find(|entry| {
            entry.transport.kind() == TransportKind::WebRtc && !entry.transport.is_closed()
        })
    }

    /// Remove every consumer bound to `transport_id`.
    pub fn take_consumers_on(&mut self, transport_id: &str) -> Vec<(String, ConsumerEntry)> {
        let ids: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, entry)| entry.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.consumers.remove(&id).map(|entry| (id, entry)))
            .collect()
    }

    /// Close and forget everything, consumers first.
    pub fn close_all(&mut self) {
        for (_, entry) in self.consumers.drain() {
            entry.consumer.close();
        }
        for (_, entry) in self.transports.drain() {
            entry.transport.close();
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegistryCounts {
    pub sessions: usize,
    pub transports: usize,
    pub consumers: usize,
}

/// All live sessions, keyed by session id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<ClientSession>>>>,
}

impl SessionRegistry {
    pub async fn create(&self) -> Arc<Mutex<ClientSession>> {
        let id = Uuid::new_v4();
        let session = Arc::new(Mutex::new(ClientSession::new(id)));
        self.sessions.write().await.insert(id, session.clone());
        session
    }

    pub async fn get(&self, id: &Uuid) -> Option<Arc<Mutex<ClientSession>>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &Uuid) -> Option<Arc<Mutex<ClientSession>>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn counts(&self) -> RegistryCounts {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut counts = RegistryCounts {
            sessions: sessions.len(),
            ..RegistryCounts::default()
        };
        for session in sessions {
            let session = session.lock().await;
            counts.transports += session.transports.len();
            counts.consumers += session.consumers.len();
        }
        counts
    }
}
