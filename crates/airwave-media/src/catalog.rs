use std::collections::HashMap;
use std::sync::RwLock;

use airwave_common::StreamInfo;

use crate::engine::SourceHandle;

/// Registry of the streams listeners may pick from.
pub trait StreamCatalog: Send + Sync + 'static {
    /// Every configured stream, in configuration order.
    fn list_available(&self) -> Vec<StreamInfo>;

    /// Engine handle for a stream, or `None` when it has no active source.
    fn source_handle(&self, stream_id: &str) -> Option<SourceHandle>;
}

/// Catalog backed by the configured stream list. Sources are published once
/// the engine has opened them and withdrawn when they close.
#[derive(Default)]
pub struct StaticCatalog {
    streams: RwLock<Vec<StreamInfo>>,
    sources: RwLock<HashMap<String, SourceHandle>>,
}

impl StaticCatalog {
    pub fn new(streams: Vec<StreamInfo>) -> Self {
        Self {
            streams: RwLock::new(streams),
            sources: RwLock::new(HashMap::new()),
        }
    }

    /// Attach an active source to a stream, adding the stream to the listing
    /// if it was not configured.
    pub fn publish(&self, info: StreamInfo, handle: SourceHandle) {
        {
            let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
            if !streams.iter().any(|s| s.id == info.id) {
                streams.push(info.clone());
            }
        }
        self.sources
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(info.id, handle);
    }

    /// Detach the source of a stream. The stream stays listed.
    pub fn withdraw(&self, stream_id: &str) -> Option<SourceHandle> {
        self.sources
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(stream_id)
    }

    pub fn active_count(&self) -> usize {
        self.sources.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl StreamCatalog for StaticCatalog {
    fn list_available(&self) -> Vec<StreamInfo> {
        self.streams
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn source_handle(&self, stream_id: &str) -> Option<SourceHandle> {
        self.sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(stream_id)
            .cloned()
    }
}
