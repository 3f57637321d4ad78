use std::sync::Arc;

use airwave_common::Result;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::device::{Device, PlaybackSink};
use crate::session::{SessionHandle, SessionMachine};
use crate::signaling::SignalingChannel;
use crate::types::{ClientConfig, UiEvent};

/// A listener: signaling channel plus the session machine driving it.
///
/// Subscribe to UI events before calling `connect`; the server sends its
/// stream list as soon as the socket opens.
pub struct AirwaveClient {
    channel: SignalingChannel,
    session: SessionHandle,
    machine: JoinHandle<()>,
}

impl AirwaveClient {
    pub fn new(config: ClientConfig, device: Box<dyn Device>, sink: Box<dyn PlaybackSink>) -> Self {
        let channel = SignalingChannel::new(config.url.clone(), config.reconnect);
        let server = channel.subscribe();
        let (machine, session) = SessionMachine::new(
            device,
            sink,
            Arc::new(channel.clone()),
            config.stats_interval,
        );
        let machine = tokio::spawn(machine.run(server));

        Self {
            channel,
            session,
            machine,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.session.subscribe()
    }

    pub async fn connect(&self) -> Result<()> {
        self.channel.connect().await
    }

    pub fn start_consuming(&self, stream_id: impl Into<String>) {
        self.session.start_consuming(stream_id);
    }

    /// Forwards a user gesture so blocked playback can be retried.
    pub fn user_interaction(&self) {
        self.session.user_interaction();
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Tears down local media, then the signaling connection.
    pub async fn disconnect(self) {
        self.session.disconnect();
        let _ = self.machine.await;
        self.channel.disconnect().await;
        info!("client disconnected");
    }
}
