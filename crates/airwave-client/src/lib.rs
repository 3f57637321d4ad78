pub mod client;
pub mod device;
pub mod headless;
pub mod session;
pub mod signaling;
pub mod stats;
pub mod types;

pub use client::AirwaveClient;
pub use device::{
    ConnectCallback, Consumer, ConsumerEvent, ConsumerNotifier, Device, PlaybackError,
    PlaybackSink, RecvTransport, TransportEvent, TransportNotifier,
};
pub use headless::{HeadlessDevice, NullSink};
pub use session::{SessionHandle, SessionInput, SessionMachine, SignalSink};
pub use signaling::SignalingChannel;
pub use stats::{InboundRtpReport, StatsSnapshot, StatsTracker};
pub use types::{ClientConfig, ReconnectPolicy, UiEvent};
