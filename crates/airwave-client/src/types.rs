use std::time::Duration;

use airwave_common::{ConnectionState, Error, Result, StreamInfo};
use serde::Serialize;
use url::Url;

use crate::stats::StatsSnapshot;

pub const DEFAULT_MAX_RECONNECTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_millis(1000);

/// Fixed-interval reconnect schedule for the signaling channel.
///
/// `max_attempts` counts retries after the first connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECTS,
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: Url,
    pub reconnect: ReconnectPolicy,
    pub stats_interval: Duration,
}

impl ClientConfig {
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            url: parse_signaling_url(url)?,
            reconnect: ReconnectPolicy::default(),
            stats_interval: DEFAULT_STATS_INTERVAL,
        })
    }
}

pub fn parse_signaling_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|err| Error::config(format!("invalid url {raw}: {err}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(Error::config(format!(
            "signaling url must use ws or wss, got {other}"
        ))),
    }
}

/// Events published to whatever renders the client (a page, a CLI).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "detail", rename_all = "camelCase")]
pub enum UiEvent {
    StreamsAvailable {
        streams: Vec<StreamInfo>,
    },
    DeviceReady,
    #[serde(rename_all = "camelCase")]
    ConnectionStateChange {
        state: ConnectionState,
        stream_name: String,
    },
    Status(String),
    InteractionRequired,
    StatsUpdated(StatsSnapshot),
    StatsCleared,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_scheme_is_checked() {
        assert!(parse_signaling_url("ws://127.0.0.1:3001/ws").is_ok());
        assert!(parse_signaling_url("wss://radio.example/ws").is_ok());
        assert!(matches!(
            parse_signaling_url("http://127.0.0.1:3001/ws"),
            Err(Error::Config(_))
        ));
        assert!(parse_signaling_url("not a url").is_err());
    }

    #[test]
    fn test_state_change_wire_shape() {
        let event = UiEvent::ConnectionStateChange {
            state: ConnectionState::Connected,
            stream_name: "Radio One".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "connectionStateChange");
        assert_eq!(json["detail"]["state"], "connected");
        assert_eq!(json["detail"]["streamName"], "Radio One");
    }

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay, Duration::from_millis(3000));
    }
}
