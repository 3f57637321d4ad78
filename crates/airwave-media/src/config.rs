use std::net::{IpAddr, Ipv4Addr};

use airwave_common::rtp::{MediaKind, RtcpFeedback, RtpCodecCapability};
use airwave_common::{Error, Result};
use serde_json::Map;

/// Settings for the media engine: where client transports listen and which
/// codecs the router accepts.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub listen_ip: IpAddr,
    /// Address placed in ICE candidates; falls back to `listen_ip`.
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl EngineConfig {
    /// μ-law mono at 8 kHz, the format the ingest pipeline produces.
    pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
        vec![RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/PCMU".to_string(),
            preferred_payload_type: Some(0),
            clock_rate: 8000,
            channels: Some(1),
            parameters: Map::new(),
            rtcp_feedback: vec![RtcpFeedback::new("transport-cc")],
        }]
    }

    pub fn announced_address(&self) -> String {
        self.announced_ip
            .clone()
            .unwrap_or_else(|| self.listen_ip.to_string())
    }

    pub fn validate(&self) -> Result<()> {
        if self.rtc_min_port == 0 || self.rtc_min_port > self.rtc_max_port {
            return Err(Error::config(format!(
                "invalid RTC port range {}-{}",
                self.rtc_min_port, self.rtc_max_port
            )));
        }
        if !self.enable_udp && !self.enable_tcp {
            return Err(Error::config("at least one of UDP or TCP must be enabled"));
        }
        if self.media_codecs.is_empty() {
            return Err(Error::config("router needs at least one media codec"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            announced_ip: None,
            rtc_min_port: 20000,
            rtc_max_port: 20100,
            enable_udp: true,
            enable_tcp: true,
            media_codecs: Self::default_media_codecs(),
        }
    }
}
