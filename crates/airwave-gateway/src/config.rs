use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use airwave_common::{Error, Result, StreamInfo};
use airwave_media::{EngineConfig, LocalEngine, SourceSpec, StaticCatalog};
use serde::Deserialize;
use tracing::info;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3001";
const DEFAULT_STREAMS_CONFIG: &str = "config/streams.json";
const DEFAULT_WS_MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub allow_public_bind: bool,
    pub engine: EngineConfig,
    pub streams_path: PathBuf,
    pub ws_max_message_bytes: usize,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build the configuration from a variable lookup. Unset variables take
    /// their defaults; set but unparsable ones are an error.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_ip: IpAddr = parse_var(&var, "AIRWAVE_WEBRTC_LISTEN_IP", "127.0.0.1")?;
        let engine = EngineConfig {
            listen_ip,
            announced_ip: var("AIRWAVE_WEBRTC_ANNOUNCED_IP").filter(|v| !v.trim().is_empty()),
            rtc_min_port: parse_var(&var, "AIRWAVE_RTC_MIN_PORT", "20000")?,
            rtc_max_port: parse_var(&var, "AIRWAVE_RTC_MAX_PORT", "20100")?,
            ..EngineConfig::default()
        };
        engine.validate()?;

        let ws_max_message_bytes: usize = parse_var(
            &var,
            "AIRWAVE_WS_MAX_MESSAGE_BYTES",
            &DEFAULT_WS_MAX_MESSAGE_BYTES.to_string(),
        )?;
        if ws_max_message_bytes == 0 {
            return Err(Error::config("AIRWAVE_WS_MAX_MESSAGE_BYTES must be positive"));
        }

        Ok(Self {
            bind_addr: parse_var(&var, "AIRWAVE_GATEWAY_BIND_ADDR", DEFAULT_BIND_ADDR)?,
            allow_public_bind: var("AIRWAVE_ALLOW_PUBLIC_BIND")
                .map(|v| is_truthy(&v))
                .unwrap_or(false),
            engine,
            streams_path: var("AIRWAVE_STREAMS_CONFIG")
                .unwrap_or_else(|| DEFAULT_STREAMS_CONFIG.to_string())
                .into(),
            ws_max_message_bytes,
        })
    }

    pub fn check_public_bind_allowed(&self) -> Result<()> {
        if self.bind_addr.ip().is_loopback() || self.allow_public_bind {
            return Ok(());
        }
        Err(Error::config(format!(
            "refusing non-loopback bind {} without AIRWAVE_ALLOW_PUBLIC_BIND=1",
            self.bind_addr
        )))
    }
}

fn parse_var<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: &str,
) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw = var(name).unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse()
        .map_err(|err| Error::config(format!("{name}={raw:?}: {err}")))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// One entry of the stream catalogue file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    pub id: String,
    pub name: String,
    pub rtp_port: u16,
    pub ssrc: u32,
    pub payload_type: u8,
    pub codec: String,
}

pub fn load_streams(path: &Path) -> Result<Vec<StreamConfig>> {
    let text = std::fs::read_to_string(path)?;
    parse_streams(&text)
}

pub fn parse_streams(text: &str) -> Result<Vec<StreamConfig>> {
    let streams: Vec<StreamConfig> = serde_json::from_str(text)
        .map_err(|err| Error::config(format!("invalid stream catalogue: {err}")))?;

    let mut seen = HashSet::new();
    for stream in &streams {
        if stream.id.trim().is_empty() {
            return Err(Error::config("stream id must not be empty"));
        }
        if !seen.insert(stream.id.as_str()) {
            return Err(Error::config(format!("duplicate stream id {}", stream.id)));
        }
        if !stream
            .codec
            .get(..6)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("audio/"))
        {
            return Err(Error::config(format!(
                "stream {} uses {}, only audio codecs are supported",
                stream.id, stream.codec
            )));
        }
    }
    Ok(streams)
}

/// Open one ingest source per configured stream and publish it.
pub fn open_streams(engine: &LocalEngine, streams: &[StreamConfig]) -> Result<StaticCatalog> {
    let catalog = StaticCatalog::new(
        streams
            .iter()
            .map(|s| StreamInfo {
                id: s.id.clone(),
                name: s.name.clone(),
            })
            .collect(),
    );
    for stream in streams {
        let handle = engine.create_source(&SourceSpec {
            stream_id: stream.id.clone(),
            rtp_port: stream.rtp_port,
            ssrc: stream.ssrc,
            payload_type: stream.payload_type,
            mime_type: stream.codec.clone(),
        })?;
        catalog.publish(
            StreamInfo {
                id: stream.id.clone(),
                name: stream.name.clone(),
            },
            handle,
        );
    }
    info!("{} stream(s) available", catalog.active_count());
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_vars(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:3001".parse().unwrap());
        assert_eq!(config.engine.rtc_min_port, 20000);
        assert_eq!(config.engine.rtc_max_port, 20100);
        assert_eq!(config.ws_max_message_bytes, 65536);
        assert_eq!(config.streams_path, PathBuf::from("config/streams.json"));
        assert!(config.check_public_bind_allowed().is_ok());
    }

    #[test]
    fn test_public_bind_requires_opt_in() {
        let config =
            GatewayConfig::from_vars(lookup(&[("AIRWAVE_GATEWAY_BIND_ADDR", "0.0.0.0:3001")]))
                .unwrap();
        assert!(config.check_public_bind_allowed().is_err());

        let config = GatewayConfig::from_vars(lookup(&[
            ("AIRWAVE_GATEWAY_BIND_ADDR", "0.0.0.0:3001"),
            ("AIRWAVE_ALLOW_PUBLIC_BIND", "yes"),
        ]))
        .unwrap();
        assert!(config.check_public_bind_allowed().is_ok());
    }

    #[test]
    fn test_bad_port_is_a_config_error() {
        let err = GatewayConfig::from_vars(lookup(&[("AIRWAVE_RTC_MIN_PORT", "lots")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("AIRWAVE_RTC_MIN_PORT"));
    }

    #[test]
    fn test_announced_ip() {
        let config = GatewayConfig::from_vars(lookup(&[
            ("AIRWAVE_WEBRTC_LISTEN_IP", "0.0.0.0"),
            ("AIRWAVE_WEBRTC_ANNOUNCED_IP", "198.51.100.4"),
        ]))
        .unwrap();
        assert_eq!(config.engine.announced_address(), "198.51.100.4");
    }

    #[test]
    fn test_parse_streams() {
        let streams = parse_streams(
            r#"[{"id":"radio1","name":"Radio One","rtpPort":5004,"ssrc":11111111,"payloadType":0,"codec":"audio/PCMU"}]"#,
        )
        .unwrap();
        assert_eq!(streams[0].rtp_port, 5004);
        assert_eq!(streams[0].name, "Radio One");
    }

    #[test]
    fn test_duplicate_stream_ids_rejected() {
        let entry =
            r#"{"id":"radio1","name":"A","rtpPort":5004,"ssrc":1,"payloadType":0,"codec":"audio/PCMU"}"#;
        let err = parse_streams(&format!("[{entry},{entry}]")).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_missing_catalogue_is_an_io_error() {
        let err = load_streams(Path::new("/nonexistent/airwave/streams.json")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_video_stream_rejected() {
        let err = parse_streams(
            r#"[{"id":"cam","name":"Cam","rtpPort":5004,"ssrc":1,"payloadType":96,"codec":"video/VP8"}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_open_streams_publishes_sources() {
        let engine = LocalEngine::new(EngineConfig::default()).unwrap();
        let streams = parse_streams(
            r#"[
                {"id":"radio1","name":"Radio One","rtpPort":5004,"ssrc":11111111,"payloadType":0,"codec":"audio/PCMU"},
                {"id":"radio2","name":"Radio Two","rtpPort":5006,"ssrc":22222222,"payloadType":0,"codec":"audio/pcmu"}
            ]"#,
        )
        .unwrap();
        let catalog = open_streams(&engine, &streams).unwrap();
        assert_eq!(catalog.active_count(), 2);
    }
}
