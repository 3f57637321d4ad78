//! Signaling protocol shared by the gateway and its clients.
//!
//! Every frame is a JSON object `{ "action": string, "payload"?: any }`.
//! Outbound messages serialize through serde's adjacent tagging; inbound
//! frames are decoded once through [`Envelope`] so that an unknown action and
//! a malformed payload can be reported differently.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::rtp::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
};

/// Connection state of a transport, shared by both ends.
///
/// `checking` only ever appears on the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Checking => "checking",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }

    /// `failed` and `closed` are final for the transport that reached them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog entry advertised to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub router_rtp_capabilities: RtpCapabilities,
    pub available_streams: Vec<StreamInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub transport_id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub producer_id: String,
    pub consumer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub transport_id: String,
    pub stream_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerClosed {
    pub consumer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetRtpCapabilities {
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransport {
    pub transport_id: String,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub stream_id: String,
}

/// Messages sent by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", content = "payload", rename_all = "camelCase")]
pub enum ServerMessage {
    ServerInfo(ServerInfo),
    TransportCreated(TransportOptions),
    ConsumerReady(ConsumerInfo),
    ConsumerClosed(ConsumerClosed),
    Error(String),
    RouterCapabilities(RtpCapabilities),
}

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", content = "payload", rename_all = "camelCase")]
pub enum ClientMessage {
    SetRtpCapabilities(SetRtpCapabilities),
    CreateWebRtcTransport,
    ConnectWebRtcTransport(ConnectTransport),
    Consume(ConsumeRequest),
    GetRouterRtpCapabilities,
}

/// Raw frame before the action is resolved.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| Error::protocol(format!("Malformed message: {err}")))
    }
}

fn payload<T: DeserializeOwned>(action: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|err| Error::protocol(format!("Invalid payload for {action}: {err}")))
}

impl ServerMessage {
    pub fn action(&self) -> &'static str {
        match self {
            ServerMessage::ServerInfo(_) => "serverInfo",
            ServerMessage::TransportCreated(_) => "transportCreated",
            ServerMessage::ConsumerReady(_) => "consumerReady",
            ServerMessage::ConsumerClosed(_) => "consumerClosed",
            ServerMessage::Error(_) => "error",
            ServerMessage::RouterCapabilities(_) => "routerCapabilities",
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        let Envelope { action, payload: body } = Envelope::parse(text)?;
        match action.as_str() {
            "serverInfo" => Ok(Self::ServerInfo(payload(&action, body)?)),
            "transportCreated" => Ok(Self::TransportCreated(payload(&action, body)?)),
            "consumerReady" => Ok(Self::ConsumerReady(payload(&action, body)?)),
            "consumerClosed" => Ok(Self::ConsumerClosed(payload(&action, body)?)),
            "routerCapabilities" => Ok(Self::RouterCapabilities(payload(&action, body)?)),
            "error" => Ok(Self::Error(match body {
                Value::String(message) => message,
                Value::Null => "Server error".to_string(),
                other => other.to_string(),
            })),
            other => Err(Error::protocol(format!("Unknown action: {other}"))),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ClientMessage {
    pub fn action(&self) -> &'static str {
        match self {
            ClientMessage::SetRtpCapabilities(_) => "setRtpCapabilities",
            ClientMessage::CreateWebRtcTransport => "createWebRtcTransport",
            ClientMessage::ConnectWebRtcTransport(_) => "connectWebRtcTransport",
            ClientMessage::Consume(_) => "consume",
            ClientMessage::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        let Envelope { action, payload: body } = Envelope::parse(text)?;
        match action.as_str() {
            "setRtpCapabilities" => Ok(Self::SetRtpCapabilities(payload(&action, body)?)),
            "createWebRtcTransport" => Ok(Self::CreateWebRtcTransport),
            "connectWebRtcTransport" => {
                Ok(Self::ConnectWebRtcTransport(payload(&action, body)?))
            }
            "consume" => Ok(Self::Consume(payload(&action, body)?)),
            "getRouterRtpCapabilities" => Ok(Self::GetRouterRtpCapabilities),
            other => Err(Error::protocol(format!("Unknown action: {other}"))),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
