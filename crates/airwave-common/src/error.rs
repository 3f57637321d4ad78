//! Common error types for Airwave.

use thiserror::Error;

/// Result type alias using Airwave's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Airwave operations.
///
/// The `Display` output is what the gateway sends to clients inside an
/// `error` event, so messages are written for humans.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown transport, consumer or stream id
    #[error("{0}")]
    NotFound(String),

    /// The id resolves, but to a resource of an incompatible kind
    #[error("{0}")]
    WrongType(String),

    /// Capability mismatch between a source and a receiver
    #[error("{0}")]
    Incompatible(String),

    /// A consume request arrived before any client-facing transport existed
    #[error("{0}")]
    NoTransport(String),

    /// The media engine failed to negotiate or create a resource
    #[error("{0}")]
    EngineFailure(String),

    /// Unparseable or unrecognized signaling message
    #[error("{0}")]
    Protocol(String),

    /// The signaling channel gave up reconnecting
    #[error("{0}")]
    ChannelFailure(String),

    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a not found error from any displayable type.
    pub fn not_found(msg: impl std::fmt::Display) -> Self {
        Self::NotFound(msg.to_string())
    }

    /// Create a wrong type error from any displayable type.
    pub fn wrong_type(msg: impl std::fmt::Display) -> Self {
        Self::WrongType(msg.to_string())
    }

    /// Create an incompatible error from any displayable type.
    pub fn incompatible(msg: impl std::fmt::Display) -> Self {
        Self::Incompatible(msg.to_string())
    }

    /// Create a no transport error from any displayable type.
    pub fn no_transport(msg: impl std::fmt::Display) -> Self {
        Self::NoTransport(msg.to_string())
    }

    /// Create an engine failure from any displayable type.
    pub fn engine(msg: impl std::fmt::Display) -> Self {
        Self::EngineFailure(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create a channel failure from any displayable type.
    pub fn channel(msg: impl std::fmt::Display) -> Self {
        Self::ChannelFailure(msg.to_string())
    }

    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
