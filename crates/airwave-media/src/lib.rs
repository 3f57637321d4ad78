//! Media engine adapter and stream catalog for the Airwave gateway.
//!
//! The signaling core depends only on the [`MediaEngine`] and
//! [`StreamCatalog`] traits. [`LocalEngine`] is the in-process engine the
//! gateway binary runs with; [`StaticCatalog`] serves the configured streams.

mod catalog;
mod config;
mod engine;
mod local;

pub use catalog::{StaticCatalog, StreamCatalog};
pub use config::EngineConfig;
pub use engine::{
    ConsumerEvent, EngineConsumer, EngineTransport, MediaEngine, SourceHandle, TransportEvent,
    TransportKind,
};
pub use local::{LocalConsumer, LocalEngine, LocalTransport, SourceSpec};
