//! Shared building blocks for Airwave: signaling protocol, negotiation
//! parameters, error types and logging setup.
//!
//! Both the gateway and the listener client depend on this crate, so the wire
//! format is defined exactly once.

#![forbid(unsafe_code)]

pub mod error;
pub mod protocol;
pub mod rtp;

pub use error::{Error, Result};
pub use protocol::*;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Where formatted log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    /// Keeps stdout free for programs that print data on it.
    Stderr,
}

/// Install the global subscriber. `RUST_LOG` wins over `default_directives`
/// when it holds a valid filter.
pub fn init_logging(default_directives: &str, output: LogOutput) {
    let filter = log_filter(std::env::var("RUST_LOG").ok(), default_directives);
    let registry = tracing_subscriber::registry().with(filter);
    match output {
        LogOutput::Stdout => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogOutput::Stderr => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

fn log_filter(from_env: Option<String>, default_directives: &str) -> EnvFilter {
    from_env
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directives))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_directives_override_default() {
        let filter = log_filter(Some("airwave_gateway=debug".into()), "info");
        assert_eq!(filter.to_string(), "airwave_gateway=debug");
    }

    #[test]
    fn test_default_used_when_env_missing_or_invalid() {
        assert_eq!(log_filter(None, "warn").to_string(), "warn");
        assert_eq!(log_filter(Some("airwave=loud".into()), "warn").to_string(), "warn");
    }
}
