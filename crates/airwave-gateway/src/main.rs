use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use airwave_common::{init_logging, LogOutput};
use airwave_gateway::{config, AppState, GatewayConfig, SessionRegistry, SignalRouter};
use airwave_media::{LocalEngine, MediaEngine};
use anyhow::Context;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(
        "airwave_gateway=info,airwave_media=info,tower_http=info",
        LogOutput::Stdout,
    );

    dotenv::dotenv().ok();

    let config = GatewayConfig::from_env()?;
    config.check_public_bind_allowed()?;

    let streams = config::load_streams(&config.streams_path)
        .with_context(|| format!("reading {}", config.streams_path.display()))?;
    tracing::info!(
        "loaded {} stream(s) from {}",
        streams.len(),
        config.streams_path.display()
    );

    let engine = Arc::new(LocalEngine::new(config.engine.clone())?);
    let catalog = Arc::new(config::open_streams(&engine, &streams)?);
    let router = SignalRouter::new(
        engine.clone(),
        catalog,
        Arc::new(SessionRegistry::default()),
    );

    let app = airwave_gateway::app(AppState {
        router,
        max_message_bytes: config.ws_max_message_bytes,
    });

    let listener = TcpListener::bind(config.bind_addr).await?;
    let bound_addr = listener.local_addr()?;
    tracing::info!("gateway listening on {}", bound_addr);
    tracing::info!("gateway signaling url ws://{}/ws", bound_addr);

    let server =
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).into_future();

    tokio::select! {
        result = server => result?,
        reason = engine.died() => {
            return Err(anyhow::anyhow!("media engine died, exiting: {reason}"));
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }

    Ok(())
}
