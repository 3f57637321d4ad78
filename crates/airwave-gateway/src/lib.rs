pub mod config;
pub mod session;
pub mod signal;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

pub use config::{GatewayConfig, StreamConfig};
pub use session::{ClientSession, RegistryCounts, SessionRegistry};
pub use signal::{Connection, ResourceEvent, SignalRouter};

#[derive(Clone)]
pub struct AppState {
    pub router: SignalRouter,
    pub max_message_bytes: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub active_sessions: usize,
    pub transports: usize,
    pub consumers: usize,
    pub available_streams: usize,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let counts = state.router.registry().counts().await;
    Json(HealthReport {
        active_sessions: counts.sessions,
        transports: counts.transports,
        consumers: counts.consumers,
        available_streams: state.router.catalog().list_available().len(),
    })
}

/// HTTP surface of the gateway: liveness, health and the signaling socket.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "Airwave Gateway Online" }))
        .route("/health", get(health))
        .route("/ws", get(signal::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
