//! WebSocket transport and HTTP surface for the agent relay.
//!
//! The hosting process binds a listener and hands it to [`serve`]; every
//! accepted connection is bridged onto [`agent_relay_core::Relay`].

pub mod websocket;

use std::sync::Arc;

use agent_relay_core::Relay;
use agent_relay_proto::ClientSummary;
use axum::{Json, Router, extract::State, routing::get};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the relay's router: `/ws` plus a small HTTP surface for
/// supervision tooling.
#[must_use]
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/ws", get(websocket::ws_handler))
        .route("/health", get(health))
        .route("/clients", get(clients))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(relay)
}

async fn health() -> &'static str {
    "ok"
}

/// JSON snapshot mirroring `LIST_CLIENTS`.
async fn clients(State(relay): State<Arc<Relay>>) -> Json<Vec<ClientSummary>> {
    Json(relay.snapshot())
}

/// Serve the relay on an already-bound listener until it fails.
///
/// # Errors
/// Propagates accept-loop I/O errors.
pub async fn serve(listener: tokio::net::TcpListener, relay: Arc<Relay>) -> std::io::Result<()> {
    axum::serve(listener, router(relay)).await
}

/// Serve the relay until `shutdown` resolves.
///
/// # Errors
/// Propagates accept-loop I/O errors.
pub async fn serve_with_shutdown(
    listener: tokio::net::TcpListener,
    relay: Arc<Relay>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(relay))
        .with_graceful_shutdown(shutdown)
        .await
}
