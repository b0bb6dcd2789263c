pub mod commands;
pub mod error;
mod handlers;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::session::{EngineSource, ServerContext};

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub server: ServerContext,
    /// Engine each new connection binds to.
    pub engines: EngineSource,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `state` on `listener` until the shutdown coordinator fires.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let shutdown = state.server.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}
