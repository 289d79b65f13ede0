//! HTTP entry points for course applications
//!
//! Course apps report session lifecycle and interaction events here; the
//! tracker does the rest. The server exits gracefully once the tracker's
//! idle check fires after a quit.

pub mod http;

use anyhow::{Context, Result};
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerSettings;
use crate::tracker::Tracker;

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub tracker: Arc<Tracker>,
}

/// Build the router
pub fn router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(http::status_handler))
        .route("/api/sessions", post(http::start_session_handler))
        .route("/api/sessions/{id}", delete(http::end_session_handler))
        .route("/api/sessions/{id}/inputs", post(http::input_handler))
        .route("/api/sessions/{id}/errors", post(http::error_handler))
        .route("/api/sessions/{id}/outputs", post(http::output_handler))
        .route("/api/sessions/{id}/submit", post(http::submit_handler))
        .route("/api/sessions/{id}/quit", post(http::quit_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the tracker requests shutdown
pub async fn start(settings: &ServerSettings, tracker: Arc<Tracker>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .context("Invalid server address")?;

    let mut shutdown = tracker.shutdown_signal();
    let app = router(ServerState { tracker });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("{} listening on http://{}", crate::info(), addr);
    println!("🚀 learntrack listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}
