//! HTTP surface over the single working session.
//!
//! One [`SessionController`](crate::chat::controller::SessionController) sits behind a
//! mutex in [`AppState`]. `POST /api/chat` takes that mutex for the whole turn and
//! answers with the turn's events as NDJSON. Requests that need the controller while
//! a turn holds it get `409`, except `POST /api/sessions/new`, which cancels the turn
//! and waits for it.
//!
//! Reads never wait on a turn: `/api/transcript` and `/api/state` come from the
//! [`TranscriptMirror`], which follows the same events as the NDJSON streams, and
//! `/api/sessions` reads the store directly.

pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::{AppState, MirrorSnapshot, TranscriptMirror};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use thiserror::Error;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;

/// Errors from running the HTTP server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be opened.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The accept loop stopped with an error.
    #[error("server stopped: {0}")]
    Serve(#[source] std::io::Error),
}

/// Router with the request-tracing and CORS layers the front end expects.
pub fn build_app(state: Arc<AppState>, config: &ServerConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    create_router(state, config.static_dir.as_deref()).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors),
    )
}

/// Serve on [`ServerConfig::bind_addr`] until `shutdown` resolves.
///
/// Open NDJSON streams hold the shutdown until their turn ends, so callers should
/// cancel the running turn when `shutdown` fires.
///
/// # Errors
/// Returns [`ServerError::Bind`] if the address is unavailable.
pub async fn serve<F>(
    state: Arc<AppState>,
    config: &ServerConfig,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    tracing::info!("Ollama chat server listening on http://{addr}");

    axum::serve(listener, build_app(state, config))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::Serve)
}
