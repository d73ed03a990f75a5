//! Startup helpers for the chat server.

use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;

use crate::chat::controller::SessionController;
use crate::config::ChatConfig;
use crate::llm::ollama_client::OllamaClient;
use crate::server::{self, AppState};
use crate::storage::clock::{Clock, SystemClock};
use crate::storage::kv::{KeyValueStore, MemoryKvStore, SqliteKvStore};
use crate::storage::session_store::SessionStore;

/// Boxed error used by the bootstrap.
pub type BootError = Box<dyn std::error::Error + Send + Sync>;

/// Run the server (used by the `ollama-chat-server` binary).
///
/// # Returns
/// `ExitCode::SUCCESS` on graceful shutdown, `1` on failure.
#[must_use]
pub fn run() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting Ollama chat v{}", env!("CARGO_PKG_VERSION"));

    let config = match ChatConfig::from_env().and_then(|config| {
        config.validate()?;
        Ok(config)
    }) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            return ExitCode::from(1);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let served = rt.block_on(async {
        let state = initialize(&config).await?;
        run_server_with_shutdown(state, &config, shutdown_signal()).await
    });
    if let Err(e) = served {
        tracing::error!("Server error: {e}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

/// Build application state without starting the server.
///
/// An unreachable inference service is logged, not fatal: turns fail until it is up.
///
/// # Errors
/// Returns an error if the client or the session database cannot be created.
pub async fn initialize(config: &ChatConfig) -> Result<Arc<AppState>, BootError> {
    tracing::info!("Ollama endpoint: {}", config.ollama.base_url);
    let client = OllamaClient::new(config.ollama.clone())?;
    if client.is_ready().await {
        if let Err(e) = client.preload_model().await {
            tracing::warn!("Failed to preload {}: {e}", config.ollama.model);
        }
    } else {
        tracing::warn!("Ollama is not reachable at {}", config.ollama.base_url);
    }

    let kv: Arc<dyn KeyValueStore> = match &config.storage.sqlite_path {
        Some(path) => {
            tracing::info!("Session database: {}", path.display());
            Arc::new(SqliteKvStore::open(path).await?)
        }
        None => {
            tracing::warn!("No session database configured; sessions are kept in memory");
            Arc::new(MemoryKvStore::new())
        }
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(SessionStore::with_namespace(
        kv,
        clock.clone(),
        config.storage.namespace.clone(),
    ));

    let controller = SessionController::new(Arc::new(client), store.clone(), clock);
    Ok(AppState::new(controller, store, config.server.event_buffer))
}

/// Run server with graceful shutdown.
///
/// # Errors
/// Returns an error if the server fails.
pub async fn run_server_with_shutdown<F>(
    state: Arc<AppState>,
    config: &ChatConfig,
    shutdown_signal: F,
) -> Result<(), BootError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let canceller = state.canceller.clone();
    server::serve(state, &config.server, async move {
        shutdown_signal.await;
        canceller.cancel();
    })
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
