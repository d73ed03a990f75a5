//! HTTP route handlers for the chat API.

use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{OwnedMutexGuard, oneshot};
use tower_http::services::ServeDir;

use crate::chat::controller::{SessionController, validate_turn};
use crate::chat::errors::{ChatError, ChatResult};
use crate::chat::events::{ChatEvent, TurnState};
use crate::chat::ids::SessionId;
use crate::chat::types::{Attachment, Message, SessionSummary};

use super::state::AppState;

type ApiError = (StatusCode, String);

/// How often a reset re-sends its cancel while a turn still holds the controller.
const CANCEL_RETRY: Duration = Duration::from_millis(25);

/// Create the API router with all routes.
///
/// When `static_dir` is set, unknown paths are served from it.
pub fn create_router(state: Arc<AppState>, static_dir: Option<&Path>) -> Router {
    let router = Router::new()
        .route("/health", get(health_check))
        .route("/api/chat", post(chat))
        .route("/api/chat/cancel", post(cancel_turn))
        .route("/api/transcript", get(transcript))
        .route("/api/state", get(turn_state))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/save", post(save_session))
        .route("/api/sessions/new", post(new_session))
        .route("/api/sessions/{id}/load", post(load_session))
        .route("/api/sessions/{id}", delete(delete_session))
        .with_state(state);

    match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    }
}

fn api_error(err: ChatError) -> ApiError {
    let status = match &err {
        ChatError::EmptyTurn | ChatError::InvalidAttachment(_) => StatusCode::BAD_REQUEST,
        ChatError::TurnInProgress => StatusCode::CONFLICT,
        ChatError::NothingToSave => StatusCode::UNPROCESSABLE_ENTITY,
        ChatError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        ChatError::ConflictingStream { .. } | ChatError::NoActiveTarget(_) | ChatError::Store(_) => {
            tracing::error!(error = %err, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

/// Take the controller without waiting.
///
/// A turn holds the lock from the request that starts it until its task ends, so a
/// busy lock is answered with `409` instead of queueing behind the turn.
fn idle_controller(state: &AppState) -> Result<OwnedMutexGuard<SessionController>, ApiError> {
    let controller = Arc::clone(&state.controller)
        .try_lock_owned()
        .map_err(|_| api_error(ChatError::TurnInProgress))?;
    if controller.turn_state() != TurnState::Idle {
        return Err(api_error(ChatError::TurnInProgress));
    }
    Ok(controller)
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "ollama-chat",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Chat turn request.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// The user's message.
    #[serde(default)]
    pub message: String,
    /// Base64 images, optionally as `data:` URLs.
    #[serde(default)]
    pub images: Vec<String>,
}

/// Submit a turn and stream its events as NDJSON until it completes or fails.
async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let attachments = request
        .images
        .iter()
        .map(|image| Attachment::from_base64(image))
        .collect::<ChatResult<Vec<_>>>()
        .map_err(api_error)?;
    validate_turn(&request.message, &attachments).map_err(api_error)?;

    let mut controller = idle_controller(&state)?;
    let events = state.events.subscribe();
    let (released, finished) = oneshot::channel();
    tokio::spawn(async move {
        let submitted = controller.submit(request.message, attachments).await;
        drop(controller);
        if let Err(err) = submitted {
            tracing::warn!(error = %err, "turn rejected");
        }
        let _ = released.send(());
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(turn_events(events, finished)),
    )
        .into_response())
}

/// NDJSON lines for one turn.
///
/// The terminal line is held back until the turn task has dropped the controller, so
/// a client that reacts to it is never refused with `409`. The stream also ends if
/// the task finishes without a terminal event.
fn turn_events(
    events: broadcast::Receiver<ChatEvent>,
    finished: oneshot::Receiver<()>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
    futures::stream::unfold(Some((events, finished)), |feed| async move {
        let (mut events, mut finished) = feed?;
        loop {
            tokio::select! {
                biased;
                received = events.recv() => match received {
                    Ok(event) => {
                        let last = matches!(
                            event,
                            ChatEvent::TurnCompleted { .. } | ChatEvent::TurnFailed { .. }
                        );
                        let Ok(mut line) = serde_json::to_vec(&event) else {
                            continue;
                        };
                        line.push(b'\n');
                        if last {
                            let _ = (&mut finished).await;
                            return Some((Ok(Bytes::from(line)), None));
                        }
                        return Some((Ok(Bytes::from(line)), Some((events, finished))));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event stream lagged");
                    }
                    Err(RecvError::Closed) => return None,
                },
                _ = &mut finished => return None,
            }
        }
    })
}

/// Cancel the running turn.
async fn cancel_turn(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "cancelled": state.canceller.cancel() }))
}

/// Transcript of the working session.
async fn transcript(State(state): State<Arc<AppState>>) -> Json<Vec<Message>> {
    Json(state.mirror.snapshot().messages)
}

/// Turn state response.
#[derive(Debug, Serialize)]
pub struct StateResponse {
    /// Working session id.
    pub session_id: SessionId,
    /// Current turn state.
    pub turn_state: TurnState,
    /// Whether the working session has unsaved changes; unknown while a turn runs.
    pub unsaved_changes: Option<bool>,
}

async fn turn_state(State(state): State<Arc<AppState>>) -> Json<StateResponse> {
    let snapshot = state.mirror.snapshot();
    let unsaved_changes = state
        .controller
        .try_lock()
        .ok()
        .map(|controller| controller.has_unsaved_changes());
    Json(StateResponse {
        session_id: snapshot.session_id,
        turn_state: snapshot.state,
        unsaved_changes,
    })
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let summaries = state
        .store
        .list()
        .await
        .map_err(|e| api_error(e.into()))?;
    Ok(Json(summaries))
}

async fn save_session(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionSummary>, ApiError> {
    let mut controller = idle_controller(&state)?;
    let session = controller.save_active().await.map_err(api_error)?;
    Ok(Json(session.summary()))
}

/// Working session after a swap.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    /// Working session id.
    pub session_id: SessionId,
    /// Its transcript.
    pub messages: Vec<Message>,
}

async fn load_session(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<SessionId>,
) -> Result<Json<SessionResponse>, ApiError> {
    let mut controller = idle_controller(&state)?;
    controller.load_session(id).await.map_err(api_error)?;
    Ok(Json(SessionResponse {
        session_id: controller.active_session_id(),
        messages: controller.transcript().to_vec(),
    }))
}

/// Start a fresh working session, cancelling any running turn first.
async fn new_session(State(state): State<Arc<AppState>>) -> Json<SessionResponse> {
    // A just-spawned turn arms its cancel token only once it runs.
    let mut controller = loop {
        state.canceller.cancel();
        tokio::select! {
            controller = state.controller.lock() => break controller,
            () = tokio::time::sleep(CANCEL_RETRY) => {}
        }
    };
    let session_id = controller.reset_active();
    Json(SessionResponse {
        session_id,
        messages: Vec::new(),
    })
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<SessionId>,
) -> Result<impl IntoResponse, ApiError> {
    let mut controller = idle_controller(&state)?;
    let deleted = controller.delete_session(id).await.map_err(api_error)?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}
