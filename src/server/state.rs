//! Application state shared across all request handlers.

use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::{Mutex, broadcast};

use crate::chat::controller::{SessionController, TurnCanceller};
use crate::chat::events::{ChatEvent, ChatObserver, TurnState};
use crate::chat::ids::SessionId;
use crate::chat::types::Message;
use crate::storage::session_store::SessionStore;

/// Point-in-time copy of the working session, as observers last saw it.
#[derive(Clone, Debug, Serialize)]
pub struct MirrorSnapshot {
    /// Working session id.
    pub session_id: SessionId,
    /// Turn state.
    pub state: TurnState,
    /// Transcript.
    pub messages: Vec<Message>,
}

/// Event-fed copy of the working session.
///
/// The controller is locked for the whole of a turn, so reads during a turn are
/// served from here instead.
#[derive(Debug)]
pub struct TranscriptMirror {
    inner: RwLock<MirrorSnapshot>,
}

impl TranscriptMirror {
    /// Seed the mirror from the controller's current session.
    #[must_use]
    pub fn from_controller(controller: &SessionController) -> Self {
        Self {
            inner: RwLock::new(MirrorSnapshot {
                session_id: controller.active_session_id(),
                state: controller.turn_state(),
                messages: controller.transcript().to_vec(),
            }),
        }
    }

    /// Copy of the mirrored session.
    #[must_use]
    pub fn snapshot(&self) -> MirrorSnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ChatObserver for TranscriptMirror {
    fn on_event(&self, event: &ChatEvent) {
        let mut mirror = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match event {
            ChatEvent::MessageAppended { message } => mirror.messages.push(message.clone()),
            ChatEvent::MessageUpdated { id, fragment } => {
                if let Some(message) = mirror.messages.iter_mut().rev().find(|m| m.id == *id) {
                    message.text.push_str(fragment);
                }
            }
            ChatEvent::MessageRemoved { id } => mirror.messages.retain(|m| m.id != *id),
            ChatEvent::TurnStateChanged { state } => mirror.state = *state,
            ChatEvent::SessionReplaced {
                session_id,
                messages,
            } => {
                mirror.session_id = *session_id;
                mirror.messages.clone_from(messages);
                mirror.state = TurnState::Idle;
            }
            ChatEvent::TurnCompleted { .. }
            | ChatEvent::TurnFailed { .. }
            | ChatEvent::SessionSaved { .. } => {}
        }
    }
}

/// Shared application state.
pub struct AppState {
    /// The single working session. Held for the whole of a running turn.
    pub controller: Arc<Mutex<SessionController>>,
    /// Cancels the running turn without waiting for the controller.
    pub canceller: TurnCanceller,
    /// Every controller event, for streaming responses.
    pub events: broadcast::Sender<ChatEvent>,
    /// Readable copy of the working session.
    pub mirror: Arc<TranscriptMirror>,
    /// Saved sessions, for listing without the controller.
    pub store: Arc<SessionStore>,
}

impl AppState {
    /// Wire the controller's observers and wrap everything for sharing.
    #[must_use]
    pub fn new(
        mut controller: SessionController,
        store: Arc<SessionStore>,
        event_buffer: usize,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        let mirror = Arc::new(TranscriptMirror::from_controller(&controller));
        controller.subscribe(mirror.clone());
        controller.subscribe(Arc::new(events.clone()));
        let canceller = controller.canceller();

        Arc::new(Self {
            controller: Arc::new(Mutex::new(controller)),
            canceller,
            events,
            mirror,
            store,
        })
    }
}
