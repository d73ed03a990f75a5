//! Session controller: owns the working session and drives the turn state machine.
//!
//! A turn moves `Idle -> AwaitingFirstByte -> Streaming -> Idle`. The response body
//! is consumed by a single read loop, so every decoded record is applied to the
//! transcript in arrival order without further synchronisation.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::chat::context::ContextManager;
use crate::chat::decoder::{StreamError, decode_stream};
use crate::chat::errors::{ChatError, ChatResult};
use crate::chat::events::{ChatEvent, ChatObserver, Observers, TurnState};
use crate::chat::ids::{MessageId, SessionId};
use crate::chat::transcript::{AbortOutcome, TranscriptReconciler};
use crate::chat::types::{Attachment, Message, Session, SessionSummary};
use crate::llm::error::TransportError;
use crate::llm::transport::{TurnRequest, TurnTransport};
use crate::storage::clock::Clock;
use crate::storage::session_store::{SessionStore, derive_title};

/// Result of a submitted turn that got as far as the transport.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TurnOutcome {
    /// A final record arrived; the reply is complete.
    Completed {
        /// Assistant entry holding the reply.
        message_id: MessageId,
    },
    /// The turn failed; partial text, if any, was kept.
    Failed {
        /// Assistant entry of the failed turn. Already removed if it stayed empty.
        message_id: MessageId,
        /// Human-readable cause.
        reason: String,
    },
}

impl TurnOutcome {
    /// Whether the turn completed.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

#[derive(Debug, Error)]
enum TurnFailure {
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Stream(#[from] StreamError),
    #[error("turn cancelled")]
    Cancelled,
    #[error("{0}")]
    Fault(#[from] ChatError),
}

/// Cancels whichever turn is currently running, from any task.
#[derive(Clone, Debug, Default)]
pub struct TurnCanceller {
    slot: Arc<Mutex<Option<CancellationToken>>>,
}

impl TurnCanceller {
    /// Cancel the running turn. Returns `false` when no turn is running.
    pub fn cancel(&self) -> bool {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().is_some_and(|token| {
            token.cancel();
            true
        })
    }

    fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        token
    }

    fn disarm(&self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Reject a turn with neither text nor images, before any side effect.
///
/// # Errors
/// Returns [`ChatError::EmptyTurn`].
pub fn validate_turn(text: &str, attachments: &[Attachment]) -> ChatResult<()> {
    if text.trim().is_empty() && attachments.is_empty() {
        return Err(ChatError::EmptyTurn);
    }
    Ok(())
}

#[derive(Debug)]
struct ActiveSession {
    id: SessionId,
    title: Option<String>,
    created_at: DateTime<Utc>,
    persisted: bool,
    dirty: bool,
}

impl ActiveSession {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            title: None,
            created_at: now,
            persisted: false,
            dirty: false,
        }
    }
}

/// Owner of the working session.
pub struct SessionController {
    transport: Arc<dyn TurnTransport>,
    store: Arc<SessionStore>,
    clock: Arc<dyn Clock>,
    active: ActiveSession,
    transcript: TranscriptReconciler,
    context: ContextManager,
    state: TurnState,
    observers: Observers,
    canceller: TurnCanceller,
}

impl SessionController {
    /// Start with a fresh, unsaved session.
    #[must_use]
    pub fn new(
        transport: Arc<dyn TurnTransport>,
        store: Arc<SessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let active = ActiveSession::fresh(clock.now());
        Self {
            transport,
            store,
            clock,
            active,
            transcript: TranscriptReconciler::new(),
            context: ContextManager::new(),
            state: TurnState::Idle,
            observers: Observers::default(),
            canceller: TurnCanceller::default(),
        }
    }

    /// Register an observer for every subsequent event.
    pub fn subscribe(&mut self, observer: Arc<dyn ChatObserver>) {
        self.observers.subscribe(observer);
    }

    /// Handle that cancels the running turn without access to the controller.
    #[must_use]
    pub fn canceller(&self) -> TurnCanceller {
        self.canceller.clone()
    }

    /// Transcript of the working session, in conversation order.
    #[must_use]
    pub fn transcript(&self) -> &[Message] {
        self.transcript.messages()
    }

    /// Current turn state.
    #[must_use]
    pub const fn turn_state(&self) -> TurnState {
        self.state
    }

    /// Id of the working session.
    #[must_use]
    pub const fn active_session_id(&self) -> SessionId {
        self.active.id
    }

    /// Continuation token of the working session.
    #[must_use]
    pub fn continuation_token(&self) -> Option<&[i64]> {
        self.context.token()
    }

    /// Whether the working session changed since it was last saved or loaded.
    #[must_use]
    pub const fn has_unsaved_changes(&self) -> bool {
        self.active.dirty
    }

    /// Saved sessions for a history view, most recent first.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn session_summaries(&self) -> ChatResult<Vec<SessionSummary>> {
        Ok(self.store.list().await?)
    }

    /// Send one turn and stream the reply into the transcript.
    ///
    /// Transport failures, premature ends of stream, and cancellation do not return
    /// `Err`: they roll the turn back and come back as [`TurnOutcome::Failed`].
    ///
    /// # Errors
    /// Returns [`ChatError::EmptyTurn`] without touching anything, or
    /// [`ChatError::TurnInProgress`] if a turn is still open.
    pub async fn submit(
        &mut self,
        text: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> ChatResult<TurnOutcome> {
        let text = text.into();
        validate_turn(&text, &attachments)?;
        if self.state != TurnState::Idle {
            return Err(ChatError::TurnInProgress);
        }

        let first_turn = self.transcript.user_message_count() == 0;
        let user = Message::user(text.clone(), attachments.clone());
        self.transcript.push(user.clone())?;
        if first_turn && !self.active.persisted {
            self.active.created_at = self.clock.now();
        }
        self.active.dirty = true;
        self.observers
            .emit(&ChatEvent::MessageAppended { message: user });

        let request = TurnRequest {
            text,
            attachments: self.context.attachments_for_next_turn(&attachments),
            continuation_token: self.context.token().map(<[i64]>::to_vec),
        };

        let reply_id = MessageId::new();
        self.transcript.open(reply_id)?;
        self.observers.emit(&ChatEvent::MessageAppended {
            message: Message::assistant_placeholder(reply_id),
        });
        self.set_state(TurnState::AwaitingFirstByte);
        tracing::debug!(
            session = %self.active.id,
            reply = %reply_id,
            images = request.attachments.len(),
            continued = request.continuation_token.is_some(),
            "turn started"
        );

        let cancel = self.canceller.arm();
        let streamed = self.stream_reply(reply_id, request, &cancel).await;
        self.canceller.disarm();

        let outcome = match streamed {
            Ok(token) => match self.complete_turn(reply_id, token, &attachments) {
                Ok(()) => TurnOutcome::Completed {
                    message_id: reply_id,
                },
                Err(err) => self.fail_turn(reply_id, &TurnFailure::Fault(err)),
            },
            Err(failure) => self.fail_turn(reply_id, &failure),
        };
        Ok(outcome)
    }

    async fn stream_reply(
        &mut self,
        reply_id: MessageId,
        request: TurnRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<i64>>, TurnFailure> {
        let transport = Arc::clone(&self.transport);
        let body = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TurnFailure::Cancelled),
            sent = transport.send_turn(request) => sent?,
        };

        let mut records = std::pin::pin!(decode_stream(body));
        let mut frames = 0_usize;
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TurnFailure::Cancelled),
                next = records.next() => next,
            };
            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => return Err(err.into()),
                None => return Err(StreamError::PrematureTermination { frames }.into()),
            };

            frames += 1;
            if self.state == TurnState::AwaitingFirstByte {
                self.set_state(TurnState::Streaming);
            }
            if !frame.text_fragment.is_empty() {
                self.transcript.append(reply_id, &frame.text_fragment)?;
                self.observers.emit(&ChatEvent::MessageUpdated {
                    id: reply_id,
                    fragment: frame.text_fragment,
                });
            }
            if frame.done {
                return Ok(frame.token);
            }
        }
    }

    fn complete_turn(
        &mut self,
        reply_id: MessageId,
        token: Option<Vec<i64>>,
        attachments: &[Attachment],
    ) -> ChatResult<()> {
        match token {
            Some(token) => self.context.advance(token, attachments),
            None => {
                tracing::warn!(reply = %reply_id, "final record carried no continuation token");
                self.context.carry(attachments);
            }
        }
        self.transcript.close(reply_id)?;
        self.set_state(TurnState::Idle);
        self.observers.emit(&ChatEvent::TurnCompleted {
            message_id: reply_id,
        });
        tracing::debug!(reply = %reply_id, "turn completed");
        Ok(())
    }

    fn fail_turn(&mut self, reply_id: MessageId, failure: &TurnFailure) -> TurnOutcome {
        let reason = failure.to_string();
        if self.transcript.abort(reply_id) == AbortOutcome::Removed {
            self.observers
                .emit(&ChatEvent::MessageRemoved { id: reply_id });
        }
        self.set_state(TurnState::Idle);
        self.observers.emit(&ChatEvent::TurnFailed {
            message_id: reply_id,
            reason: reason.clone(),
        });
        tracing::warn!(reply = %reply_id, %reason, "turn failed");
        TurnOutcome::Failed {
            message_id: reply_id,
            reason,
        }
    }

    /// Cancel the running turn, or clean up one whose `submit` future was dropped.
    ///
    /// Returns `false` when idle. The open entry is aborted exactly once.
    pub fn cancel_turn(&mut self) -> bool {
        if self.state == TurnState::Idle {
            return false;
        }
        self.canceller.cancel();
        self.canceller.disarm();
        match self.transcript.open_target() {
            Some(reply_id) => {
                self.fail_turn(reply_id, &TurnFailure::Cancelled);
            }
            None => self.set_state(TurnState::Idle),
        }
        true
    }

    /// Write the working session to the store.
    ///
    /// The title is derived on the first save and kept afterwards.
    ///
    /// # Errors
    /// Returns [`ChatError::NothingToSave`] before the first user message, or a store
    /// error; on error the session stays unsaved.
    pub async fn save_active(&mut self) -> ChatResult<Session> {
        if self.transcript.user_message_count() == 0 {
            return Err(ChatError::NothingToSave);
        }

        let title = self
            .active
            .title
            .clone()
            .unwrap_or_else(|| derive_title(self.transcript.messages()));
        let session = Session {
            id: self.active.id,
            title,
            messages: self.transcript.messages().to_vec(),
            created_at: self.active.created_at,
            updated_at: self.clock.now(),
            continuation: self.context.snapshot(),
        };

        let stored = self.store.upsert(session).await?;
        self.active.title = Some(stored.title.clone());
        self.active.created_at = stored.created_at;
        self.active.persisted = true;
        self.active.dirty = false;
        self.observers.emit(&ChatEvent::SessionSaved {
            session_id: stored.id,
            title: stored.title.clone(),
        });
        tracing::info!(session = %stored.id, title = %stored.title, "session saved");
        Ok(stored)
    }

    /// Replace the working session with a stored one.
    ///
    /// # Errors
    /// Returns [`ChatError::TurnInProgress`] unless idle, [`ChatError::SessionNotFound`]
    /// for an unknown id, or a store error. The working session is untouched on error.
    pub async fn load_session(&mut self, id: SessionId) -> ChatResult<()> {
        if self.state != TurnState::Idle {
            return Err(ChatError::TurnInProgress);
        }
        let session = self
            .store
            .get(id)
            .await?
            .ok_or(ChatError::SessionNotFound(id))?;

        self.context.reset();
        self.context.restore(session.continuation);
        self.transcript = TranscriptReconciler::from_messages(session.messages);
        self.active = ActiveSession {
            id: session.id,
            title: Some(session.title),
            created_at: session.created_at,
            persisted: true,
            dirty: false,
        };
        self.emit_replaced();
        tracing::info!(session = %id, "session loaded");
        Ok(())
    }

    /// Discard the working session and start a fresh one, cancelling any turn.
    ///
    /// Asking whether to save first is left to the caller, see
    /// [`Self::has_unsaved_changes`].
    pub fn reset_active(&mut self) -> SessionId {
        self.cancel_turn();
        self.active = ActiveSession::fresh(self.clock.now());
        self.transcript = TranscriptReconciler::new();
        self.context.reset();
        self.state = TurnState::Idle;
        self.emit_replaced();
        tracing::debug!(session = %self.active.id, "started new session");
        self.active.id
    }

    /// Remove a stored session. Deleting the working session also resets it.
    ///
    /// Returns whether the store held the session.
    ///
    /// # Errors
    /// Returns a store error.
    pub async fn delete_session(&mut self, id: SessionId) -> ChatResult<bool> {
        let removed = self.store.delete(id).await?;
        if id == self.active.id {
            self.reset_active();
        }
        Ok(removed)
    }

    fn set_state(&mut self, state: TurnState) {
        if self.state != state {
            self.state = state;
            self.observers.emit(&ChatEvent::TurnStateChanged { state });
        }
    }

    fn emit_replaced(&self) {
        self.observers.emit(&ChatEvent::SessionReplaced {
            session_id: self.active.id,
            messages: self.transcript.messages().to_vec(),
        });
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("active", &self.active)
            .field("messages", &self.transcript.messages().len())
            .field("state", &self.state)
            .field("observers", &self.observers)
            .finish_non_exhaustive()
    }
}
