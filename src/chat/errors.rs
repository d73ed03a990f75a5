//! Error types for the conversation core.

use thiserror::Error;

use crate::chat::ids::{MessageId, SessionId};
use crate::storage::errors::StoreError;

/// Conversation core error type.
///
/// Turn-level failures (transport, premature end of stream, cancellation) are not
/// errors here: they are reported through [`crate::chat::events::ChatEvent::TurnFailed`]
/// and a failed [`crate::chat::controller::TurnOutcome`].
#[derive(Debug, Error)]
pub enum ChatError {
    /// A turn with neither text nor attachments was submitted.
    #[error("turn has neither text nor attachments")]
    EmptyTurn,
    /// A turn is already awaiting or streaming a response.
    #[error("a turn is already in progress")]
    TurnInProgress,
    /// A second streaming target was opened while one is still open.
    #[error("message {open} is still streaming, cannot open {requested}")]
    ConflictingStream {
        /// Entry currently receiving streamed text.
        open: MessageId,
        /// Entry that was asked to become the target.
        requested: MessageId,
    },
    /// Streamed text addressed to an entry that is not the open target.
    #[error("message {0} is not the active streaming target")]
    NoActiveTarget(MessageId),
    /// Save requested before any user message exists.
    #[error("the active session has no user message to save")]
    NothingToSave,
    /// No stored session with that id.
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    /// Attachment rejected before upload.
    #[error("invalid attachment: {0}")]
    InvalidAttachment(String),
    /// Session store failure.
    #[error("session store error: {0}")]
    Store(#[from] StoreError),
}

/// Convenience result alias for conversation operations.
pub type ChatResult<T> = Result<T, ChatError>;
