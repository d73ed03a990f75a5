//! In-memory transcript with a single open streaming target.

use crate::chat::errors::{ChatError, ChatResult};
use crate::chat::ids::MessageId;
use crate::chat::types::{Message, Role};

/// What [`TranscriptReconciler::abort`] did with the target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AbortOutcome {
    /// The entry was still empty and has been removed.
    Removed,
    /// The entry had partial text and stays in the transcript.
    Retained,
    /// The id was not the open target; nothing changed.
    NotOpen,
}

/// Ordered message list plus the marker of the entry currently receiving text.
///
/// Entries are only ever appended; nothing is reordered or deduplicated.
#[derive(Clone, Debug, Default)]
pub struct TranscriptReconciler {
    messages: Vec<Message>,
    open: Option<MessageId>,
}

impl TranscriptReconciler {
    /// Create an empty transcript.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from stored messages, with no open target.
    #[must_use]
    pub const fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            open: None,
        }
    }

    /// Read-only view in conversation order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Entry currently receiving streamed text.
    #[must_use]
    pub const fn open_target(&self) -> Option<MessageId> {
        self.open
    }

    /// Look up an entry.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    /// Number of entries authored by the user.
    #[must_use]
    pub fn user_message_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|message| message.role == Role::User)
            .count()
    }

    /// Whether the transcript has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append a complete entry.
    ///
    /// # Errors
    /// Returns [`ChatError::ConflictingStream`] while another entry is open, so a new
    /// entry can never land ahead of a response that is still arriving.
    pub fn push(&mut self, message: Message) -> ChatResult<()> {
        if let Some(open) = self.open {
            return Err(ChatError::ConflictingStream {
                open,
                requested: message.id,
            });
        }
        self.messages.push(message);
        Ok(())
    }

    /// Insert an empty assistant entry at the end and make it the streaming target.
    ///
    /// # Errors
    /// Returns [`ChatError::ConflictingStream`] if another entry is open.
    pub fn open(&mut self, id: MessageId) -> ChatResult<()> {
        if let Some(open) = self.open {
            return Err(ChatError::ConflictingStream {
                open,
                requested: id,
            });
        }
        self.messages.push(Message::assistant_placeholder(id));
        self.open = Some(id);
        Ok(())
    }

    /// Concatenate a fragment onto the open entry and return its full text.
    ///
    /// # Errors
    /// Returns [`ChatError::NoActiveTarget`] if `id` is not the open entry; the
    /// transcript is left untouched.
    pub fn append(&mut self, id: MessageId, fragment: &str) -> ChatResult<&str> {
        let message = self.open_message_mut(id)?;
        message.text.push_str(fragment);
        Ok(&message.text)
    }

    /// Clear the open marker, keeping the accumulated text.
    ///
    /// # Errors
    /// Returns [`ChatError::NoActiveTarget`] if `id` is not the open entry.
    pub fn close(&mut self, id: MessageId) -> ChatResult<()> {
        if self.open != Some(id) {
            return Err(ChatError::NoActiveTarget(id));
        }
        self.open = None;
        Ok(())
    }

    /// Abandon the open entry: drop it if nothing arrived, keep it otherwise.
    ///
    /// Aborting anything but the open entry is a no-op, which makes repeated aborts
    /// of the same turn harmless.
    pub fn abort(&mut self, id: MessageId) -> AbortOutcome {
        if self.open != Some(id) {
            return AbortOutcome::NotOpen;
        }
        self.open = None;

        match self.messages.iter().position(|message| message.id == id) {
            Some(index) if self.messages[index].text.is_empty() => {
                self.messages.remove(index);
                AbortOutcome::Removed
            }
            _ => AbortOutcome::Retained,
        }
    }

    /// Consume the transcript, returning its entries.
    #[must_use]
    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    fn open_message_mut(&mut self, id: MessageId) -> ChatResult<&mut Message> {
        if self.open != Some(id) {
            return Err(ChatError::NoActiveTarget(id));
        }
        self.messages
            .iter_mut()
            .rev()
            .find(|message| message.id == id)
            .ok_or(ChatError::NoActiveTarget(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(transcript: &TranscriptReconciler) -> Vec<&str> {
        transcript
            .messages()
            .iter()
            .map(|message| message.text.as_str())
            .collect()
    }

    #[test]
    fn test_open_append_close() {
        let mut transcript = TranscriptReconciler::new();
        let id = MessageId::new();
        assert!(transcript.open(id).is_ok());
        assert_eq!(transcript.open_target(), Some(id));

        assert!(transcript.append(id, "Hi").is_ok());
        assert_eq!(transcript.append(id, " there").ok(), Some("Hi there"));
        assert!(transcript.close(id).is_ok());

        assert_eq!(transcript.open_target(), None);
        assert_eq!(texts(&transcript), vec!["Hi there"]);
    }

    #[test]
    fn test_append_to_other_id_fails_without_changes() {
        let mut transcript = TranscriptReconciler::new();
        let open = MessageId::new();
        let stray = MessageId::new();
        assert!(transcript.open(open).is_ok());
        assert!(transcript.append(open, "kept").is_ok());

        let result = transcript.append(stray, "late");
        assert!(matches!(result, Err(ChatError::NoActiveTarget(id)) if id == stray));
        assert_eq!(texts(&transcript), vec!["kept"]);
    }

    #[test]
    fn test_append_after_close_fails() {
        let mut transcript = TranscriptReconciler::new();
        let id = MessageId::new();
        assert!(transcript.open(id).is_ok());
        assert!(transcript.close(id).is_ok());
        assert!(matches!(
            transcript.append(id, "late"),
            Err(ChatError::NoActiveTarget(_))
        ));
    }

    #[test]
    fn test_second_open_conflicts() {
        let mut transcript = TranscriptReconciler::new();
        let first = MessageId::new();
        assert!(transcript.open(first).is_ok());

        let result = transcript.open(MessageId::new());
        assert!(matches!(result, Err(ChatError::ConflictingStream { open, .. }) if open == first));
        assert!(transcript.push(Message::user("queued", Vec::new())).is_err());
        assert_eq!(transcript.messages().len(), 1);
    }

    #[test]
    fn test_abort_removes_empty_entry() {
        let mut transcript = TranscriptReconciler::new();
        assert!(transcript.push(Message::user("hello", Vec::new())).is_ok());
        let id = MessageId::new();
        assert!(transcript.open(id).is_ok());

        assert_eq!(transcript.abort(id), AbortOutcome::Removed);
        assert_eq!(texts(&transcript), vec!["hello"]);
        assert_eq!(transcript.abort(id), AbortOutcome::NotOpen);
    }

    #[test]
    fn test_abort_retains_partial_text() {
        let mut transcript = TranscriptReconciler::new();
        let id = MessageId::new();
        assert!(transcript.open(id).is_ok());
        assert!(transcript.append(id, "Partial").is_ok());

        assert_eq!(transcript.abort(id), AbortOutcome::Retained);
        assert_eq!(transcript.abort(id), AbortOutcome::NotOpen);
        assert_eq!(texts(&transcript), vec!["Partial"]);
        assert_eq!(transcript.open_target(), None);
    }

    #[test]
    fn test_entries_keep_insertion_order() {
        let mut transcript = TranscriptReconciler::new();
        assert!(transcript.push(Message::user("q1", Vec::new())).is_ok());
        let a1 = MessageId::new();
        assert!(transcript.open(a1).is_ok());
        assert!(transcript.append(a1, "a1").is_ok());
        assert!(transcript.close(a1).is_ok());
        assert!(transcript.push(Message::user("q2", Vec::new())).is_ok());

        assert_eq!(texts(&transcript), vec!["q1", "a1", "q2"]);
        assert_eq!(transcript.user_message_count(), 2);
    }
}
