//! Observer contract between the conversation core and presentation layers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::chat::ids::{MessageId, SessionId};
use crate::chat::types::Message;

/// Phase of the turn state machine.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// No turn in flight.
    #[default]
    Idle,
    /// Request sent, no record decoded yet.
    AwaitingFirstByte,
    /// At least one record decoded.
    Streaming,
}

/// Notification emitted by the session controller.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// An entry was added at the end of the transcript.
    MessageAppended {
        /// The new entry.
        message: Message,
    },
    /// Streamed text was appended to an entry.
    ///
    /// Only the new fragment is carried; observers that keep a copy concatenate.
    MessageUpdated {
        /// Entry that changed.
        id: MessageId,
        /// The fragment just appended.
        fragment: String,
    },
    /// An empty placeholder was dropped after a failed turn.
    MessageRemoved {
        /// Entry that was removed.
        id: MessageId,
    },
    /// The turn state machine moved.
    TurnStateChanged {
        /// New state.
        state: TurnState,
    },
    /// The turn finished with a final record.
    TurnCompleted {
        /// Assistant entry holding the reply.
        message_id: MessageId,
    },
    /// The turn failed; partial text, if any, stays in the transcript.
    TurnFailed {
        /// Assistant entry of the failed turn.
        message_id: MessageId,
        /// Human-readable cause.
        reason: String,
    },
    /// The active session was written to the store.
    SessionSaved {
        /// Stored session.
        session_id: SessionId,
        /// Title it was stored under.
        title: String,
    },
    /// The working session was swapped (loaded or reset).
    SessionReplaced {
        /// New working session.
        session_id: SessionId,
        /// Its full transcript.
        messages: Vec<Message>,
    },
}

/// Receives controller notifications, synchronously and in emission order.
pub trait ChatObserver: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &ChatEvent);
}

impl ChatObserver for broadcast::Sender<ChatEvent> {
    fn on_event(&self, event: &ChatEvent) {
        // No subscribers is fine.
        let _ = self.send(event.clone());
    }
}

impl ChatObserver for mpsc::UnboundedSender<ChatEvent> {
    fn on_event(&self, event: &ChatEvent) {
        let _ = self.send(event.clone());
    }
}

/// Fan-out list of observers.
#[derive(Clone, Default)]
pub struct Observers {
    observers: Vec<Arc<dyn ChatObserver>>,
}

impl Observers {
    /// Register another observer.
    pub fn subscribe(&mut self, observer: Arc<dyn ChatObserver>) {
        self.observers.push(observer);
    }

    /// Deliver an event to every observer.
    pub fn emit(&self, event: &ChatEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }

    /// Number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether no observer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_with_type_tag() {
        let event = ChatEvent::TurnStateChanged {
            state: TurnState::AwaitingFirstByte,
        };
        let json = serde_json::to_string(&event).unwrap_or_default();
        assert_eq!(
            json,
            "{\"type\":\"turn_state_changed\",\"state\":\"awaiting_first_byte\"}"
        );
    }

    #[test]
    fn test_fan_out_reaches_every_observer() {
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();
        let mut observers = Observers::default();
        observers.subscribe(Arc::new(first_tx));
        observers.subscribe(Arc::new(second_tx));

        let id = MessageId::new();
        observers.emit(&ChatEvent::MessageRemoved { id });

        assert_eq!(observers.len(), 2);
        assert_eq!(first_rx.try_recv().ok(), Some(ChatEvent::MessageRemoved { id }));
        assert_eq!(second_rx.try_recv().ok(), Some(ChatEvent::MessageRemoved { id }));
    }

    #[test]
    fn test_broadcast_without_subscribers_is_silent() {
        let (tx, _) = broadcast::channel::<ChatEvent>(4);
        tx.on_event(&ChatEvent::TurnStateChanged {
            state: TurnState::Idle,
        });
        assert_eq!(tx.receiver_count(), 0);
    }
}
