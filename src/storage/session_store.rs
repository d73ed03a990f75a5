//! Keyed collection of saved sessions.
//!
//! The whole collection lives under one namespace key and is read and written as a
//! single JSON blob, so every write replaces the collection atomically.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::chat::ids::SessionId;
use crate::chat::types::{Message, Role, Session, SessionSummary};
use crate::storage::clock::Clock;
use crate::storage::errors::{StoreError, StoreResult};
use crate::storage::kv::KeyValueStore;

/// Namespace key the collection is stored under by default.
pub const DEFAULT_NAMESPACE: &str = "ollama_chat_history";
/// Longest preview, in characters, before truncation.
pub const PREVIEW_MAX_CHARS: usize = 60;
/// Longest derived title, in characters, before truncation.
pub const TITLE_MAX_CHARS: usize = 40;
/// Marker appended to truncated text.
pub const ELLIPSIS: &str = "...";
/// Preview of a session without a full exchange.
pub const EMPTY_PREVIEW: &str = "Empty chat";
/// Title of a session without any user text.
pub const DEFAULT_TITLE: &str = "New chat";

/// Cut `text` to `max_chars` characters, marking the cut with [`ELLIPSIS`].
#[must_use]
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.truncate(cut.trim_end().len());
    cut.push_str(ELLIPSIS);
    cut
}

/// Title from the first user message with text.
#[must_use]
pub fn derive_title(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|message| message.role == Role::User)
        .find(|message| !message.text.trim().is_empty())
        .map_or_else(
            || DEFAULT_TITLE.to_string(),
            |message| truncate_with_ellipsis(&message.text, TITLE_MAX_CHARS),
        )
}

/// Excerpt of the second-to-last message.
#[must_use]
pub fn derive_preview(messages: &[Message]) -> String {
    let Some(index) = messages.len().checked_sub(2) else {
        return EMPTY_PREVIEW.to_string();
    };
    let excerpt = truncate_with_ellipsis(&messages[index].text, PREVIEW_MAX_CHARS);
    if excerpt.is_empty() {
        EMPTY_PREVIEW.to_string()
    } else {
        excerpt
    }
}

impl Session {
    /// Listing projection, derived from the current content.
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            title: self.title.clone(),
            preview: derive_preview(&self.messages),
            created_at: self.created_at,
        }
    }
}

/// Durable mapping from session id to session.
pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    namespace: String,
    write_lock: Mutex<()>,
}

impl SessionStore {
    /// Create a store over the default namespace.
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_namespace(kv, clock, DEFAULT_NAMESPACE)
    }

    /// Create a store over a custom namespace key.
    #[must_use]
    pub fn with_namespace(
        kv: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            kv,
            clock,
            namespace: namespace.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Namespace key of the collection.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Insert or fully overwrite by id.
    ///
    /// `updated_at` is set to now; `created_at` is kept from the first insert.
    /// Returns the session as stored.
    ///
    /// # Errors
    /// Returns an error if the collection cannot be read, decoded, or written. On
    /// error the stored collection is unchanged.
    pub async fn upsert(&self, session: Session) -> StoreResult<Session> {
        let _guard = self.write_lock.lock().await;
        let mut sessions = self.load_for_write().await?;

        let mut stored = session;
        stored.updated_at = self.clock.now();
        match sessions.iter_mut().find(|existing| existing.id == stored.id) {
            Some(existing) => {
                stored.created_at = existing.created_at;
                existing.clone_from(&stored);
            }
            None => sessions.push(stored.clone()),
        }

        self.persist(&sessions).await?;
        tracing::debug!(session = %stored.id, total = sessions.len(), "session saved");
        Ok(stored)
    }

    /// Look up one session. `Ok(None)` when absent.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub async fn get(&self, id: SessionId) -> StoreResult<Option<Session>> {
        let sessions = self.load_for_read().await?;
        Ok(sessions.into_iter().find(|session| session.id == id))
    }

    /// Remove a session. Returns whether anything was removed; a missing id is not an
    /// error.
    ///
    /// # Errors
    /// Returns an error if the collection cannot be read, decoded, or written.
    pub async fn delete(&self, id: SessionId) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut sessions = self.load_for_write().await?;

        let before = sessions.len();
        sessions.retain(|session| session.id != id);
        if sessions.len() == before {
            return Ok(false);
        }

        self.persist(&sessions).await?;
        tracing::debug!(session = %id, "session deleted");
        Ok(true)
    }

    /// Summaries, most recently created first; ties broken by id.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub async fn list(&self) -> StoreResult<Vec<SessionSummary>> {
        let sessions = self.load_for_read().await?;
        let mut summaries: Vec<SessionSummary> = sessions.iter().map(Session::summary).collect();
        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(summaries)
    }

    async fn load_for_read(&self) -> StoreResult<Vec<Session>> {
        match self.load_for_write().await {
            Err(StoreError::Corrupt { key, reason }) => {
                tracing::error!(%key, %reason, "ignoring unreadable session collection");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    async fn load_for_write(&self) -> StoreResult<Vec<Session>> {
        let Some(blob) = self.kv.read(&self.namespace).await? else {
            return Ok(Vec::new());
        };
        serde_json::from_slice(&blob).map_err(|err| StoreError::Corrupt {
            key: self.namespace.clone(),
            reason: err.to_string(),
        })
    }

    async fn persist(&self, sessions: &[Session]) -> StoreResult<()> {
        let blob = serde_json::to_vec(sessions)?;
        self.kv.write(&self.namespace, blob).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::chat::types::ContinuationState;
    use crate::storage::kv::MemoryKvStore;
    use crate::test_support::ManualClock;

    fn session_at(minutes: i64, texts: &[&str]) -> Session {
        let created_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().unwrap_or_default()
            + Duration::minutes(minutes);
        let messages = texts
            .iter()
            .enumerate()
            .map(|(index, text)| {
                let mut message = Message::user(*text, Vec::new());
                if index % 2 == 1 {
                    message.role = Role::Assistant;
                }
                message
            })
            .collect();
        Session {
            id: SessionId::new(),
            title: derive_title(&[]),
            messages,
            created_at,
            updated_at: created_at,
            continuation: ContinuationState {
                token: Some(vec![1, 2, 3]),
                carried_attachments: Vec::new(),
            },
        }
    }

    fn store() -> (SessionStore, Arc<ManualClock>, Arc<MemoryKvStore>) {
        let clock = Arc::new(ManualClock::default());
        let kv = Arc::new(MemoryKvStore::new());
        let store = SessionStore::new(kv.clone(), clock.clone());
        (store, clock, kv)
    }

    #[test]
    fn test_truncate_marks_cut() {
        assert_eq!(truncate_with_ellipsis("short", 10), "short");
        assert_eq!(truncate_with_ellipsis("exactly10!", 10), "exactly10!");
        assert_eq!(truncate_with_ellipsis("a longer sentence", 8), "a longer...");
        assert_eq!(truncate_with_ellipsis("ééééé", 3), "ééé...");
    }

    #[test]
    fn test_title_from_first_user_text() {
        let session = session_at(0, &["", "reply", "What is the capital of France and why?"]);
        assert_eq!(derive_title(&session.messages), "What is the capital of France and why?");
        assert_eq!(derive_title(&[]), DEFAULT_TITLE);

        let long = "x".repeat(TITLE_MAX_CHARS + 5);
        let title = derive_title(&[Message::user(long, Vec::new())]);
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + ELLIPSIS.len());
    }

    #[test]
    fn test_preview_uses_second_to_last() {
        assert_eq!(derive_preview(&[]), EMPTY_PREVIEW);
        let one = session_at(0, &["hello"]);
        assert_eq!(derive_preview(&one.messages), EMPTY_PREVIEW);

        let three = session_at(0, &["hello", "Hi there", "thanks"]);
        assert_eq!(derive_preview(&three.messages), "Hi there");

        let long = "y".repeat(PREVIEW_MAX_CHARS * 2);
        let session = session_at(0, &[long.as_str(), "reply"]);
        let preview = derive_preview(&session.messages);
        assert!(preview.ends_with(ELLIPSIS));
        assert_eq!(preview.chars().count(), PREVIEW_MAX_CHARS + ELLIPSIS.len());
    }

    #[tokio::test]
    async fn test_upsert_then_get_refreshes_updated_at_only() -> StoreResult<()> {
        let (store, clock, _) = store();
        let session = session_at(0, &["hello", "Hi there"]);
        clock.advance(Duration::hours(1));

        let stored = store.upsert(session.clone()).await?;
        let fetched = store.get(session.id).await?;

        assert_eq!(fetched.as_ref(), Some(&stored));
        let mut expected = session;
        expected.updated_at = clock.now();
        assert_eq!(fetched, Some(expected));
        Ok(())
    }

    #[tokio::test]
    async fn test_upsert_keeps_first_created_at() -> StoreResult<()> {
        let (store, clock, _) = store();
        let original = session_at(0, &["hello"]);
        store.upsert(original.clone()).await?;

        clock.advance(Duration::minutes(30));
        let mut edited = original.clone();
        edited.created_at = clock.now();
        edited.title = "Renamed".to_string();
        let stored = store.upsert(edited).await?;

        assert_eq!(stored.created_at, original.created_at);
        assert_eq!(stored.updated_at, clock.now());
        assert_eq!(store.list().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_orders_by_created_at_descending() -> StoreResult<()> {
        let (store, _, _) = store();
        let oldest = session_at(0, &["a"]);
        let newest = session_at(20, &["c"]);
        let middle = session_at(10, &["b"]);
        for session in [&oldest, &newest, &middle] {
            store.upsert(session.clone()).await?;
        }

        let ids: Vec<SessionId> = store.list().await?.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![newest.id, middle.id, oldest.id]);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_breaks_ties_by_id() -> StoreResult<()> {
        let (store, _, _) = store();
        let first = session_at(5, &["a"]);
        let second = session_at(5, &["b"]);
        store.upsert(first.clone()).await?;
        store.upsert(second.clone()).await?;

        let mut expected = vec![first.id, second.id];
        expected.sort();
        let ids: Vec<SessionId> = store.list().await?.iter().map(|s| s.id).collect();
        assert_eq!(ids, expected);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() -> StoreResult<()> {
        let (store, _, _) = store();
        let session = session_at(0, &["a"]);
        store.upsert(session.clone()).await?;

        assert!(store.delete(session.id).await?);
        assert!(!store.delete(session.id).await?);
        assert!(store.get(session.id).await?.is_none());
        assert!(store.list().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_collection_reads_empty_but_refuses_writes() -> StoreResult<()> {
        let (store, _, kv) = store();
        kv.write(DEFAULT_NAMESPACE, b"{not json".to_vec()).await?;

        assert!(store.list().await?.is_empty());
        let result = store.upsert(session_at(0, &["a"])).await;
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
        assert_eq!(kv.read(DEFAULT_NAMESPACE).await?, Some(b"{not json".to_vec()));
        Ok(())
    }
}
