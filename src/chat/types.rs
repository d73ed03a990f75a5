//! Transcript and session data model.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::errors::{ChatError, ChatResult};
use crate::chat::ids::{MessageId, SessionId};

/// Author of a transcript entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Text typed (and images attached) by the person chatting.
    User,
    /// Text streamed back by the model.
    Assistant,
}

impl Role {
    /// Stable string form for storage and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A binary image carried as base64, the encoding the inference service expects.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Standard base64 payload, without any `data:` URL prefix.
    pub data: String,
    /// Original file name, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// MIME type, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl Attachment {
    /// Encode raw image bytes.
    ///
    /// # Errors
    /// Returns [`ChatError::InvalidAttachment`] for non-image MIME types or empty payloads.
    pub fn from_image_bytes(
        mime_type: &str,
        name: Option<String>,
        bytes: &[u8],
    ) -> ChatResult<Self> {
        if !mime_type.starts_with("image/") {
            return Err(ChatError::InvalidAttachment(format!(
                "unsupported content type {mime_type}, expected an image"
            )));
        }
        if bytes.is_empty() {
            return Err(ChatError::InvalidAttachment("empty image payload".to_string()));
        }

        Ok(Self {
            data: STANDARD.encode(bytes),
            name,
            mime_type: Some(mime_type.to_string()),
        })
    }

    /// Accept an already encoded image, with or without a `data:<mime>;base64,` prefix.
    ///
    /// # Errors
    /// Returns [`ChatError::InvalidAttachment`] if the payload is empty, is not valid
    /// base64, or declares a non-image MIME type.
    pub fn from_base64(encoded: &str) -> ChatResult<Self> {
        let (mime_type, data) = match encoded.strip_prefix("data:") {
            Some(rest) => {
                let (header, payload) = rest.split_once(',').ok_or_else(|| {
                    ChatError::InvalidAttachment("malformed data url".to_string())
                })?;
                let mime = header.trim_end_matches(";base64");
                if !mime.starts_with("image/") {
                    return Err(ChatError::InvalidAttachment(format!(
                        "unsupported content type {mime}, expected an image"
                    )));
                }
                (Some(mime.to_string()), payload.trim())
            }
            None => (None, encoded.trim()),
        };

        if data.is_empty() {
            return Err(ChatError::InvalidAttachment("empty image payload".to_string()));
        }
        STANDARD
            .decode(data)
            .map_err(|err| ChatError::InvalidAttachment(format!("invalid base64: {err}")))?;

        Ok(Self {
            data: data.to_string(),
            name: None,
            mime_type,
        })
    }
}

/// One transcript entry.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Identifier assigned at creation.
    pub id: MessageId,
    /// Author.
    pub role: Role,
    /// Body text; only grows while the entry is the open streaming target.
    pub text: String,
    /// Images sent with the entry, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Build a complete user entry.
    #[must_use]
    pub fn user(text: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            id: MessageId::new(),
            role: Role::User,
            text: text.into(),
            attachments,
        }
    }

    /// Build an empty assistant entry that streamed text will fill.
    #[must_use]
    pub const fn assistant_placeholder(id: MessageId) -> Self {
        Self {
            id,
            role: Role::Assistant,
            text: String::new(),
            attachments: Vec::new(),
        }
    }
}

/// Multi-turn continuation carried between turns of one session.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ContinuationState {
    /// Opaque model state from the last completed turn; absent before the first one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Vec<i64>>,
    /// Images from earlier turns, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub carried_attachments: Vec<Attachment>,
}

/// A saved conversation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Stable identifier reused on every save.
    pub id: SessionId,
    /// Human-readable title derived on first save.
    pub title: String,
    /// Transcript in conversation order.
    pub messages: Vec<Message>,
    /// When the conversation started.
    pub created_at: DateTime<Utc>,
    /// When the conversation was last written to the store.
    pub updated_at: DateTime<Utc>,
    /// Continuation snapshot at save time.
    #[serde(default)]
    pub continuation: ContinuationState,
}

/// Listing projection of a [`Session`], recomputed on every read.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session identifier.
    pub id: SessionId,
    /// Session title.
    pub title: String,
    /// Short excerpt of the latest exchange.
    pub preview: String,
    /// When the conversation started.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_bytes_are_encoded() {
        let attachment = Attachment::from_image_bytes("image/png", None, b"png");
        assert_eq!(attachment.map(|a| a.data).ok(), Some("cG5n".to_string()));
    }

    #[test]
    fn test_non_image_rejected() {
        let result = Attachment::from_image_bytes("application/pdf", None, b"%PDF");
        assert!(matches!(result, Err(ChatError::InvalidAttachment(_))));
    }

    #[test]
    fn test_data_url_prefix_stripped() {
        let attachment = Attachment::from_base64("data:image/jpeg;base64,cG5n");
        let attachment = attachment.ok();
        assert_eq!(attachment.as_ref().map(|a| a.data.as_str()), Some("cG5n"));
        assert_eq!(
            attachment.and_then(|a| a.mime_type),
            Some("image/jpeg".to_string())
        );
    }

    #[test]
    fn test_invalid_base64_rejected() {
        assert!(Attachment::from_base64("not base64!").is_err());
        assert!(Attachment::from_base64("   ").is_err());
        assert!(Attachment::from_base64("data:text/plain;base64,cG5n").is_err());
    }

    #[test]
    fn test_role_as_str() {
        assert_eq!(Role::User.to_string(), "user");
        assert_eq!(Role::Assistant.as_str(), "assistant");
    }
}
