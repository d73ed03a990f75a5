//! Continuation token and carried-attachment bookkeeping.

use crate::chat::types::{Attachment, ContinuationState};

/// Tracks what the next turn needs to continue the conversation.
///
/// Only mutated when a turn completes, never while one is streaming.
#[derive(Clone, Debug, Default)]
pub struct ContextManager {
    state: ContinuationState,
}

impl ContextManager {
    /// Start with no token and no carried images.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest continuation token.
    #[must_use]
    pub fn token(&self) -> Option<&[i64]> {
        self.state.token.as_deref()
    }

    /// Images carried from earlier turns, oldest first.
    #[must_use]
    pub fn carried_attachments(&self) -> &[Attachment] {
        &self.state.carried_attachments
    }

    /// Record a completed turn.
    ///
    /// The token replaces the previous one outright; the service-side state it encodes
    /// is cumulative. New attachments are appended to the carried list.
    pub fn advance(&mut self, token: Vec<i64>, attachments: &[Attachment]) {
        self.state.token = Some(token);
        self.state
            .carried_attachments
            .extend(attachments.iter().cloned());
    }

    /// Record a completed turn whose final record carried no token.
    ///
    /// The previous token is kept; attachments are still carried.
    pub fn carry(&mut self, attachments: &[Attachment]) {
        self.state
            .carried_attachments
            .extend(attachments.iter().cloned());
    }

    /// Images to send with the next turn.
    ///
    /// Explicit attachments win. Without any, only the most recently carried image is
    /// offered, so follow-up questions about it work without re-uploading while the
    /// request never grows with the full image history.
    #[must_use]
    pub fn attachments_for_next_turn(&self, explicit: &[Attachment]) -> Vec<Attachment> {
        if !explicit.is_empty() {
            return explicit.to_vec();
        }
        self.state
            .carried_attachments
            .last()
            .cloned()
            .into_iter()
            .collect()
    }

    /// Forget the token and every carried image.
    pub fn reset(&mut self) {
        self.state = ContinuationState::default();
    }

    /// Seed from a stored snapshot.
    pub fn restore(&mut self, state: ContinuationState) {
        self.state = state;
    }

    /// Copy of the current state, for saving.
    #[must_use]
    pub fn snapshot(&self) -> ContinuationState {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(data: &str) -> Attachment {
        Attachment {
            data: data.to_string(),
            name: None,
            mime_type: Some("image/png".to_string()),
        }
    }

    #[test]
    fn test_advance_replaces_token() {
        let mut context = ContextManager::new();
        assert_eq!(context.token(), None);

        context.advance(vec![1, 2, 3], &[]);
        context.advance(vec![9], &[]);
        assert_eq!(context.token(), Some([9].as_slice()));
    }

    #[test]
    fn test_explicit_attachments_win() {
        let mut context = ContextManager::new();
        context.advance(vec![1], &[image("old")]);

        let explicit = vec![image("new-a"), image("new-b")];
        assert_eq!(context.attachments_for_next_turn(&explicit), explicit);
    }

    #[test]
    fn test_only_latest_carried_image_is_offered() {
        let mut context = ContextManager::new();
        context.advance(vec![1], &[image("first")]);
        context.advance(vec![2], &[image("second"), image("third")]);

        assert_eq!(context.carried_attachments().len(), 3);
        assert_eq!(context.attachments_for_next_turn(&[]), vec![image("third")]);
    }

    #[test]
    fn test_nothing_carried_means_no_images() {
        let context = ContextManager::new();
        assert!(context.attachments_for_next_turn(&[]).is_empty());
    }

    #[test]
    fn test_carry_keeps_previous_token() {
        let mut context = ContextManager::new();
        context.advance(vec![5], &[]);
        context.carry(&[image("x")]);
        assert_eq!(context.token(), Some([5].as_slice()));
        assert_eq!(context.carried_attachments().len(), 1);
    }

    #[test]
    fn test_reset_then_restore() {
        let mut context = ContextManager::new();
        context.advance(vec![1], &[image("a")]);
        context.reset();
        assert_eq!(context.snapshot(), ContinuationState::default());

        context.restore(ContinuationState {
            token: Some(vec![4, 2]),
            carried_attachments: vec![image("b")],
        });
        assert_eq!(context.token(), Some([4, 2].as_slice()));
        assert_eq!(context.attachments_for_next_turn(&[]), vec![image("b")]);
    }
}
