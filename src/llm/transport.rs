//! The capability the conversation core uses to send a turn to the model.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::chat::types::Attachment;
use crate::llm::error::TransportResult;

/// Boxed future type for transport operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Raw response body, delivered in transport-determined fragments.
pub type ByteStream = BoxStream<'static, TransportResult<Bytes>>;

/// Everything the service needs for one turn.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TurnRequest {
    /// The user's text, exactly as typed.
    pub text: String,
    /// Images for this turn: either fresh uploads or the carried-over image.
    pub attachments: Vec<Attachment>,
    /// Continuation token from the previous completed turn.
    pub continuation_token: Option<Vec<i64>>,
}

/// Sends a turn and hands back its streaming response body.
///
/// Dropping the returned stream must release the underlying connection.
pub trait TurnTransport: Send + Sync {
    /// Submit a turn.
    ///
    /// # Errors
    /// Returns an error if the request cannot be sent or is refused by the service.
    fn send_turn(&self, request: TurnRequest) -> TransportFuture<'_, TransportResult<ByteStream>>;
}
