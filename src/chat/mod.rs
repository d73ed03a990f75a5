//! Conversation core for a streaming chat session.
//!
//! - `ids`: session and message identifiers
//! - `types`: messages, attachments, sessions, and their summaries
//! - `decoder`: newline-delimited frame decoding of the response stream
//! - `transcript`: ordered transcript with a single open streaming target
//! - `context`: continuation token and carried images
//! - `events`: observer contract for presentation layers
//! - `controller`: the session controller and its turn state machine

pub mod context;
pub mod controller;
pub mod decoder;
pub mod errors;
pub mod events;
pub mod ids;
pub mod transcript;
pub mod types;

pub use context::ContextManager;
pub use controller::{SessionController, TurnCanceller, TurnOutcome, validate_turn};
pub use decoder::{DecodeError, FrameDecoder, GenerateFrame, StreamError, decode_stream};
pub use errors::{ChatError, ChatResult};
pub use events::{ChatEvent, ChatObserver, Observers, TurnState};
pub use ids::{MessageId, SessionId};
pub use transcript::{AbortOutcome, TranscriptReconciler};
pub use types::{Attachment, ContinuationState, Message, Role, Session, SessionSummary};
