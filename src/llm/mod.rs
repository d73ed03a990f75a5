//! Inference transport.
//!
//! - `transport`: the capability the conversation core sends turns through
//! - `ollama_client`: its implementation over the Ollama HTTP API
//! - `error`: transport errors

pub mod error;
pub mod ollama_client;
pub mod transport;

pub use error::{TransportError, TransportResult};
pub use ollama_client::OllamaClient;
pub use transport::{ByteStream, TransportFuture, TurnRequest, TurnTransport};
