//! Newline-delimited frame decoding for the streaming generate endpoint.
//!
//! Bytes are buffered (not text) so that a frame, or even a multi-byte character,
//! split across two physical fragments is reassembled before it is parsed.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use thiserror::Error;

use crate::llm::error::{TransportError, TransportResult};

/// Longest slice of a rejected line echoed into logs.
const LINE_PREVIEW_CHARS: usize = 120;

/// One decoded record of the response stream.
///
/// Accepts both the documented field names and the service's native ones
/// (`response`, `context`).
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct GenerateFrame {
    /// Text to append to the open assistant entry.
    #[serde(rename = "text-fragment", alias = "response")]
    pub text_fragment: String,
    /// Whether this is the final record of the turn.
    pub done: bool,
    /// Continuation token, present only on the final record.
    #[serde(default, alias = "context")]
    pub token: Option<Vec<i64>>,
}

#[derive(Deserialize)]
struct ServiceErrorFrame {
    error: String,
}

/// A single frame that could not be decoded. Absorbed by the decoder.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Line is not a structured record.
    #[error("malformed frame {line:?}: {source}")]
    Malformed {
        /// Leading part of the offending line.
        line: String,
        /// Parser failure.
        #[source]
        source: serde_json::Error,
    },
    /// The service sent an error record instead of a frame.
    #[error("inference service reported: {0}")]
    Service(String),
}

/// Conditions that end a decoded stream early.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The transport failed while the body was being read.
    #[error("transport failed mid-stream: {0}")]
    Transport(#[from] TransportError),
    /// End of input arrived before any record had `done` set.
    #[error("stream ended after {frames} frame(s) without a final record")]
    PrematureTermination {
        /// Records decoded before the end of input.
        frames: usize,
    },
}

/// Incremental newline framer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    frames: usize,
    rejected: usize,
    done_seen: bool,
}

impl FrameDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a physical fragment.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete frame, if a full line is buffered.
    ///
    /// Blank lines are ignored; lines that fail to decode are logged and skipped.
    pub fn next_frame(&mut self) -> Option<GenerateFrame> {
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(newline + 1).freeze();
            if let Some(frame) = self.accept(&line[..newline]) {
                return Some(frame);
            }
        }
        None
    }

    /// Decode whatever is left once the transport signals end of input.
    pub fn finish(&mut self) -> Option<GenerateFrame> {
        let tail = self.buffer.split().freeze();
        self.accept(&tail)
    }

    /// Push a fragment and drain every frame it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<GenerateFrame> {
        self.push(chunk);
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Frames decoded so far.
    #[must_use]
    pub const fn frames(&self) -> usize {
        self.frames
    }

    /// Lines skipped because they could not be decoded.
    #[must_use]
    pub const fn rejected(&self) -> usize {
        self.rejected
    }

    /// Whether a final (`done`) record has been decoded.
    #[must_use]
    pub const fn saw_done(&self) -> bool {
        self.done_seen
    }

    /// Bytes held back waiting for a newline.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn accept(&mut self, line: &[u8]) -> Option<GenerateFrame> {
        match parse_line(line) {
            Ok(Some(frame)) => {
                self.frames += 1;
                self.done_seen |= frame.done;
                Some(frame)
            }
            Ok(None) => None,
            Err(err) => {
                self.rejected += 1;
                tracing::warn!(error = %err, "skipping undecodable frame");
                None
            }
        }
    }
}

/// Parse one line. `Ok(None)` for blank lines.
///
/// # Errors
/// Returns a [`DecodeError`] if the line is neither a frame nor blank.
pub fn parse_line(line: &[u8]) -> Result<Option<GenerateFrame>, DecodeError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    match serde_json::from_slice::<GenerateFrame>(line) {
        Ok(frame) => Ok(Some(frame)),
        Err(source) => {
            if let Ok(service) = serde_json::from_slice::<ServiceErrorFrame>(line) {
                return Err(DecodeError::Service(service.error));
            }
            Err(DecodeError::Malformed {
                line: String::from_utf8_lossy(line)
                    .chars()
                    .take(LINE_PREVIEW_CHARS)
                    .collect(),
                source,
            })
        }
    }
}

enum DecodeState<S> {
    Reading { bytes: S, decoder: FrameDecoder },
    Ended { frames: usize, saw_done: bool },
    Finished,
}

/// Turn a raw byte stream into an ordered, lazy stream of frames.
///
/// Yields frames in arrival order. A transport failure is yielded once as the last
/// item. If input ends before any frame had `done` set, the last item is
/// [`StreamError::PrematureTermination`].
pub fn decode_stream<S>(bytes: S) -> impl Stream<Item = Result<GenerateFrame, StreamError>> + Send
where
    S: Stream<Item = TransportResult<Bytes>> + Send + Unpin + 'static,
{
    let initial = DecodeState::Reading {
        bytes,
        decoder: FrameDecoder::new(),
    };

    futures::stream::unfold(initial, |mut state| async move {
        loop {
            state = match state {
                DecodeState::Finished | DecodeState::Ended { saw_done: true, .. } => return None,
                DecodeState::Ended {
                    frames,
                    saw_done: false,
                } => {
                    return Some((
                        Err(StreamError::PrematureTermination { frames }),
                        DecodeState::Finished,
                    ));
                }
                DecodeState::Reading {
                    mut bytes,
                    mut decoder,
                } => {
                    if let Some(frame) = decoder.next_frame() {
                        return Some((Ok(frame), DecodeState::Reading { bytes, decoder }));
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            decoder.push(&chunk);
                            DecodeState::Reading { bytes, decoder }
                        }
                        Some(Err(err)) => {
                            return Some((Err(StreamError::Transport(err)), DecodeState::Finished));
                        }
                        None => {
                            let tail = decoder.finish();
                            let ended = DecodeState::Ended {
                                frames: decoder.frames(),
                                saw_done: decoder.saw_done(),
                            };
                            if let Some(frame) = tail {
                                return Some((Ok(frame), ended));
                            }
                            ended
                        }
                    }
                }
            };
        }
    })
}
