//! In-process doubles for the transport and clock capabilities.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::StreamExt;

use crate::llm::error::{TransportError, TransportResult};
use crate::llm::transport::{ByteStream, TransportFuture, TurnRequest, TurnTransport};
use crate::storage::clock::Clock;

/// Scripted response for one turn.
pub(crate) enum Script {
    /// Body fragments, then end of input.
    Respond(Vec<TransportResult<Bytes>>),
    /// Body fragments, then nothing ever again.
    RespondThenHang(Vec<TransportResult<Bytes>>),
    /// Refuse the request before any body.
    Refuse(TransportError),
}

/// Encode one wire record.
pub(crate) fn frame(text: &str, done: bool) -> TransportResult<Bytes> {
    let record = serde_json::json!({ "text-fragment": text, "done": done });
    Ok(Bytes::from(format!("{record}\n")))
}

/// Encode a final wire record carrying a token.
pub(crate) fn final_frame(text: &str, token: &[i64]) -> TransportResult<Bytes> {
    let record = serde_json::json!({ "text-fragment": text, "done": true, "token": token });
    Ok(Bytes::from(format!("{record}\n")))
}

struct ReleaseCounter(Arc<AtomicUsize>);

impl Drop for ReleaseCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Transport that replays scripts in order and records every request.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<TurnRequest>>,
    released: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub(crate) fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Requests received so far, in order.
    pub(crate) fn requests(&self) -> Vec<TurnRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Response bodies dropped so far.
    pub(crate) fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    fn body(&self, chunks: Vec<TransportResult<Bytes>>, hang: bool) -> ByteStream {
        let guard = ReleaseCounter(Arc::clone(&self.released));
        let body = futures::stream::iter(chunks);
        let body = if hang {
            body.chain(futures::stream::pending()).boxed()
        } else {
            body.boxed()
        };
        body.map(move |chunk| {
            let _counter = &guard;
            chunk
        })
        .boxed()
    }
}

impl TurnTransport for ScriptedTransport {
    fn send_turn(&self, request: TurnRequest) -> TransportFuture<'_, TransportResult<ByteStream>> {
        Box::pin(async move {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request);
            let script = self
                .scripts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            match script {
                Some(Script::Respond(chunks)) => Ok(self.body(chunks, false)),
                Some(Script::RespondThenHang(chunks)) => Ok(self.body(chunks, true)),
                Some(Script::Refuse(err)) => Err(err),
                None => Err(TransportError::Closed),
            }
        })
    }
}

/// Clock that only moves when told to.
pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
            .single()
            .unwrap_or_default();
        Self {
            now: Mutex::new(start),
        }
    }
}

impl ManualClock {
    pub(crate) fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
