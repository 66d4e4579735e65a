//! Streaming response reconciler: turns the chat proxy's chunked SSE byte
//! stream into incremental mutations of exactly one assistant message.
//!
//! The byte-level state machine ([`SseParser`]) handles UTF-8 sequences and
//! event lines split across chunk boundaries; [`reconcile`] drives it over
//! the live stream under a wall-clock deadline and an abort signal.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::AppError;
use crate::models::StreamEnvelope;

/// Hard deadline for the whole stream; a hung upstream provider fails the
/// operation rather than pinning the send forever.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// Minimum spacing between partial-progress checkpoints.
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(2);

const EVENT_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

// ── Byte-level parser ─────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    MessageId(String),
    Done,
}

/// Incremental decoder for `data: `-framed event lines. Incomplete trailing
/// UTF-8 sequences and partial lines are carried across `feed` calls;
/// malformed lines are skipped, never fatal.
#[derive(Debug, Default)]
pub struct SseParser {
    utf8_carry: Vec<u8>,
    line_buf: String,
    done: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        let text = self.decode(bytes);
        self.line_buf.push_str(&text);

        let mut events = Vec::new();
        while let Some(pos) = self.line_buf.find('\n') {
            let line: String = self.line_buf.drain(..=pos).collect();
            if self.done {
                continue;
            }
            self.parse_line(line.trim_end_matches(['\n', '\r']), &mut events);
        }
        events
    }

    /// Decodes as much of the accumulated bytes as is valid UTF-8, keeping an
    /// incomplete trailing sequence for the next chunk. Invalid sequences are
    /// dropped rather than aborting the stream.
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.utf8_carry.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.utf8_carry) {
                Ok(s) => {
                    out.push_str(s);
                    self.utf8_carry.clear();
                    break;
                }
                Err(e) => {
                    let rest = self.utf8_carry.split_off(e.valid_up_to());
                    if let Ok(s) = std::str::from_utf8(&self.utf8_carry) {
                        out.push_str(s);
                    }
                    self.utf8_carry = rest;
                    match e.error_len() {
                        Some(n) => {
                            self.utf8_carry.drain(..n);
                        }
                        // Incomplete trailing sequence: wait for more bytes.
                        None => break,
                    }
                }
            }
        }
        out
    }

    fn parse_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        let Some(payload) = line.strip_prefix(EVENT_PREFIX) else {
            return;
        };
        let payload = payload.trim_start();
        if payload.is_empty() {
            return;
        }
        if payload == DONE_SENTINEL {
            self.done = true;
            events.push(SseEvent::Done);
            return;
        }

        match serde_json::from_str::<StreamEnvelope>(payload) {
            Ok(envelope) => {
                if let Some(id) = envelope.message_id() {
                    events.push(SseEvent::MessageId(id));
                }
                if let Some(content) = envelope.content {
                    events.push(SseEvent::Delta(content));
                }
            }
            // The upstream protocol is not well-formed on every line.
            Err(e) => debug!("Skipping malformed stream line: {e}"),
        }
    }
}

// ── Stream driver ─────────────────────────────────────────────────────────────

/// Receives reconciler effects. Implementations must not block: the live
/// sink forwards UI events and spawns checkpoint writes in the background.
pub trait StreamSink: Send {
    fn on_delta(&mut self, temp_id: &str, delta: &str, content: &str);
    fn on_durable_id(&mut self, temp_id: &str, durable_id: &str);
    /// Throttled partial-progress write. `durable_id` is `None` until the
    /// backend has issued one, in which case there is nothing to update yet.
    fn checkpoint(&mut self, durable_id: Option<&str>, content: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Complete,
    Cancelled,
}

#[derive(Debug)]
pub struct StreamResult {
    pub content: String,
    pub durable_id: Option<String>,
    pub outcome: StreamOutcome,
}

/// Drains the stream into the sink until completion, abort, or the deadline.
///
/// Content deltas accumulate in arrival order; the durable message id is
/// recorded at most once (first envelope wins). The deadline is a hard
/// failure; abort ends the drain but keeps whatever content already
/// surfaced. Callers pass [`STREAM_TIMEOUT`] outside of tests.
pub async fn reconcile<S>(
    mut stream: S,
    temp_id: &str,
    sink: &mut dyn StreamSink,
    abort: &mut watch::Receiver<bool>,
    timeout: Duration,
) -> Result<StreamResult, AppError>
where
    S: Stream<Item = Result<Bytes, AppError>> + Unpin,
{
    let mut parser = SseParser::new();
    let mut content = String::new();
    let mut durable_id: Option<String> = None;
    let mut last_checkpoint: Option<Instant> = None;
    let mut outcome = StreamOutcome::Complete;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    'drain: loop {
        tokio::select! {
            _ = &mut deadline => {
                return Err(AppError::StreamTimeout { seconds: timeout.as_secs() });
            }
            changed = abort.changed() => {
                if changed.is_err() || *abort.borrow() {
                    outcome = StreamOutcome::Cancelled;
                    break 'drain;
                }
            }
            next = stream.next() => {
                let Some(chunk) = next else { break 'drain };
                let bytes = chunk?;
                for event in parser.feed(&bytes) {
                    match event {
                        SseEvent::Done => break 'drain,
                        SseEvent::Delta(delta) => {
                            content.push_str(&delta);
                            sink.on_delta(temp_id, &delta, &content);

                            let due = last_checkpoint
                                .is_none_or(|at| at.elapsed() >= CHECKPOINT_INTERVAL);
                            if due {
                                sink.checkpoint(durable_id.as_deref(), &content);
                                last_checkpoint = Some(Instant::now());
                            }
                        }
                        SseEvent::MessageId(id) => {
                            if durable_id.is_none() {
                                sink.on_durable_id(temp_id, &id);
                                durable_id = Some(id);
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(StreamResult { content, durable_id, outcome })
}
