//! # Stream Relay
//!
//! Turns an upstream streaming body into the browser's SSE stream.
//!
//! Bytes are buffered until a full record is available (a line for NDJSON, a
//! blank-line-terminated event for SSE); the incomplete tail stays in the
//! buffer for the next read. Splitting happens on raw bytes, so a multi-byte
//! character cut across two reads is reassembled before decoding.
//!
//! Every relayed stream ends with exactly one `data: [DONE]` frame, unless the
//! upstream read fails, in which case the stream ends with an error item and
//! the HTTP body is aborted.

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, Stream, StreamExt};
use std::collections::VecDeque;
use std::fmt::Display;
use tracing::{debug, warn};

use super::core::{chunk_frame, content_chunk, done_frame, StreamingState};
use crate::error::ProxyError;
use crate::schemas::NdjsonRecord;

/// Record framing of an upstream stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamFraming {
    /// One JSON object per line (Ollama).
    NdJson,
    /// Server-Sent Events, forwarded unchanged (OpenAI-compatible servers).
    Sse,
}

impl UpstreamFraming {
    /// Find the end of the first complete record in `buf`.
    ///
    /// Returns the record length and the delimiter length that follows it.
    fn next_boundary(&self, buf: &[u8]) -> Option<(usize, usize)> {
        match self {
            UpstreamFraming::NdJson => buf.iter().position(|&b| b == b'\n').map(|i| (i, 1)),
            UpstreamFraming::Sse => {
                let lf = find(buf, b"\n\n").map(|i| (i, 2));
                let crlf = find(buf, b"\r\n\r\n").map(|i| (i, 4));
                match (lf, crlf) {
                    (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
                    (a, b) => a.or(b),
                }
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

struct Relay<S> {
    upstream: S,
    framing: UpstreamFraming,
    buffer: BytesMut,
    pending: VecDeque<Bytes>,
    state: StreamingState,
    /// Set once the upstream signalled completion or failed.
    closed: bool,
}

impl<S> Relay<S> {
    fn ingest(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        while let Some((len, delim)) = self.framing.next_boundary(&self.buffer) {
            let record = self.buffer.split_to(len + delim).freeze();
            self.handle_record(&record[..len]);
            if self.state.is_finished {
                // Anything after the done marker is not relayed.
                self.buffer.clear();
                break;
            }
        }
    }

    fn handle_record(&mut self, raw: &[u8]) {
        let Ok(text) = std::str::from_utf8(raw) else {
            warn!("skipping stream record that is not valid UTF-8 ({} bytes)", raw.len());
            return;
        };
        let text = text.trim_end_matches('\r');
        if text.trim().is_empty() {
            return;
        }

        match self.framing {
            UpstreamFraming::NdJson => self.handle_ndjson(text),
            UpstreamFraming::Sse => self.handle_sse(text),
        }
    }

    fn handle_ndjson(&mut self, line: &str) {
        let record: NdjsonRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, "skipping malformed stream record");
                return;
            }
        };

        let content = record
            .message
            .and_then(|m| m.content)
            .filter(|c| !c.is_empty());
        if let Some(content) = content {
            let chunk = content_chunk(&mut self.state, content, record.model, record.done);
            match chunk_frame(&chunk) {
                Ok(frame) => self.pending.push_back(frame),
                Err(err) => warn!(error = %err, "failed to encode stream chunk"),
            }
        }

        if record.done {
            self.finish();
        }
    }

    fn handle_sse(&mut self, event: &str) {
        let is_done = event.lines().any(|line| {
            line.strip_prefix("data:")
                .map(|data| data.trim() == "[DONE]")
                .unwrap_or(false)
        });
        if is_done {
            self.finish();
            return;
        }

        let mut frame = String::with_capacity(event.len() + 2);
        for line in event.lines() {
            frame.push_str(line.trim_end_matches('\r'));
            frame.push('\n');
        }
        frame.push('\n');
        self.state.next_index();
        self.pending.push_back(Bytes::from(frame));
    }

    fn finish(&mut self) {
        if !self.state.is_finished {
            self.state.finish();
            self.pending.push_back(done_frame());
        }
        self.closed = true;
    }

    fn end_of_body(&mut self) {
        if !self.buffer.iter().all(u8::is_ascii_whitespace) {
            warn!(
                bytes = self.buffer.len(),
                "discarding unterminated record at end of stream"
            );
        }
        self.buffer.clear();
        self.finish();
    }
}

/// Relay `upstream` as normalized SSE frames.
///
/// `model` names the model in NDJSON chunks whose record carries none.
pub fn relay<S, E>(
    upstream: S,
    framing: UpstreamFraming,
    model: impl Into<String>,
) -> impl Stream<Item = Result<Bytes, ProxyError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    let relay = Relay {
        upstream,
        framing,
        buffer: BytesMut::new(),
        pending: VecDeque::new(),
        state: StreamingState::new(model),
        closed: false,
    };

    stream::unfold(relay, |mut relay| async move {
        loop {
            if let Some(frame) = relay.pending.pop_front() {
                return Some((Ok(frame), relay));
            }
            if relay.closed {
                debug!(
                    id = %relay.state.request_id,
                    chunks = relay.state.chunk_index,
                    "relay finished"
                );
                return None;
            }

            match relay.upstream.next().await {
                Some(Ok(chunk)) => relay.ingest(&chunk),
                Some(Err(err)) => {
                    warn!(error = %err, "upstream stream read failed");
                    relay.closed = true;
                    relay.state.finish();
                    return Some((
                        Err(ProxyError::Upstream(format!("stream interrupted: {}", err))),
                        relay,
                    ));
                }
                None => relay.end_of_body(),
            }
        }
    })
}
