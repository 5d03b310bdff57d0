//! # Core Streaming Functionality
//!
//! Per-response state and the SSE frames the relay writes to the browser.

use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::schemas::{StreamChoice, StreamChunk, StreamDelta};

/// Terminal frame closing every relayed stream.
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Streaming response state management
#[derive(Debug, Clone)]
pub struct StreamingState {
    /// Identifier shared by every chunk of one response
    pub request_id: String,
    /// Model named in chunks when the upstream record carries none
    pub model: String,
    /// Content chunks emitted so far
    pub chunk_index: usize,
    /// Whether the terminal frame has been produced
    pub is_finished: bool,
}

impl StreamingState {
    pub fn new(model: impl Into<String>) -> Self {
        let suffix: String = std::iter::repeat_with(fastrand::alphanumeric)
            .take(8)
            .collect::<String>()
            .to_ascii_lowercase();
        Self {
            request_id: format!("chatcmpl-{}", suffix),
            model: model.into(),
            chunk_index: 0,
            is_finished: false,
        }
    }

    /// Get the next chunk index and increment
    pub fn next_index(&mut self) -> usize {
        let index = self.chunk_index;
        self.chunk_index += 1;
        index
    }

    pub fn finish(&mut self) {
        self.is_finished = true;
    }
}

/// Build one normalized content chunk.
///
/// `finished` marks the chunk that carried the upstream done flag.
pub fn content_chunk(
    state: &mut StreamingState,
    content: String,
    model: Option<String>,
    finished: bool,
) -> StreamChunk {
    state.next_index();
    StreamChunk {
        id: state.request_id.clone(),
        object: "chat.completion.chunk".to_string(),
        created: current_timestamp(),
        model: model.unwrap_or_else(|| state.model.clone()),
        choices: vec![StreamChoice {
            index: 0,
            delta: StreamDelta {
                role: None,
                content: Some(content),
            },
            finish_reason: finished.then(|| "stop".to_string()),
        }],
    }
}

/// Frame a chunk as a single SSE `data:` event.
pub fn chunk_frame(chunk: &StreamChunk) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_string(chunk)?;
    Ok(data_frame(&json))
}

/// `data: <payload>\n\n`
pub fn data_frame(payload: &str) -> Bytes {
    let mut frame = String::with_capacity(payload.len() + 8);
    frame.push_str("data: ");
    frame.push_str(payload);
    frame.push_str("\n\n");
    Bytes::from(frame)
}

pub fn done_frame() -> Bytes {
    Bytes::from_static(DONE_FRAME)
}

/// Get current timestamp
fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_state_creation() {
        let state = StreamingState::new("qwen2.5");
        assert_eq!(state.model, "qwen2.5");
        assert_eq!(state.chunk_index, 0);
        assert!(!state.is_finished);
        assert!(state.request_id.starts_with("chatcmpl-"));
        assert_eq!(state.request_id.len(), "chatcmpl-".len() + 8);
    }

    #[test]
    fn test_content_chunk_uses_record_model() {
        let mut state = StreamingState::new("fallback");
        let chunk = content_chunk(&mut state, "Hi".into(), Some("llama3".into()), false);
        assert_eq!(chunk.model, "llama3");
        assert_eq!(chunk.choices[0].finish_reason, None);
        assert_eq!(state.chunk_index, 1);

        let last = content_chunk(&mut state, "!".into(), None, true);
        assert_eq!(last.model, "fallback");
        assert_eq!(last.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(last.id, chunk.id);
    }

    #[test]
    fn test_frames() {
        assert_eq!(&data_frame("{}")[..], b"data: {}\n\n");
        assert_eq!(&done_frame()[..], b"data: [DONE]\n\n");

        let mut state = StreamingState::new("m");
        let frame = chunk_frame(&content_chunk(&mut state, "x".into(), None, false)).unwrap();
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("data: {"));
        assert!(text.ends_with("}\n\n"));
        assert!(text.contains("\"object\":\"chat.completion.chunk\""));
    }
}
