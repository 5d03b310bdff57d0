//! # Streaming Module
//!
//! Server-Sent Events output for relayed chat completions.
//!
//! ## Key Features:
//! - NDJSON (Ollama) records normalized into `chat.completion.chunk` events
//! - SSE (OpenAI-compatible) events forwarded unchanged
//! - Exactly one `data: [DONE]` terminator per successful stream

pub mod core;
pub mod relay;

pub use self::core::{content_chunk, data_frame, done_frame, StreamingState, DONE_FRAME};
pub use self::relay::{relay, UpstreamFraming};
