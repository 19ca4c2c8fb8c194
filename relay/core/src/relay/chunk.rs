//! Chunk parsing
//!
//! Decodes one upstream frame (one SSE `data:` payload) into a
//! [`CompletionDelta`]. Stateless; frame boundaries are resolved earlier by
//! the backend's SSE decoder.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Literal frame that ends an upstream stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// Finish reason marking the last content-bearing chunk
pub const TERMINAL_FINISH_REASON: &str = "stop";

/// One streamed chunk of a chat completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    /// Completion ID (shared by every chunk of one call)
    #[serde(default)]
    pub id: Option<String>,
    /// Object type, normally `chat.completion.chunk`
    #[serde(default)]
    pub object: Option<String>,
    /// Unix timestamp
    #[serde(default)]
    pub created: Option<i64>,
    /// Model that produced the chunk
    #[serde(default)]
    pub model: Option<String>,
    /// Choices; only the first is used
    pub choices: Vec<ChunkChoice>,
    /// Token usage, when the upstream reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<serde_json::Value>,
}

/// One choice within a chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// Choice index
    #[serde(default)]
    pub index: u32,
    /// Incremental message content
    #[serde(default)]
    pub delta: Option<ChunkDelta>,
    /// Why generation stopped, if it did
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Incremental message content
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    /// Role, only present on the first chunk
    #[serde(default)]
    pub role: Option<String>,
    /// Text fragment
    #[serde(default)]
    pub content: Option<String>,
}

/// Why a frame could not be decoded
#[derive(Debug, Error)]
pub enum ChunkParseError {
    /// Not a valid chunk object
    #[error("malformed chunk: {0}")]
    Json(#[from] serde_json::Error),

    /// The chunk carried no choices
    #[error("chunk has no choices")]
    NoChoices,
}

/// Parsed result of one frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionDelta {
    /// Text fragment; `None` when the chunk carried no content
    pub content: Option<String>,
    /// Set only when the finish reason is terminal
    pub finish_reason: Option<String>,
    /// The frame was the termination sentinel
    pub end_of_stream: bool,
}

impl CompletionDelta {
    /// Delta for the termination sentinel
    #[must_use]
    pub fn end_of_stream() -> Self {
        Self {
            end_of_stream: true,
            ..Self::default()
        }
    }

    /// Whether this delta ends the content of the call
    ///
    /// Terminal deltas never produce an emitted fragment.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.end_of_stream || self.finish_reason.as_deref() == Some(TERMINAL_FINISH_REASON)
    }
}

/// Whether a raw frame is the termination sentinel
#[must_use]
pub fn is_sentinel(raw: &str) -> bool {
    raw.trim() == DONE_SENTINEL
}

/// Decode one raw frame
///
/// # Errors
///
/// Returns [`ChunkParseError`] when the frame is not a chunk object or has an
/// empty `choices` list.
pub fn parse_frame(raw: &str) -> Result<CompletionDelta, ChunkParseError> {
    if is_sentinel(raw) {
        return Ok(CompletionDelta::end_of_stream());
    }

    let chunk: ChatCompletionChunk = serde_json::from_str(raw.trim())?;
    let choice = chunk
        .choices
        .into_iter()
        .next()
        .ok_or(ChunkParseError::NoChoices)?;

    if choice.finish_reason.as_deref() == Some(TERMINAL_FINISH_REASON) {
        return Ok(CompletionDelta {
            content: None,
            finish_reason: choice.finish_reason,
            end_of_stream: false,
        });
    }

    Ok(CompletionDelta {
        content: choice.delta.and_then(|d| d.content),
        finish_reason: None,
        end_of_stream: false,
    })
}
