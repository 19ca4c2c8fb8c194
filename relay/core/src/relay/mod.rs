//! Streaming relay
//!
//! - [`chunk`]: decode one upstream frame into a [`CompletionDelta`]
//! - [`pacer`]: throttle emissions so a channel drained at a fixed cadence
//!   is not overrun
//! - [`upstream`]: drive one upstream call into a user's output channel

pub mod chunk;
pub mod pacer;
pub mod upstream;

pub use chunk::{
    is_sentinel, parse_frame, ChatCompletionChunk, ChunkChoice, ChunkDelta, ChunkParseError,
    CompletionDelta, DONE_SENTINEL, TERMINAL_FINISH_REASON,
};
pub use pacer::{EmissionPacer, PacingPolicy, DEFAULT_BACKPRESSURE_WAIT, DEFAULT_PACING_DELAY};
pub use upstream::{
    CallId, CallState, EmissionTally, EndOfStreamPolicy, RelayConfig, RelayHandle, RelayReport,
    UpstreamRelay, DEFAULT_FRAME_IDLE_TIMEOUT,
};
