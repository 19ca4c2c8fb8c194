//! Completion Backend Integration
//!
//! Abstracted access to the upstream completion API through a common trait.
//! A backend opens one streaming call and yields raw SSE frames; chunk
//! decoding happens in the relay.
//!
//! # Available Backends
//!
//! - **OpenAI-compatible**: OpenAI, Azure OpenAI and compatible gateways
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::backend::{BackendConfig, CompletionBackend, OpenAiBackend};
//!
//! let backend = OpenAiBackend::new(BackendConfig::default())?;
//! let frames = backend.open_stream(&request).await?;
//! ```

mod openai;
mod sse;
mod traits;

pub use openai::OpenAiBackend;
pub use sse::{decode_sse, SseFrameDecoder};
pub use traits::{AuthScheme, BackendConfig, CompletionBackend, FrameStream};
