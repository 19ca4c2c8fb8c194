//! Relay Core - Per-User Streaming Completion Relay
//!
//! This crate relays a token-streaming completion API to many concurrent
//! push clients. Each upstream call belongs to one user; its incremental
//! text is parsed, paced and pushed into that user's output channel, and
//! every delivery failure is classified instead of silently dropped.
//!
//! The crate is transport-agnostic: the HTTP/SSE surface lives in the
//! daemon crate, which subscribes to channels and submits calls.
//!
//! # Architecture
//!
//! ```text
//!   submit(user, input)                              stream(user)
//!          │                                              │
//!          ▼                                              ▼
//! ┌─────────────────┐   get(user)   ┌──────────────┐  get_or_create(user)
//! │  UpstreamRelay  │ ────────────▶ │ SinkRegistry │ ◀──────────────────┐
//! │  (task per call)│               └──────┬───────┘                    │
//! └────────┬────────┘                      │                            │
//!          │ open_stream                   ▼                            │
//!          ▼                      ┌─────────────────┐  FragmentStream   │
//! ┌─────────────────┐   emit      │  OutputChannel  │ ─────────────────▶│
//! │CompletionBackend│ ──frames──▶ │  (per user)     │    delivery loop  │
//! └─────────────────┘  parse/pace └─────────────────┘                   │
//! ```
//!
//! # Key Types
//!
//! - [`UpstreamRelay`]: spawns and drives upstream calls
//! - [`SinkRegistry`]: user → [`OutputChannel`] mapping
//! - [`EmissionOutcome`]: result of every emission attempt
//! - [`CompletionBackend`]: upstream collaborator ([`OpenAiBackend`])
//! - [`RelayMetrics`]: per-kind failure counters
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use relay_core::{
//!     backend::{BackendConfig, OpenAiBackend},
//!     prompt::PromptTemplate,
//!     RelayConfig, SinkRegistry, UpstreamRelay, UserId,
//! };
//!
//! let registry = SinkRegistry::new();
//! let backend = OpenAiBackend::new(BackendConfig::default())?;
//! let relay = UpstreamRelay::new(Arc::new(backend), registry.clone(), RelayConfig::default());
//!
//! let user = UserId::new();
//! let mut fragments = registry.get_or_create(user).subscribe();
//! relay.relay(user, PromptTemplate::default().build("Hello"));
//!
//! while let Some(fragment) = fragments.next().await {
//!     print!("{fragment}");
//! }
//! ```

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod error;
pub mod metrics;
pub mod prompt;
pub mod relay;
pub mod sink;
pub mod user;

// Re-export commonly used types
pub use backend::{BackendConfig, CompletionBackend, FrameStream, OpenAiBackend};
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, RelayConfigFile,
};
pub use error::{ErrorKind, RelayError};
pub use metrics::{CallLatency, MetricsSnapshot, RelayMetrics};
pub use prompt::{ChatMessage, CompletionRequest, MessageRole, PromptTemplate, SamplingParams};
pub use relay::{
    CallId, CallState, ChunkParseError, CompletionDelta, EmissionPacer, EndOfStreamPolicy,
    PacingPolicy, RelayConfig, RelayHandle, RelayReport, UpstreamRelay,
};
pub use sink::{
    EmissionFailure, EmissionOutcome, FragmentStream, OutputChannel, RegistrySummary, SinkRegistry,
    WriterClaim,
};
pub use user::UserId;
