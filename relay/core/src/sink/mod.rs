//! Output sinks
//!
//! Where relayed fragments go. Each user owns one [`OutputChannel`]; the
//! [`SinkRegistry`] hands channels out to the relay (writer side) and to the
//! delivery endpoint (subscriber side).
//!
//! ```text
//!   UpstreamRelay ──try_emit──▶ OutputChannel ──FragmentStream──▶ SSE client
//!                                     ▲
//!                 SinkRegistry ───────┘ get_or_create / get / remove
//! ```
//!
//! Every emission returns an [`EmissionOutcome`]. Failures are classified so
//! callers can tell overflow, contention, absence of listeners, teardown and
//! cancellation apart.

mod channel;
mod outcome;
mod registry;

pub use channel::{FragmentStream, OutputChannel, WriterClaim, DEFAULT_CHANNEL_CAPACITY};
pub use outcome::{EmissionFailure, EmissionOutcome};
pub use registry::{RegistrySummary, SinkRegistry};
