//! Emission pacing
//!
//! The delivery loop drains each channel at a fixed cadence, so a burst of
//! upstream frames can outrun it. The pacer throttles the producer side,
//! either by sleeping a fixed delay per fragment or by waiting for channel
//! capacity.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::sink::{EmissionFailure, EmissionOutcome, OutputChannel};

/// Delay slept before each fragment under the default policy
pub const DEFAULT_PACING_DELAY: Duration = Duration::from_millis(15);

/// Longest a backpressured emit waits for buffer space
pub const DEFAULT_BACKPRESSURE_WAIT: Duration = Duration::from_secs(1);

/// How fragments are throttled on their way into a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PacingPolicy {
    /// Sleep a constant delay before every fragment, then emit without waiting
    FixedDelay {
        /// Delay per fragment
        delay: Duration,
    },
    /// Emit immediately, waiting up to `max_wait` for a full buffer to drain
    Backpressure {
        /// Upper bound on the wait
        max_wait: Duration,
    },
    /// No throttling at all
    Unpaced,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self::FixedDelay {
            delay: DEFAULT_PACING_DELAY,
        }
    }
}

impl PacingPolicy {
    /// Short label for logs
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FixedDelay { .. } => "fixed",
            Self::Backpressure { .. } => "backpressure",
            Self::Unpaced => "none",
        }
    }
}

/// Applies a [`PacingPolicy`] to one call's emissions
#[derive(Debug, Clone, Copy, Default)]
pub struct EmissionPacer {
    policy: PacingPolicy,
}

impl EmissionPacer {
    /// Create a pacer for the given policy
    #[must_use]
    pub fn new(policy: PacingPolicy) -> Self {
        Self { policy }
    }

    /// The active policy
    #[must_use]
    pub fn policy(&self) -> PacingPolicy {
        self.policy
    }

    /// Scoped delay taken once per frame, before emission
    ///
    /// Only the fixed-delay policy sleeps here.
    pub async fn pace(&self) {
        if let PacingPolicy::FixedDelay { delay } = self.policy {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Push one fragment into `channel` according to the policy
    pub async fn emit(
        &self,
        channel: &OutputChannel,
        fragment: String,
        cancel: &CancellationToken,
    ) -> EmissionOutcome {
        if cancel.is_cancelled() {
            return EmissionFailure::Cancelled.into();
        }
        match self.policy {
            PacingPolicy::Backpressure { max_wait } => {
                channel.emit_within(fragment, max_wait, cancel).await
            }
            PacingPolicy::FixedDelay { .. } | PacingPolicy::Unpaced => channel.try_emit(fragment),
        }
    }
}
