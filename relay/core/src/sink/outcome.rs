//! Emission outcomes
//!
//! The result of pushing one fragment into an [`OutputChannel`](super::OutputChannel).
//! Produced for every attempt; callers must classify it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

/// Why a fragment did not reach any subscriber
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum EmissionFailure {
    /// Every live subscriber's buffer was full
    #[error("channel buffer full")]
    Overflow,
    /// Another writer was emitting into the same channel
    #[error("concurrent writer on channel")]
    NonSerialized,
    /// Nobody is listening
    #[error("channel has no subscribers")]
    ZeroSubscriber,
    /// The channel was torn down
    #[error("channel terminated")]
    Terminated,
    /// The emitting call was cancelled
    #[error("emission cancelled")]
    Cancelled,
}

impl EmissionFailure {
    /// Relay error kind for this failure
    #[must_use]
    pub fn kind(self) -> ErrorKind {
        match self {
            Self::Overflow => ErrorKind::EmissionOverflow,
            Self::NonSerialized => ErrorKind::EmissionNonSerialized,
            Self::ZeroSubscriber => ErrorKind::EmissionZeroSubscriber,
            Self::Terminated => ErrorKind::EmissionTerminated,
            Self::Cancelled => ErrorKind::EmissionCancelled,
        }
    }
}

/// Result of one emission attempt
#[must_use = "every emission outcome must be classified"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmissionOutcome {
    /// At least one subscriber received the fragment
    Emitted,
    /// No subscriber received the fragment
    Failed(EmissionFailure),
}

impl EmissionOutcome {
    /// Whether the fragment reached a subscriber
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Emitted)
    }

    /// The failure, if any
    #[must_use]
    pub fn failure(&self) -> Option<EmissionFailure> {
        match self {
            Self::Emitted => None,
            Self::Failed(failure) => Some(*failure),
        }
    }

    /// Short label for logging
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Emitted => "emitted",
            Self::Failed(failure) => failure.kind().as_str(),
        }
    }
}

impl From<EmissionFailure> for EmissionOutcome {
    fn from(failure: EmissionFailure) -> Self {
        Self::Failed(failure)
    }
}

impl fmt::Display for EmissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
