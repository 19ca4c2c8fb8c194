//! Relay Error Taxonomy
//!
//! Every failure the relay can observe while driving one upstream call.
//! None of these escape the per-call task: they are logged with a stable
//! `kind` label and counted in [`RelayMetrics`](crate::metrics::RelayMetrics),
//! so an overflow is never mistaken for a generic failure.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::relay::ChunkParseError;
use crate::sink::EmissionFailure;
use crate::user::UserId;

/// Errors raised while relaying one upstream call
#[derive(Debug, Error)]
pub enum RelayError {
    /// The upstream call could not be opened or the connection dropped
    #[error("upstream connection failed: {0}")]
    UpstreamConnection(String),

    /// The upstream answered with a non-success status
    #[error("upstream returned {status}: {body}")]
    UpstreamStatus {
        /// HTTP status code
        status: u16,
        /// Response body (may be empty)
        body: String,
    },

    /// No frame arrived within the idle limit
    #[error("no upstream frame received within {0:?}")]
    UpstreamTimeout(Duration),

    /// One frame could not be decoded
    #[error("failed to parse upstream frame: {0}")]
    FrameParse(#[from] ChunkParseError),

    /// A fragment could not be pushed into the user's channel
    #[error("emission failed: {0}")]
    Emission(#[from] EmissionFailure),

    /// No channel is registered for the user at emission time
    #[error("no output channel registered for user {0}")]
    UnknownUser(UserId),
}

impl RelayError {
    /// Stable classification of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UpstreamConnection(_) => ErrorKind::UpstreamConnection,
            Self::UpstreamStatus { .. } => ErrorKind::UpstreamStatus,
            Self::UpstreamTimeout(_) => ErrorKind::UpstreamTimeout,
            Self::FrameParse(_) => ErrorKind::FrameParse,
            Self::Emission(failure) => failure.kind(),
            Self::UnknownUser(_) => ErrorKind::UnknownUser,
        }
    }

    /// Whether this error ends the upstream call
    #[must_use]
    pub fn is_fatal_to_call(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::UpstreamConnection | ErrorKind::UpstreamStatus | ErrorKind::UpstreamTimeout
        )
    }
}

/// Classification label for relay errors
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection to the completion API failed
    UpstreamConnection,
    /// Completion API returned a non-success status
    UpstreamStatus,
    /// Completion API went quiet for too long
    UpstreamTimeout,
    /// A frame was malformed
    FrameParse,
    /// The channel buffer was full for every subscriber
    EmissionOverflow,
    /// Another writer was emitting into the channel concurrently
    EmissionNonSerialized,
    /// The channel had no live subscriber
    EmissionZeroSubscriber,
    /// The channel was torn down
    EmissionTerminated,
    /// The call was cancelled before the fragment was delivered
    EmissionCancelled,
    /// The user had no channel at all
    UnknownUser,
}

impl ErrorKind {
    /// Number of distinct kinds
    pub const COUNT: usize = 10;

    /// All kinds, in counter order
    pub const ALL: [ErrorKind; Self::COUNT] = [
        Self::UpstreamConnection,
        Self::UpstreamStatus,
        Self::UpstreamTimeout,
        Self::FrameParse,
        Self::EmissionOverflow,
        Self::EmissionNonSerialized,
        Self::EmissionZeroSubscriber,
        Self::EmissionTerminated,
        Self::EmissionCancelled,
        Self::UnknownUser,
    ];

    /// Snake-case label used in logs and metrics
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpstreamConnection => "upstream_connection",
            Self::UpstreamStatus => "upstream_status",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::FrameParse => "frame_parse",
            Self::EmissionOverflow => "emission_overflow",
            Self::EmissionNonSerialized => "emission_non_serialized",
            Self::EmissionZeroSubscriber => "emission_zero_subscriber",
            Self::EmissionTerminated => "emission_terminated",
            Self::EmissionCancelled => "emission_cancelled",
            Self::UnknownUser => "unknown_user",
        }
    }

    /// Position of this kind in [`ErrorKind::ALL`]
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
