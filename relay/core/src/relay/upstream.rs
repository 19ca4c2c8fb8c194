//! Upstream Relay - one streaming call, end to end
//!
//! Drives a single upstream completion call for one user: frames are read in
//! arrival order, paced, parsed and pushed into the user's output channel.
//! Every failure is classified and counted; none of them escape the call's
//! task.
//!
//! ```text
//!   submit(user, request)
//!          │  spawn (child of shutdown token)
//!          ▼
//!   ┌──────────────┐  frames   ┌───────┐  delta  ┌───────────┐  emit  ┌───────────────┐
//!   │ backend call │ ────────▶ │ pace  │ ──────▶ │ parse     │ ─────▶ │ OutputChannel │
//!   └──────────────┘           └───────┘         └───────────┘        └───────────────┘
//!
//!   Open ──▶ Receiving ──▶ { Done | UpstreamError | Cancelled }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::Serialize;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::chunk::{is_sentinel, parse_frame};
use super::pacer::{EmissionPacer, PacingPolicy};
use crate::backend::{CompletionBackend, FrameStream};
use crate::error::{ErrorKind, RelayError};
use crate::metrics::RelayMetrics;
use crate::prompt::{ChatMessage, CompletionRequest, SamplingParams};
use crate::sink::{EmissionFailure, EmissionOutcome, OutputChannel, SinkRegistry, WriterClaim};
use crate::user::UserId;

/// Longest silence tolerated between two upstream frames by default
pub const DEFAULT_FRAME_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

// ============================================================================
// Identifiers and configuration
// ============================================================================

/// Process-unique identifier of one relayed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    /// Allocate a new unique call ID
    #[must_use]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// What happens when the upstream signals the end of the completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EndOfStreamPolicy {
    /// Emit nothing; the client stream just goes quiet
    #[default]
    Suppress,
    /// Emit `marker` once after the sentinel or an upstream failure
    Forward {
        /// Fragment sent to the client
        marker: String,
    },
}

/// Behaviour shared by every call of one relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Emission throttling
    pub pacing: PacingPolicy,
    /// End-of-stream signalling
    pub end_of_stream: EndOfStreamPolicy,
    /// Fail the call when no frame arrives for this long (`None` waits forever)
    pub frame_idle_timeout: Option<Duration>,
    /// Cancel the call once nobody has received a fragment for this long
    /// (`None` keeps relaying into the void)
    pub zero_subscriber_grace: Option<Duration>,
    /// Sampling knobs for requests built by [`UpstreamRelay::relay`]
    pub sampling: SamplingParams,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            pacing: PacingPolicy::default(),
            end_of_stream: EndOfStreamPolicy::Suppress,
            frame_idle_timeout: Some(DEFAULT_FRAME_IDLE_TIMEOUT),
            zero_subscriber_grace: None,
            sampling: SamplingParams::default(),
        }
    }
}

// ============================================================================
// Call state and reporting
// ============================================================================

/// Lifecycle of one call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Waiting for the upstream to answer
    Open,
    /// Frames are flowing
    Receiving,
    /// Sentinel seen or stream ended cleanly
    Done,
    /// Connection, status or idle-timeout failure
    UpstreamError,
    /// Cancelled by the handle, shutdown or the zero-subscriber grace
    Cancelled,
}

impl CallState {
    /// Whether the call has ended
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Done | Self::UpstreamError | Self::Cancelled)
    }

    /// Label for logs
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Receiving => "receiving",
            Self::Done => "done",
            Self::UpstreamError => "upstream_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failed emissions of one call, by class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmissionTally {
    /// Every subscriber buffer was full
    pub overflow: u64,
    /// Another writer held the channel
    pub non_serialized: u64,
    /// Nobody was subscribed
    pub zero_subscriber: u64,
    /// The channel had been torn down
    pub terminated: u64,
    /// The call was cancelled mid-emission
    pub cancelled: u64,
    /// The user had no channel
    pub unknown_user: u64,
}

impl EmissionTally {
    /// Count one failed emission
    pub fn record(&mut self, failure: EmissionFailure) {
        match failure {
            EmissionFailure::Overflow => self.overflow += 1,
            EmissionFailure::NonSerialized => self.non_serialized += 1,
            EmissionFailure::ZeroSubscriber => self.zero_subscriber += 1,
            EmissionFailure::Terminated => self.terminated += 1,
            EmissionFailure::Cancelled => self.cancelled += 1,
        }
    }

    /// All failed emissions
    #[must_use]
    pub fn total(&self) -> u64 {
        self.overflow
            + self.non_serialized
            + self.zero_subscriber
            + self.terminated
            + self.cancelled
            + self.unknown_user
    }
}

/// Summary of a finished call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayReport {
    /// Call identifier
    pub call_id: CallId,
    /// Destination user
    pub user_id: UserId,
    /// Final state
    pub state: CallState,
    /// Frames read from the upstream (sentinel included)
    pub frames_received: u64,
    /// Fragments that reached at least one subscriber
    pub fragments_emitted: u64,
    /// Frames dropped because they could not be parsed
    pub parse_failures: u64,
    /// Failed emissions by class
    pub emission_failures: EmissionTally,
    /// Wall-clock time from spawn to finish
    pub duration: Duration,
}

/// Handle to a spawned call
#[derive(Debug)]
pub struct RelayHandle {
    call_id: CallId,
    user_id: UserId,
    cancel: CancellationToken,
    join: JoinHandle<RelayReport>,
}

impl RelayHandle {
    /// Call identifier
    #[must_use]
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Destination user
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Request cancellation; the call stops at its next suspension point
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the call's task has ended
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the call to finish
    ///
    /// # Errors
    ///
    /// Returns the join error if the task panicked or was aborted.
    pub async fn join(self) -> Result<RelayReport, JoinError> {
        self.join.await
    }
}

// ============================================================================
// Relay
// ============================================================================

/// Spawns and drives upstream calls into per-user channels
#[derive(Clone)]
pub struct UpstreamRelay {
    backend: Arc<dyn CompletionBackend>,
    registry: SinkRegistry,
    pacer: EmissionPacer,
    config: Arc<RelayConfig>,
    metrics: Arc<RelayMetrics>,
    shutdown: CancellationToken,
}

impl fmt::Debug for UpstreamRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamRelay")
            .field("backend", &self.backend.name())
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Mutable bookkeeping of one running call
struct CallProgress {
    call_id: CallId,
    user_id: UserId,
    state: CallState,
    frames_received: u64,
    fragments_emitted: u64,
    parse_failures: u64,
    tally: EmissionTally,
    /// Since when no fragment has reached anyone
    silent_since: Option<Instant>,
    /// Exclusive write access to the user's current channel
    claim: Option<WriterClaim>,
}

impl CallProgress {
    fn new(call_id: CallId, user_id: UserId) -> Self {
        Self {
            call_id,
            user_id,
            state: CallState::Open,
            frames_received: 0,
            fragments_emitted: 0,
            parse_failures: 0,
            tally: EmissionTally::default(),
            silent_since: None,
            claim: None,
        }
    }

    /// Hold the writer claim on `channel`, taking it over on first use
    fn claim(&mut self, channel: &Arc<OutputChannel>) -> bool {
        if self.claim.as_ref().is_some_and(|claim| claim.covers(channel)) {
            return true;
        }
        // A replaced channel releases the claim on the old one
        self.claim = channel.claim_writer(self.call_id);
        self.claim.is_some()
    }

    fn mark_silent(&mut self) {
        self.silent_since.get_or_insert_with(Instant::now);
    }

    fn into_report(self, duration: Duration) -> RelayReport {
        RelayReport {
            call_id: self.call_id,
            user_id: self.user_id,
            state: self.state,
            frames_received: self.frames_received,
            fragments_emitted: self.fragments_emitted,
            parse_failures: self.parse_failures,
            emission_failures: self.tally,
            duration,
        }
    }
}

impl UpstreamRelay {
    /// Create a relay writing into `registry`
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        registry: SinkRegistry,
        config: RelayConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            pacer: EmissionPacer::new(config.pacing),
            config: Arc::new(config),
            metrics: Arc::new(RelayMetrics::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Share an existing metrics instance
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Metrics updated by every call
    #[must_use]
    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Registry the relay emits into
    #[must_use]
    pub fn registry(&self) -> &SinkRegistry {
        &self.registry
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Fire-and-forget: relay a completion of `messages` to `user_id`
    pub fn relay(&self, user_id: UserId, messages: Vec<ChatMessage>) -> RelayHandle {
        let request = CompletionRequest::streaming(messages, &self.config.sampling);
        self.submit(user_id, request)
    }

    /// Spawn a call for a prepared request
    pub fn submit(&self, user_id: UserId, request: CompletionRequest) -> RelayHandle {
        let call_id = CallId::new();
        let cancel = self.shutdown.child_token();
        self.metrics.record_call_started();

        let relay = self.clone();
        let token = cancel.clone();
        let span = tracing::info_span!("relay_call", call_id = %call_id, user_id = %user_id);
        let join = tokio::spawn(
            async move { relay.run(call_id, user_id, request, token).await }.instrument(span),
        );

        RelayHandle {
            call_id,
            user_id,
            cancel,
            join,
        }
    }

    /// Drive one call to completion on the current task
    pub async fn run(
        &self,
        call_id: CallId,
        user_id: UserId,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> RelayReport {
        let started = Instant::now();
        let mut progress = CallProgress::new(call_id, user_id);

        tracing::info!(
            backend = self.backend.name(),
            messages = request.messages.len(),
            pacing = self.pacer.policy().as_str(),
            "Relay call opened"
        );

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = self.backend.open_stream(&request) => Some(result),
        };

        progress.state = match opened {
            None => CallState::Cancelled,
            Some(Err(e)) => {
                self.report_error(&e);
                CallState::UpstreamError
            }
            Some(Ok(frames)) => self.pump(frames, &mut progress, &cancel).await,
        };

        if let EndOfStreamPolicy::Forward { marker } = &self.config.end_of_stream {
            if matches!(progress.state, CallState::Done | CallState::UpstreamError) {
                self.deliver(&mut progress, marker.clone(), &cancel).await;
            }
        }

        let duration = started.elapsed();
        self.metrics.record_call_finished(progress.state, duration);
        let report = progress.into_report(duration);

        tracing::info!(
            state = %report.state,
            frames = report.frames_received,
            emitted = report.fragments_emitted,
            parse_failures = report.parse_failures,
            overflow = report.emission_failures.overflow,
            non_serialized = report.emission_failures.non_serialized,
            zero_subscriber = report.emission_failures.zero_subscriber,
            terminated = report.emission_failures.terminated,
            cancelled = report.emission_failures.cancelled,
            unknown_user = report.emission_failures.unknown_user,
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "Relay call finished"
        );
        report
    }

    /// Cancel every in-flight call
    pub fn shutdown(&self) {
        tracing::info!("Cancelling in-flight relay calls");
        self.shutdown.cancel();
    }

    /// Whether [`UpstreamRelay::shutdown`] has been called
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Per-frame loop; returns the final state
    async fn pump(
        &self,
        mut frames: FrameStream,
        progress: &mut CallProgress,
        cancel: &CancellationToken,
    ) -> CallState {
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return CallState::Cancelled,
                next = self.next_frame(&mut frames) => next,
            };

            let raw = match next {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    tracing::debug!("Upstream stream ended without sentinel");
                    return CallState::Done;
                }
                Err(e) => {
                    self.report_error(&e);
                    return CallState::UpstreamError;
                }
            };

            progress.state = CallState::Receiving;
            progress.frames_received += 1;
            self.metrics.record_frame();
            tracing::trace!(frame = %raw, "Upstream frame");

            tokio::select! {
                biased;
                () = cancel.cancelled() => return CallState::Cancelled,
                () = self.pacer.pace() => {}
            }

            if is_sentinel(&raw) {
                tracing::debug!("Sentinel received");
                return CallState::Done;
            }

            let delta = match parse_frame(&raw) {
                Ok(delta) => delta,
                Err(e) => {
                    progress.parse_failures += 1;
                    tracing::debug!(frame = %raw, "Dropping unparseable frame");
                    self.report_error(&e.into());
                    continue;
                }
            };

            if delta.is_terminal() {
                tracing::debug!(finish_reason = ?delta.finish_reason, "Terminal delta");
                continue;
            }

            // Absent content still emits: an empty fragment is a heartbeat
            let fragment = delta.content.unwrap_or_default();
            self.deliver(progress, fragment, cancel).await;

            if self.grace_exceeded(progress) {
                tracing::warn!(
                    kind = %ErrorKind::EmissionZeroSubscriber,
                    "Nobody listening past grace period, cancelling call"
                );
                cancel.cancel();
                return CallState::Cancelled;
            }
        }
    }

    async fn next_frame(&self, frames: &mut FrameStream) -> Result<Option<String>, RelayError> {
        match self.config.frame_idle_timeout {
            Some(limit) => tokio::time::timeout(limit, frames.next())
                .await
                .map_err(|_| RelayError::UpstreamTimeout(limit))?
                .transpose(),
            None => frames.next().await.transpose(),
        }
    }

    /// Emit one fragment to the user's channel and classify the outcome
    async fn deliver(
        &self,
        progress: &mut CallProgress,
        fragment: String,
        cancel: &CancellationToken,
    ) {
        let Some(channel) = self.registry.get(&progress.user_id) else {
            progress.tally.unknown_user += 1;
            progress.mark_silent();
            self.report_error(&RelayError::UnknownUser(progress.user_id));
            return;
        };

        let outcome = if progress.claim(&channel) {
            self.pacer.emit(&channel, fragment, cancel).await
        } else {
            EmissionOutcome::from(EmissionFailure::NonSerialized)
        };
        self.metrics.record_outcome(outcome);

        match outcome.failure() {
            None => {
                progress.fragments_emitted += 1;
                progress.silent_since = None;
            }
            Some(failure) => {
                progress.tally.record(failure);
                if matches!(
                    failure,
                    EmissionFailure::ZeroSubscriber | EmissionFailure::Terminated
                ) {
                    progress.mark_silent();
                }
                log_error(&RelayError::Emission(failure));
            }
        }
    }

    fn grace_exceeded(&self, progress: &CallProgress) -> bool {
        match (self.config.zero_subscriber_grace, progress.silent_since) {
            (Some(grace), Some(since)) => since.elapsed() >= grace,
            _ => false,
        }
    }

    /// Log and count an error that did not come from an emission outcome
    fn report_error(&self, err: &RelayError) {
        self.metrics.record_error(err.kind());
        log_error(err);
    }
}

fn log_error(err: &RelayError) {
    let kind = err.kind();
    if err.is_fatal_to_call() {
        tracing::error!(kind = %kind, error = %err, "Upstream call failed");
        return;
    }
    match kind {
        ErrorKind::EmissionZeroSubscriber | ErrorKind::EmissionCancelled => {
            tracing::debug!(kind = %kind, error = %err, "Fragment not delivered");
        }
        ErrorKind::FrameParse => {
            tracing::warn!(kind = %kind, error = %err, "Frame dropped");
        }
        _ => {
            tracing::warn!(kind = %kind, error = %err, "Fragment not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FailingBackend;

    #[async_trait]
    impl CompletionBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        async fn open_stream(
            &self,
            _request: &CompletionRequest,
        ) -> Result<FrameStream, RelayError> {
            Err(RelayError::UpstreamStatus {
                status: 503,
                body: "busy".to_string(),
            })
        }
    }

    struct HangingBackend;

    #[async_trait]
    impl CompletionBackend for HangingBackend {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn open_stream(
            &self,
            _request: &CompletionRequest,
        ) -> Result<FrameStream, RelayError> {
            Ok(futures::stream::pending::<Result<String, RelayError>>().boxed())
        }
    }

    fn relay_with(backend: impl CompletionBackend + 'static, config: RelayConfig) -> UpstreamRelay {
        UpstreamRelay::new(Arc::new(backend), SinkRegistry::new(), config)
    }

    #[test]
    fn test_call_id_display_and_uniqueness() {
        let a = CallId::new();
        let b = CallId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), format!("call-{}", a.as_u64()));
    }

    #[test]
    fn test_call_state_finality() {
        assert!(!CallState::Open.is_final());
        assert!(!CallState::Receiving.is_final());
        assert!(CallState::Done.is_final());
        assert!(CallState::UpstreamError.is_final());
        assert!(CallState::Cancelled.is_final());
    }

    #[test]
    fn test_tally_counts_each_class() {
        let mut tally = EmissionTally::default();
        tally.record(EmissionFailure::Overflow);
        tally.record(EmissionFailure::Overflow);
        tally.record(EmissionFailure::Terminated);
        tally.unknown_user += 1;

        assert_eq!(tally.overflow, 2);
        assert_eq!(tally.terminated, 1);
        assert_eq!(tally.total(), 4);
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.end_of_stream, EndOfStreamPolicy::Suppress);
        assert_eq!(config.frame_idle_timeout, Some(DEFAULT_FRAME_IDLE_TIMEOUT));
        assert_eq!(config.zero_subscriber_grace, None);
    }

    #[tokio::test]
    async fn test_upstream_failure_ends_call() {
        let relay = relay_with(FailingBackend, RelayConfig::default());
        let report = relay
            .relay(UserId::new(), vec![ChatMessage::user("hi")])
            .join()
            .await
            .unwrap();

        assert_eq!(report.state, CallState::UpstreamError);
        assert_eq!(report.frames_received, 0);
        assert_eq!(relay.metrics().error_count(ErrorKind::UpstreamStatus), 1);
        assert_eq!(relay.metrics().snapshot().calls_failed, 1);
    }

    #[tokio::test]
    async fn test_failure_forwards_end_marker_when_configured() {
        let config = RelayConfig {
            end_of_stream: EndOfStreamPolicy::Forward {
                marker: "[END]".to_string(),
            },
            ..RelayConfig::default()
        };
        let relay = relay_with(FailingBackend, config);
        let user = UserId::new();
        let mut stream = relay.registry().get_or_create(user).subscribe();

        let report = relay.relay(user, Vec::new()).join().await.unwrap();
        assert_eq!(report.fragments_emitted, 1);
        assert_eq!(stream.next().await.as_deref(), Some("[END]"));
    }

    #[tokio::test]
    async fn test_handle_cancel_stops_silent_upstream() {
        let config = RelayConfig {
            frame_idle_timeout: None,
            ..RelayConfig::default()
        };
        let relay = relay_with(HangingBackend, config);
        let handle = relay.relay(UserId::new(), Vec::new());
        assert!(!handle.is_finished());

        handle.cancel();
        let report = handle.join().await.unwrap();
        assert_eq!(report.state, CallState::Cancelled);
    }

    #[tokio::test]
    async fn test_idle_timeout_is_upstream_error() {
        let config = RelayConfig {
            frame_idle_timeout: Some(Duration::from_millis(20)),
            ..RelayConfig::default()
        };
        let relay = relay_with(HangingBackend, config);
        let report = relay.relay(UserId::new(), Vec::new()).join().await.unwrap();

        assert_eq!(report.state, CallState::UpstreamError);
        assert_eq!(relay.metrics().error_count(ErrorKind::UpstreamTimeout), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_calls() {
        let config = RelayConfig {
            frame_idle_timeout: None,
            ..RelayConfig::default()
        };
        let relay = relay_with(HangingBackend, config);
        let first = relay.relay(UserId::new(), Vec::new());
        let second = relay.relay(UserId::new(), Vec::new());

        relay.shutdown();
        assert!(relay.is_shut_down());
        assert_eq!(first.join().await.unwrap().state, CallState::Cancelled);
        assert_eq!(second.join().await.unwrap().state, CallState::Cancelled);
    }
}
