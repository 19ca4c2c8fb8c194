//! Relay Metrics
//!
//! Lock-free counters for every relayed call:
//! - Call lifecycle (started, completed, failed, cancelled)
//! - Frame and fragment throughput
//! - One counter per [`ErrorKind`], so each failure class stays visible
//! - Call duration distribution

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::ErrorKind;
use crate::relay::CallState;
use crate::sink::EmissionOutcome;

// ============================================================================
// Histogram
// ============================================================================

/// Bucketed distribution of millisecond durations
#[derive(Debug)]
pub struct DurationHistogram {
    /// Upper bound of each bucket, in milliseconds
    buckets: Vec<u64>,
    counts: Vec<AtomicU64>,
    total: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Default for DurationHistogram {
    fn default() -> Self {
        Self::new(vec![
            100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000, 120_000, 300_000,
        ])
    }
}

impl DurationHistogram {
    /// Create a histogram with the given bucket bounds (milliseconds, ascending)
    #[must_use]
    pub fn new(buckets: Vec<u64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Record one duration
    pub fn record(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let idx = self
            .buckets
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(self.buckets.len().saturating_sub(1));

        if let Some(count) = self.counts.get(idx) {
            count.fetch_add(1, Ordering::Relaxed);
        }
        self.total.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.min.fetch_min(ms, Ordering::Relaxed);
        self.max.fetch_max(ms, Ordering::Relaxed);
    }

    /// Point-in-time copy
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts: self
                .counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            total,
            sum: self.sum.load(Ordering::Relaxed),
            min: if total == 0 { 0 } else { min },
            max: self.max.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a [`DurationHistogram`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistogramSnapshot {
    /// Bucket upper bounds (ms)
    pub buckets: Vec<u64>,
    /// Count per bucket
    pub counts: Vec<u64>,
    /// Number of samples
    pub total: u64,
    /// Sum of samples (ms)
    pub sum: u64,
    /// Smallest sample (ms)
    pub min: u64,
    /// Largest sample (ms)
    pub max: u64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket holding the `p` quantile (0.0..=1.0)
    #[must_use]
    pub fn percentile(&self, p: f64) -> u64 {
        if self.total == 0 {
            return 0;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let target = ((self.total as f64) * p.clamp(0.0, 1.0)).ceil() as u64;

        let mut cumulative = 0;
        for (bound, count) in self.buckets.iter().zip(&self.counts) {
            cumulative += count;
            if cumulative >= target.max(1) {
                return *bound;
            }
        }
        self.buckets.last().copied().unwrap_or(0)
    }

    /// Mean sample (ms)
    #[must_use]
    pub fn mean(&self) -> u64 {
        self.sum.checked_div(self.total).unwrap_or(0)
    }
}

// ============================================================================
// Relay Metrics
// ============================================================================

/// Counters shared by every relayed call
#[derive(Debug)]
pub struct RelayMetrics {
    started_at: Instant,
    calls_started: AtomicU64,
    calls_completed: AtomicU64,
    calls_failed: AtomicU64,
    calls_cancelled: AtomicU64,
    frames_received: AtomicU64,
    fragments_emitted: AtomicU64,
    errors: [AtomicU64; ErrorKind::COUNT],
    call_duration: DurationHistogram,
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayMetrics {
    /// Zeroed metrics
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            calls_started: AtomicU64::new(0),
            calls_completed: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
            calls_cancelled: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            fragments_emitted: AtomicU64::new(0),
            errors: std::array::from_fn(|_| AtomicU64::new(0)),
            call_duration: DurationHistogram::default(),
        }
    }

    /// A call was spawned
    pub fn record_call_started(&self) {
        self.calls_started.fetch_add(1, Ordering::Relaxed);
    }

    /// A call reached a final state
    pub fn record_call_finished(&self, state: CallState, duration: Duration) {
        let counter = match state {
            CallState::Done => &self.calls_completed,
            CallState::UpstreamError => &self.calls_failed,
            CallState::Cancelled => &self.calls_cancelled,
            CallState::Open | CallState::Receiving => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.call_duration.record(duration);
    }

    /// An upstream frame arrived
    pub fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one error of the given kind
    pub fn record_error(&self, kind: ErrorKind) {
        self.errors[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Count one emission attempt
    pub fn record_outcome(&self, outcome: EmissionOutcome) {
        match outcome.failure() {
            None => {
                self.fragments_emitted.fetch_add(1, Ordering::Relaxed);
            }
            Some(failure) => self.record_error(failure.kind()),
        }
    }

    /// Errors recorded for one kind
    #[must_use]
    pub fn error_count(&self, kind: ErrorKind) -> u64 {
        self.errors[kind.index()].load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let calls_started = self.calls_started.load(Ordering::Relaxed);
        let calls_completed = self.calls_completed.load(Ordering::Relaxed);
        let calls_failed = self.calls_failed.load(Ordering::Relaxed);
        let calls_cancelled = self.calls_cancelled.load(Ordering::Relaxed);
        let call_duration = self.call_duration.snapshot();

        MetricsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            calls_started,
            calls_completed,
            calls_failed,
            calls_cancelled,
            calls_in_flight: calls_started
                .saturating_sub(calls_completed + calls_failed + calls_cancelled),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            fragments_emitted: self.fragments_emitted.load(Ordering::Relaxed),
            errors: ErrorKind::ALL
                .iter()
                .map(|kind| (kind.as_str().to_string(), self.error_count(*kind)))
                .collect(),
            call_latency_ms: CallLatency::from_histogram(&call_duration),
            call_duration_ms: call_duration,
        }
    }
}

/// Serializable view of [`RelayMetrics`]
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Seconds since the metrics were created
    pub uptime_secs: u64,
    /// Calls spawned
    pub calls_started: u64,
    /// Calls that reached the sentinel or end of stream
    pub calls_completed: u64,
    /// Calls ended by an upstream failure
    pub calls_failed: u64,
    /// Calls cancelled
    pub calls_cancelled: u64,
    /// Calls still running
    pub calls_in_flight: u64,
    /// Upstream frames seen
    pub frames_received: u64,
    /// Fragments accepted by at least one subscriber
    pub fragments_emitted: u64,
    /// Error count per kind label
    pub errors: BTreeMap<String, u64>,
    /// Call duration summary
    pub call_latency_ms: CallLatency,
    /// Call duration distribution
    pub call_duration_ms: HistogramSnapshot,
}

/// Headline call durations (ms), bucket upper bounds for the quantiles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallLatency {
    /// Median
    pub p50: u64,
    /// 99th percentile
    pub p99: u64,
    /// Arithmetic mean
    pub mean: u64,
}

impl CallLatency {
    fn from_histogram(histogram: &HistogramSnapshot) -> Self {
        Self {
            p50: histogram.percentile(0.5),
            p99: histogram.percentile(0.99),
            mean: histogram.mean(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::EmissionFailure;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_outcomes_split_into_emitted_and_kinds() {
        let metrics = RelayMetrics::new();
        metrics.record_outcome(EmissionOutcome::Emitted);
        metrics.record_outcome(EmissionOutcome::Emitted);
        metrics.record_outcome(EmissionFailure::Overflow.into());
        metrics.record_outcome(EmissionFailure::ZeroSubscriber.into());
        metrics.record_outcome(EmissionFailure::ZeroSubscriber.into());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fragments_emitted, 2);
        assert_eq!(snapshot.errors["emission_overflow"], 1);
        assert_eq!(snapshot.errors["emission_zero_subscriber"], 2);
        assert_eq!(snapshot.errors["emission_non_serialized"], 0);
        assert_eq!(snapshot.errors.len(), ErrorKind::COUNT);
    }

    #[test]
    fn test_call_lifecycle_counters() {
        let metrics = RelayMetrics::new();
        for _ in 0..4 {
            metrics.record_call_started();
        }
        metrics.record_call_finished(CallState::Done, Duration::from_millis(40));
        metrics.record_call_finished(CallState::UpstreamError, Duration::from_millis(5));
        metrics.record_call_finished(CallState::Cancelled, Duration::from_secs(3));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.calls_completed, 1);
        assert_eq!(snapshot.calls_failed, 1);
        assert_eq!(snapshot.calls_cancelled, 1);
        assert_eq!(snapshot.calls_in_flight, 1);
        assert_eq!(snapshot.call_duration_ms.total, 3);
        assert_eq!(snapshot.call_duration_ms.min, 5);
        assert_eq!(snapshot.call_duration_ms.max, 3_000);
        assert_eq!(
            snapshot.call_latency_ms,
            CallLatency {
                p50: 100,
                p99: 5_000,
                mean: 1_015,
            }
        );
    }

    #[test]
    fn test_histogram_percentiles() {
        let histogram = DurationHistogram::new(vec![10, 100, 1_000]);
        for ms in [5, 6, 7, 50, 500] {
            histogram.record(Duration::from_millis(ms));
        }
        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.counts, vec![3, 1, 1]);
        assert_eq!(snapshot.percentile(0.5), 10);
        assert_eq!(snapshot.percentile(1.0), 1_000);
        assert_eq!(snapshot.mean(), 113);
    }

    #[test]
    fn test_empty_histogram() {
        let snapshot = DurationHistogram::default().snapshot();
        assert_eq!(snapshot.min, 0);
        assert_eq!(snapshot.percentile(0.99), 0);
        assert_eq!(snapshot.mean(), 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(RelayMetrics::new().snapshot()).unwrap();
        assert_eq!(json["calls_started"], 0);
        assert_eq!(json["errors"]["frame_parse"], 0);
        assert_eq!(json["call_latency_ms"]["p99"], 0);
    }
}
