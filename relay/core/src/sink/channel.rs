//! Per-user output channel
//!
//! A bounded, best-effort multicast of text fragments. Each subscriber gets
//! its own bounded buffer; a subscriber whose buffer is full misses the
//! fragment while the others still receive it. Subscribing again starts a
//! fresh live stream (nothing is replayed).
//!
//! A relayed call holds a [`WriterClaim`] for as long as it writes, so two
//! calls for the same user never interleave: the second one is refused with
//! `NonSerialized` until the first lets go.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::outcome::{EmissionFailure, EmissionOutcome};
use crate::relay::CallId;
use crate::user::UserId;

/// Default per-subscriber buffer size
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<String>,
}

/// Output channel for one user
///
/// Shared as `Arc<OutputChannel>`: the registry owns the entry, the relay and
/// the delivery loop hold clones.
pub struct OutputChannel {
    user_id: UserId,
    capacity: usize,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber_id: AtomicU64,
    /// Call that owns the write side, if any
    claimed_by: Mutex<Option<CallId>>,
    /// Set while a writer is inside an emit call
    writing: AtomicBool,
    terminated: AtomicBool,
    /// When the last subscriber left (`None` while someone listens)
    idle_since: Mutex<Option<Instant>>,
}

impl OutputChannel {
    /// Create a channel with the given per-subscriber capacity
    #[must_use]
    pub fn new(user_id: UserId, capacity: usize) -> Self {
        Self {
            user_id,
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
            claimed_by: Mutex::new(None),
            writing: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            idle_since: Mutex::new(Some(Instant::now())),
        }
    }

    /// The user this channel belongs to
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Per-subscriber buffer size
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Attach a new subscriber
    ///
    /// The returned stream yields every fragment emitted from now on and ends
    /// when the channel is terminated. Dropping it detaches the subscriber.
    pub fn subscribe(self: &Arc<Self>) -> FragmentStream {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut subscribers = self.subscribers.lock();
            // A terminated channel hands out an already-finished stream
            if !self.is_terminated() {
                subscribers.push(Subscriber { id, tx });
                *self.idle_since.lock() = None;
            }
        }

        tracing::debug!(
            user_id = %self.user_id,
            subscriber = id,
            "Subscriber attached"
        );

        FragmentStream {
            inner: ReceiverStream::new(rx),
            _guard: SubscriberGuard {
                id,
                channel: Arc::downgrade(self),
            },
        }
    }

    /// Reserve the write side for one call
    ///
    /// Returns `None` while a different call holds the claim. Claiming again
    /// from the owning call succeeds. The claim is released when the returned
    /// guard is dropped.
    pub fn claim_writer(self: &Arc<Self>, call_id: CallId) -> Option<WriterClaim> {
        let mut claimed_by = self.claimed_by.lock();
        if let Some(owner) = *claimed_by {
            if owner != call_id {
                tracing::debug!(
                    user_id = %self.user_id,
                    call_id = %call_id,
                    owner = %owner,
                    "Writer claim refused"
                );
                return None;
            }
        }
        *claimed_by = Some(call_id);
        Some(WriterClaim {
            call_id,
            channel: Arc::clone(self),
        })
    }

    /// Call currently holding the writer claim
    #[must_use]
    pub fn writer(&self) -> Option<CallId> {
        *self.claimed_by.lock()
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        self.prune(&mut subscribers);
        subscribers.len()
    }

    /// How long the channel has had no subscriber, `None` while subscribed
    #[must_use]
    pub fn idle_for(&self) -> Option<Duration> {
        {
            let mut subscribers = self.subscribers.lock();
            self.prune(&mut subscribers);
        }
        self.idle_since.lock().map(|since| since.elapsed())
    }

    /// Whether the channel has been torn down
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Tear the channel down
    ///
    /// Every subscriber stream ends; later emissions report `Terminated`.
    pub fn terminate(&self) {
        let mut subscribers = self.subscribers.lock();
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = subscribers.len();
        subscribers.clear();
        tracing::info!(
            user_id = %self.user_id,
            subscribers = dropped,
            "Output channel terminated"
        );
    }

    /// Push a fragment without waiting
    pub fn try_emit(&self, fragment: String) -> EmissionOutcome {
        if self.is_terminated() {
            return EmissionFailure::Terminated.into();
        }
        let Some(_writer) = WriterGuard::acquire(&self.writing) else {
            return EmissionFailure::NonSerialized.into();
        };

        let mut subscribers = self.subscribers.lock();
        self.prune(&mut subscribers);
        if subscribers.is_empty() {
            return EmissionFailure::ZeroSubscriber.into();
        }

        let mut delivered = 0;
        let mut overflowed = 0;
        for subscriber in subscribers.iter() {
            match subscriber.tx.try_send(fragment.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => overflowed += 1,
                Err(TrySendError::Closed(_)) => {}
            }
        }

        classify(delivered, overflowed)
    }

    /// Push a fragment, waiting up to `max_wait` for buffer space
    ///
    /// Subscribers still full at the deadline miss the fragment. Returns
    /// `Cancelled` as soon as `cancel` fires.
    pub async fn emit_within(
        &self,
        fragment: String,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> EmissionOutcome {
        if cancel.is_cancelled() {
            return EmissionFailure::Cancelled.into();
        }
        if self.is_terminated() {
            return EmissionFailure::Terminated.into();
        }
        let Some(_writer) = WriterGuard::acquire(&self.writing) else {
            return EmissionFailure::NonSerialized.into();
        };

        let senders: Vec<mpsc::Sender<String>> = {
            let mut subscribers = self.subscribers.lock();
            self.prune(&mut subscribers);
            subscribers.iter().map(|s| s.tx.clone()).collect()
        };
        if senders.is_empty() {
            return EmissionFailure::ZeroSubscriber.into();
        }

        let deadline = tokio::time::Instant::now() + max_wait;
        let mut delivered = 0;
        let mut overflowed = 0;
        for tx in senders {
            let send = tokio::time::timeout_at(deadline, tx.send(fragment.clone()));
            tokio::select! {
                biased;
                () = cancel.cancelled() => return EmissionFailure::Cancelled.into(),
                result = send => match result {
                    Ok(Ok(())) => delivered += 1,
                    Ok(Err(_closed)) => {}
                    Err(_elapsed) => overflowed += 1,
                },
            }
        }

        if delivered == 0 && self.is_terminated() {
            return EmissionFailure::Terminated.into();
        }
        classify(delivered, overflowed)
    }

    /// Drop closed subscribers; caller holds the subscriber lock
    fn prune(&self, subscribers: &mut Vec<Subscriber>) {
        let before = subscribers.len();
        subscribers.retain(|s| !s.tx.is_closed());
        if before > 0 && subscribers.is_empty() {
            self.mark_idle();
        }
    }

    fn detach(&self, id: u64) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| s.id != id);
        if subscribers.is_empty() {
            self.mark_idle();
        }
        tracing::debug!(
            user_id = %self.user_id,
            subscriber = id,
            remaining = subscribers.len(),
            "Subscriber detached"
        );
    }

    fn mark_idle(&self) {
        let mut idle_since = self.idle_since.lock();
        if idle_since.is_none() {
            *idle_since = Some(Instant::now());
        }
    }
}

impl fmt::Debug for OutputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputChannel")
            .field("user_id", &self.user_id)
            .field("capacity", &self.capacity)
            .field("subscribers", &self.subscribers.lock().len())
            .field("terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}

fn classify(delivered: usize, overflowed: usize) -> EmissionOutcome {
    if delivered > 0 {
        EmissionOutcome::Emitted
    } else if overflowed > 0 {
        EmissionFailure::Overflow.into()
    } else {
        EmissionFailure::ZeroSubscriber.into()
    }
}

/// Marks a channel as being written; at most one exists per channel
struct WriterGuard<'a>(&'a AtomicBool);

impl<'a> WriterGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Exclusive write access to an [`OutputChannel`] for one call
pub struct WriterClaim {
    call_id: CallId,
    channel: Arc<OutputChannel>,
}

impl WriterClaim {
    /// Owning call
    #[must_use]
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Whether this claim is on `channel`
    #[must_use]
    pub fn covers(&self, channel: &Arc<OutputChannel>) -> bool {
        Arc::ptr_eq(&self.channel, channel)
    }
}

impl Drop for WriterClaim {
    fn drop(&mut self) {
        let mut claimed_by = self.channel.claimed_by.lock();
        if *claimed_by == Some(self.call_id) {
            *claimed_by = None;
        }
    }
}

impl fmt::Debug for WriterClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterClaim")
            .field("call_id", &self.call_id)
            .field("user_id", &self.channel.user_id)
            .finish()
    }
}

struct SubscriberGuard {
    id: u64,
    channel: Weak<OutputChannel>,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.detach(self.id);
        }
    }
}

/// Live sequence of fragments for one subscriber
pub struct FragmentStream {
    inner: ReceiverStream<String>,
    _guard: SubscriberGuard,
}

impl Stream for FragmentStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl fmt::Debug for FragmentStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentStream")
            .field("subscriber", &self._guard.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn channel(capacity: usize) -> Arc<OutputChannel> {
        Arc::new(OutputChannel::new(UserId::new(), capacity))
    }

    #[test]
    fn test_emit_without_subscriber() {
        let ch = channel(4);
        assert_eq!(
            ch.try_emit("lost".to_string()),
            EmissionOutcome::Failed(EmissionFailure::ZeroSubscriber)
        );
        assert!(ch.idle_for().is_some());
    }

    #[tokio::test]
    async fn test_emit_reaches_subscriber_in_order() {
        let ch = channel(4);
        let mut stream = ch.subscribe();

        assert!(ch.try_emit("a".to_string()).is_success());
        assert!(ch.try_emit("b".to_string()).is_success());

        assert_eq!(stream.next().await.as_deref(), Some("a"));
        assert_eq!(stream.next().await.as_deref(), Some("b"));
        assert_eq!(ch.idle_for(), None);
    }

    #[tokio::test]
    async fn test_full_buffer_overflows() {
        let ch = channel(2);
        let _stream = ch.subscribe();

        assert!(ch.try_emit("1".to_string()).is_success());
        assert!(ch.try_emit("2".to_string()).is_success());
        assert_eq!(
            ch.try_emit("3".to_string()),
            EmissionOutcome::Failed(EmissionFailure::Overflow)
        );
    }

    #[tokio::test]
    async fn test_best_effort_skips_only_the_slow_subscriber() {
        let ch = channel(1);
        let _slow = ch.subscribe();
        assert!(ch.try_emit("fill".to_string()).is_success());

        let mut fast = ch.subscribe();
        assert!(ch.try_emit("next".to_string()).is_success());
        assert_eq!(fast.next().await.as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_counts_as_zero() {
        let ch = channel(4);
        let stream = ch.subscribe();
        assert_eq!(ch.subscriber_count(), 1);

        drop(stream);
        assert_eq!(ch.subscriber_count(), 0);
        assert!(ch.idle_for().is_some());
        assert_eq!(
            ch.try_emit("gone".to_string()),
            EmissionOutcome::Failed(EmissionFailure::ZeroSubscriber)
        );
    }

    #[tokio::test]
    async fn test_resubscribe_starts_fresh() {
        let ch = channel(4);
        let first = ch.subscribe();
        assert!(ch.try_emit("old".to_string()).is_success());
        drop(first);

        let mut second = ch.subscribe();
        assert!(ch.try_emit("new".to_string()).is_success());
        assert_eq!(second.next().await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_terminate_ends_streams() {
        let ch = channel(4);
        let mut stream = ch.subscribe();

        ch.terminate();
        assert!(ch.is_terminated());
        assert_eq!(stream.next().await, None);
        assert_eq!(
            ch.try_emit("late".to_string()),
            EmissionOutcome::Failed(EmissionFailure::Terminated)
        );

        let mut after = ch.subscribe();
        assert_eq!(after.next().await, None);
    }

    #[tokio::test]
    async fn test_emit_within_waits_for_capacity() {
        let ch = channel(1);
        let mut stream = ch.subscribe();
        assert!(ch.try_emit("first".to_string()).is_success());

        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let first = stream.next().await;
            let second = stream.next().await;
            (first, second)
        });

        let cancel = CancellationToken::new();
        let outcome = ch
            .emit_within("second".to_string(), Duration::from_secs(2), &cancel)
            .await;
        assert!(outcome.is_success());

        let (first, second) = reader.await.unwrap();
        assert_eq!(first.as_deref(), Some("first"));
        assert_eq!(second.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_emit_within_times_out_as_overflow() {
        let ch = channel(1);
        let _stream = ch.subscribe();
        assert!(ch.try_emit("fill".to_string()).is_success());

        let cancel = CancellationToken::new();
        let outcome = ch
            .emit_within("stuck".to_string(), Duration::from_millis(10), &cancel)
            .await;
        assert_eq!(outcome, EmissionOutcome::Failed(EmissionFailure::Overflow));
    }

    #[tokio::test]
    async fn test_emit_within_observes_cancellation() {
        let ch = channel(1);
        let _stream = ch.subscribe();
        assert!(ch.try_emit("fill".to_string()).is_success());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let outcome = ch
            .emit_within("stuck".to_string(), Duration::from_secs(5), &cancel)
            .await;
        assert_eq!(outcome, EmissionOutcome::Failed(EmissionFailure::Cancelled));
    }

    #[tokio::test]
    async fn test_overlapping_writers_are_rejected() {
        let ch = channel(1);
        let mut stream = ch.subscribe();
        assert!(ch.try_emit("fill".to_string()).is_success());

        let blocked = Arc::clone(&ch);
        let writer = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            blocked
                .emit_within("waiting".to_string(), Duration::from_secs(5), &cancel)
                .await
        });

        // Let the spawned writer take the writer slot
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            ch.try_emit("racing".to_string()),
            EmissionOutcome::Failed(EmissionFailure::NonSerialized)
        );

        assert_eq!(stream.next().await.as_deref(), Some("fill"));
        assert!(writer.await.unwrap().is_success());
        assert_eq!(stream.next().await.as_deref(), Some("waiting"));
    }

    #[test]
    fn test_writer_claim_is_exclusive_until_dropped() {
        let ch = channel(4);
        let first = CallId::new();
        let second = CallId::new();

        let claim = ch.claim_writer(first).unwrap();
        assert!(claim.covers(&ch));
        assert_eq!(ch.writer(), Some(first));
        assert!(ch.claim_writer(second).is_none());

        drop(claim);
        assert_eq!(ch.writer(), None);
        let claim = ch.claim_writer(second).unwrap();
        assert_eq!(claim.call_id(), second);
    }

    #[test]
    fn test_writer_claim_does_not_cover_other_channel() {
        let ch = channel(4);
        let other = channel(4);
        let claim = ch.claim_writer(CallId::new()).unwrap();
        assert!(!claim.covers(&other));
        assert_eq!(other.writer(), None);
    }
}
