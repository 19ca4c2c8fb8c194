//! Sink Registry - per-user output channels
//!
//! Maps each [`UserId`] to exactly one [`OutputChannel`]. Creation is
//! race-free: concurrent `get_or_create` calls for the same user observe the
//! same `Arc`.
//!
//! ```text
//!                         SinkRegistry
//!          ┌──────────────────────────────────────────┐
//!          │ DashMap<UserId, Arc<OutputChannel>>      │
//!          └───────────────┬──────────────────────────┘
//!                          │
//!        ┌─────────────────┼─────────────────┐
//!        │                 │                 │
//!  ┌─────▼─────┐     ┌─────▼─────┐     ┌─────▼─────┐
//!  │  user A   │     │  user B   │     │  user C   │
//!  │ 2 streams │     │ 1 stream  │     │   idle    │
//!  └───────────┘     └───────────┘     └───────────┘
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use serde::Serialize;

use super::channel::{FragmentStream, OutputChannel, DEFAULT_CHANNEL_CAPACITY};
use crate::user::UserId;

/// Registry of output channels keyed by user
#[derive(Clone)]
pub struct SinkRegistry {
    channels: Arc<DashMap<UserId, Arc<OutputChannel>>>,
    channel_capacity: usize,
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkRegistry {
    /// Create an empty registry with the default channel capacity
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create an empty registry whose channels buffer `capacity` fragments
    /// per subscriber
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            channel_capacity: capacity.max(1),
        }
    }

    /// Per-subscriber capacity used for new channels
    #[must_use]
    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    /// Return the user's channel, creating it on first use
    pub fn get_or_create(&self, user_id: UserId) -> Arc<OutputChannel> {
        Arc::clone(self.entry(user_id).value())
    }

    /// Subscribe to the user's channel, creating it on first use
    ///
    /// The subscriber is attached while the entry is held, so an idle sweep
    /// can never evict the channel between lookup and subscription.
    pub fn subscribe(&self, user_id: UserId) -> (Arc<OutputChannel>, FragmentStream) {
        let entry = self.entry(user_id);
        let channel = Arc::clone(entry.value());
        let stream = channel.subscribe();
        drop(entry);
        (channel, stream)
    }

    /// Shard-locked entry for the user, inserting a fresh channel if absent
    fn entry(&self, user_id: UserId) -> RefMut<'_, UserId, Arc<OutputChannel>> {
        self.channels.entry(user_id).or_insert_with(|| {
            tracing::info!(user_id = %user_id, "Created output channel");
            Arc::new(OutputChannel::new(user_id, self.channel_capacity))
        })
    }

    /// Look up the user's channel without creating it
    #[must_use]
    pub fn get(&self, user_id: &UserId) -> Option<Arc<OutputChannel>> {
        self.channels.get(user_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a channel exists for the user
    #[must_use]
    pub fn contains(&self, user_id: &UserId) -> bool {
        self.channels.contains_key(user_id)
    }

    /// Remove and terminate the user's channel
    ///
    /// Writers still holding the channel see `Terminated`; later lookups see
    /// no channel at all.
    pub fn remove(&self, user_id: &UserId) -> Option<Arc<OutputChannel>> {
        let (_, channel) = self.channels.remove(user_id)?;
        channel.terminate();
        tracing::info!(user_id = %user_id, "Removed output channel");
        Some(channel)
    }

    /// Remove channels that have had no subscriber for at least `threshold`
    ///
    /// Returns the evicted users.
    pub fn evict_idle(&self, threshold: Duration) -> Vec<UserId> {
        let is_stale = |channel: &OutputChannel| {
            channel
                .idle_for()
                .is_some_and(|idle| idle >= threshold)
        };

        // Collect first: removing while iterating would deadlock the shard
        let candidates: Vec<UserId> = self
            .channels
            .iter()
            .filter(|entry| is_stale(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = Vec::with_capacity(candidates.len());
        for user_id in candidates {
            if let Some((_, channel)) = self
                .channels
                .remove_if(&user_id, |_, channel| is_stale(channel))
            {
                channel.terminate();
                evicted.push(user_id);
            }
        }

        if !evicted.is_empty() {
            tracing::info!(
                evicted = evicted.len(),
                remaining = self.channels.len(),
                "Evicted idle output channels"
            );
        }
        evicted
    }

    /// Number of channels
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channel exists
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Users that currently have a channel
    #[must_use]
    pub fn user_ids(&self) -> Vec<UserId> {
        self.channels.iter().map(|entry| *entry.key()).collect()
    }

    /// Channel and subscriber totals
    #[must_use]
    pub fn summary(&self) -> RegistrySummary {
        let mut summary = RegistrySummary::default();
        for entry in self.channels.iter() {
            summary.channels += 1;
            summary.subscribers += entry.value().subscriber_count();
        }
        summary
    }
}

impl fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkRegistry")
            .field("channel_count", &self.channels.len())
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

/// Snapshot of registry occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    /// Number of registered channels
    pub channels: usize,
    /// Live subscribers across all channels
    pub subscribers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{EmissionFailure, EmissionOutcome};
    use futures::StreamExt;

    #[test]
    fn test_get_or_create_returns_same_channel() {
        let registry = SinkRegistry::new();
        let user = UserId::new();

        let first = registry.get_or_create(user);
        let second = registry.get_or_create(user);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_does_not_create() {
        let registry = SinkRegistry::new();
        assert!(registry.get(&UserId::new()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_get_or_create_converges() {
        let registry = SinkRegistry::new();
        let user = UserId::new();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.get_or_create(user))
            })
            .collect();
        let channels: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for channel in &channels[1..] {
            assert!(Arc::ptr_eq(&channels[0], channel));
        }
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_terminates_channel() {
        let registry = SinkRegistry::new();
        let user = UserId::new();
        let channel = registry.get_or_create(user);
        let mut stream = channel.subscribe();

        assert!(registry.remove(&user).is_some());
        assert!(registry.get(&user).is_none());
        assert_eq!(stream.next().await, None);
        assert_eq!(
            channel.try_emit("late".to_string()),
            EmissionOutcome::Failed(EmissionFailure::Terminated)
        );
        assert!(registry.remove(&user).is_none());
    }

    #[tokio::test]
    async fn test_evict_idle_keeps_subscribed_channels() {
        let registry = SinkRegistry::new();
        let watched = UserId::new();
        let idle = UserId::new();

        let _stream = registry.get_or_create(watched).subscribe();
        registry.get_or_create(idle);

        let evicted = registry.evict_idle(Duration::ZERO);
        assert_eq!(evicted, vec![idle]);
        assert!(registry.contains(&watched));
        assert!(!registry.contains(&idle));
    }

    #[tokio::test]
    async fn test_subscribe_attaches_before_eviction_can_run() {
        let registry = SinkRegistry::new();
        let user = UserId::new();

        let (channel, mut stream) = registry.subscribe(user);
        assert!(Arc::ptr_eq(&channel, &registry.get_or_create(user)));
        assert_eq!(channel.idle_for(), None);
        assert!(registry.evict_idle(Duration::ZERO).is_empty());

        assert!(channel.try_emit("kept".to_string()).is_success());
        assert_eq!(stream.next().await.as_deref(), Some("kept"));
    }

    #[test]
    fn test_subscribe_races_with_sweeper() {
        let registry = SinkRegistry::new();
        let users: Vec<UserId> = (0..64).map(|_| UserId::new()).collect();

        let sweeper = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for _ in 0..1_000 {
                    registry.evict_idle(Duration::ZERO);
                }
            })
        };
        let streams: Vec<_> = users.iter().map(|user| registry.subscribe(*user)).collect();
        sweeper.join().unwrap();

        for (channel, _stream) in &streams {
            assert!(!channel.is_terminated());
            assert!(registry.contains(&channel.user_id()));
        }
    }

    #[test]
    fn test_evict_idle_respects_threshold() {
        let registry = SinkRegistry::new();
        registry.get_or_create(UserId::new());
        assert!(registry.evict_idle(Duration::from_secs(3600)).is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_summary_counts_subscribers() {
        let registry = SinkRegistry::with_capacity(8);
        let a = registry.get_or_create(UserId::new());
        let b = registry.get_or_create(UserId::new());
        let _s1 = a.subscribe();
        let _s2 = a.subscribe();
        let _s3 = b.subscribe();

        assert_eq!(
            registry.summary(),
            RegistrySummary {
                channels: 2,
                subscribers: 3
            }
        );
    }
}
