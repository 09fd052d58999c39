use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;

use crate::{BusError, CounterStore, PubSub, Subscription};

const TOPIC_CAPACITY: usize = 4096;
/// Expired counters are swept once the map grows past this many keys.
const COUNTER_SWEEP_THRESHOLD: usize = 10_000;

struct Counter {
    count: u64,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    counters: DashMap<String, Counter>,
    sets: DashMap<String, HashSet<String>>,
    topics: DashMap<String, broadcast::Sender<String>>,
}

/// In-process bus. Clones share state, so two application states built from
/// clones of one `MemoryBus` behave like two processes on one shared bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sweep_expired_counters(&self, now: Instant) {
        if self.inner.counters.len() > COUNTER_SWEEP_THRESHOLD {
            self.inner.counters.retain(|_, c| c.expires_at > now);
        }
    }
}

impl CounterStore for MemoryBus {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, BusError> {
        let now = Instant::now();
        self.sweep_expired_counters(now);

        let mut counter = self
            .inner
            .counters
            .entry(key.to_string())
            .or_insert(Counter {
                count: 0,
                expires_at: now,
            });
        if counter.expires_at <= now {
            counter.count = 0;
        }
        counter.count = counter.count.saturating_add(1);
        counter.expires_at = now + ttl;
        Ok(counter.count)
    }

    async fn decrement(&self, key: &str) -> Result<(), BusError> {
        if let Some(mut counter) = self.inner.counters.get_mut(key) {
            counter.count = counter.count.saturating_sub(1);
        }
        Ok(())
    }

    async fn reset_key(&self, key: &str) -> Result<(), BusError> {
        self.inner.counters.remove(key);
        self.inner.sets.remove(key);
        Ok(())
    }

    async fn add_member(&self, set_key: &str, member: &str) -> Result<(), BusError> {
        self.inner
            .sets
            .entry(set_key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn remove_member(&self, set_key: &str, member: &str) -> Result<(), BusError> {
        if let Some(mut set) = self.inner.sets.get_mut(set_key) {
            set.remove(member);
        }
        self.inner.sets.remove_if(set_key, |_, set| set.is_empty());
        Ok(())
    }

    async fn members(&self, set_key: &str) -> Result<Vec<String>, BusError> {
        let mut members: Vec<String> = self
            .inner
            .sets
            .get(set_key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }
}

impl PubSub for MemoryBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        if let Some(sender) = self.inner.topics.get(topic) {
            // No receivers is not an error: delivery is at-least-zero.
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let mut source = self
            .inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe();

        let (sender, receiver) = Subscription::channel();
        let topic = topic.to_string();
        let forwarder = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if sender.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("bus: subscriber on '{topic}' lagged, {skipped} messages lost");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(receiver, forwarder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn counter_resets_after_ttl() {
        let bus = MemoryBus::new();
        let ttl = Duration::from_millis(1000);

        assert_eq!(bus.increment("k", ttl).await.unwrap(), 1);
        assert_eq!(bus.increment("k", ttl).await.unwrap(), 2);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(bus.increment("k", ttl).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn every_increment_pushes_expiry_forward() {
        let bus = MemoryBus::new();
        let ttl = Duration::from_millis(1000);

        bus.increment("k", ttl).await.unwrap();
        tokio::time::advance(Duration::from_millis(800)).await;
        bus.increment("k", ttl).await.unwrap();
        tokio::time::advance(Duration::from_millis(800)).await;
        // 1600ms after the first hit, but only 800ms after the last one.
        assert_eq!(bus.increment("k", ttl).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn decrement_and_reset() {
        let bus = MemoryBus::new();
        let ttl = Duration::from_secs(60);
        bus.increment("k", ttl).await.unwrap();
        bus.increment("k", ttl).await.unwrap();
        bus.decrement("k").await.unwrap();
        assert_eq!(bus.increment("k", ttl).await.unwrap(), 2);

        bus.reset_key("k").await.unwrap();
        assert_eq!(bus.increment("k", ttl).await.unwrap(), 1);

        // Decrementing an unknown key is a no-op.
        bus.decrement("unknown").await.unwrap();
    }

    #[tokio::test]
    async fn sets_add_remove_idempotently() {
        let bus = MemoryBus::new();
        bus.add_member("s", "a").await.unwrap();
        bus.add_member("s", "a").await.unwrap();
        bus.add_member("s", "b").await.unwrap();
        assert_eq!(bus.members("s").await.unwrap(), vec!["a", "b"]);

        bus.remove_member("s", "a").await.unwrap();
        bus.remove_member("s", "a").await.unwrap();
        assert_eq!(bus.members("s").await.unwrap(), vec!["b"]);

        bus.remove_member("s", "b").await.unwrap();
        assert!(bus.members("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn every_subscriber_receives_each_message() {
        let bus = MemoryBus::new();
        let other_process = bus.clone();

        let mut a = bus.subscribe("updates").await.unwrap();
        let mut b = other_process.subscribe("updates").await.unwrap();
        bus.publish("updates", "one").await.unwrap();
        bus.publish("other-topic", "ignored").await.unwrap();
        bus.publish("updates", "two").await.unwrap();

        assert_eq!(a.recv().await.as_deref(), Some("one"));
        assert_eq!(a.recv().await.as_deref(), Some("two"));
        assert_eq!(b.recv().await.as_deref(), Some("one"));
        assert_eq!(b.recv().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = MemoryBus::new();
        bus.publish("nobody", "hello").await.unwrap();
    }

    #[tokio::test]
    async fn messages_before_subscribe_are_not_replayed() {
        let bus = MemoryBus::new();
        let mut early = bus.subscribe("t").await.unwrap();
        bus.publish("t", "first").await.unwrap();

        let mut late = bus.subscribe("t").await.unwrap();
        bus.publish("t", "second").await.unwrap();

        assert_eq!(early.recv().await.as_deref(), Some("first"));
        assert_eq!(late.recv().await.as_deref(), Some("second"));
    }
}
