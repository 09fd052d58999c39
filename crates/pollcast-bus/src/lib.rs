//! Shared key/count store and publish/subscribe bus.
//!
//! Every server process talks to the same bus: the rate limiter keeps its
//! window counters here, the connection registry mirrors poll subscriber sets
//! here, and poll updates are published on one topic that every process
//! subscribes to. [`Bus`] dispatches to a Redis backend for multi-process
//! deployments or to an in-process memory backend for single-process runs
//! and tests.

pub mod memory;
pub mod redis_bus;

use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use memory::MemoryBus;
pub use redis_bus::RedisBus;

/// Buffered messages per subscription before the forwarder applies backpressure.
const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("unsupported bus url: {0}")]
    UnsupportedUrl(String),
}

/// Counter and set operations on the shared store.
#[allow(async_fn_in_trait)]
pub trait CounterStore: Send + Sync {
    /// Increment `key` and reset its expiry to `ttl`. Returns the new count.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, BusError>;

    async fn decrement(&self, key: &str) -> Result<(), BusError>;

    /// Remove `key` entirely.
    async fn reset_key(&self, key: &str) -> Result<(), BusError>;

    async fn add_member(&self, set_key: &str, member: &str) -> Result<(), BusError>;

    async fn remove_member(&self, set_key: &str, member: &str) -> Result<(), BusError>;

    async fn members(&self, set_key: &str) -> Result<Vec<String>, BusError>;
}

/// Fire-and-forget topic messaging. No persistence and no replay: a
/// subscriber only sees messages published while it is subscribed.
#[allow(async_fn_in_trait)]
pub trait PubSub: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;
}

/// A live topic subscription. Dropping it ends the subscription.
pub struct Subscription {
    receiver: mpsc::Receiver<String>,
    forwarder: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn channel() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(SUBSCRIPTION_BUFFER)
    }

    pub(crate) fn new(receiver: mpsc::Receiver<String>, forwarder: JoinHandle<()>) -> Self {
        Self {
            receiver,
            forwarder,
        }
    }

    /// Next payload, or `None` once the underlying transport is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Enum-dispatch wrapper so the bus can live in `Clone` application state
/// despite `async fn` in the traits.
#[derive(Clone)]
pub enum Bus {
    Redis(RedisBus),
    Memory(MemoryBus),
}

impl Bus {
    /// Connect according to the URL scheme: `memory://` or `redis://` / `rediss://`.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let trimmed = url.trim();
        if trimmed.is_empty() || trimmed.starts_with("memory://") {
            tracing::info!("bus: using in-process memory backend (single process only)");
            return Ok(Bus::Memory(MemoryBus::new()));
        }
        if trimmed.starts_with("redis://") || trimmed.starts_with("rediss://") {
            let bus = RedisBus::connect(trimmed).await?;
            tracing::info!("bus: connected to redis");
            return Ok(Bus::Redis(bus));
        }
        Err(BusError::UnsupportedUrl(trimmed.to_string()))
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Bus::Redis(_) => "redis",
            Bus::Memory(_) => "memory",
        }
    }
}

impl CounterStore for Bus {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, BusError> {
        match self {
            Bus::Redis(b) => b.increment(key, ttl).await,
            Bus::Memory(b) => b.increment(key, ttl).await,
        }
    }

    async fn decrement(&self, key: &str) -> Result<(), BusError> {
        match self {
            Bus::Redis(b) => b.decrement(key).await,
            Bus::Memory(b) => b.decrement(key).await,
        }
    }

    async fn reset_key(&self, key: &str) -> Result<(), BusError> {
        match self {
            Bus::Redis(b) => b.reset_key(key).await,
            Bus::Memory(b) => b.reset_key(key).await,
        }
    }

    async fn add_member(&self, set_key: &str, member: &str) -> Result<(), BusError> {
        match self {
            Bus::Redis(b) => b.add_member(set_key, member).await,
            Bus::Memory(b) => b.add_member(set_key, member).await,
        }
    }

    async fn remove_member(&self, set_key: &str, member: &str) -> Result<(), BusError> {
        match self {
            Bus::Redis(b) => b.remove_member(set_key, member).await,
            Bus::Memory(b) => b.remove_member(set_key, member).await,
        }
    }

    async fn members(&self, set_key: &str) -> Result<Vec<String>, BusError> {
        match self {
            Bus::Redis(b) => b.members(set_key).await,
            Bus::Memory(b) => b.members(set_key).await,
        }
    }
}

impl PubSub for Bus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        match self {
            Bus::Redis(b) => b.publish(topic, payload).await,
            Bus::Memory(b) => b.publish(topic, payload).await,
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        match self {
            Bus::Redis(b) => b.subscribe(topic).await,
            Bus::Memory(b) => b.subscribe(topic).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_urls_select_memory_backend() {
        let bus = Bus::connect("memory://").await.expect("memory bus");
        assert_eq!(bus.backend_name(), "memory");
        let bus = Bus::connect("").await.expect("default bus");
        assert_eq!(bus.backend_name(), "memory");
    }

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        let err = Bus::connect("amqp://localhost").await.err().expect("error");
        assert!(matches!(err, BusError::UnsupportedUrl(_)));
    }

    #[tokio::test]
    async fn dispatch_reaches_memory_backend() {
        let bus = Bus::Memory(MemoryBus::new());
        let mut sub = bus.subscribe("t").await.unwrap();
        bus.publish("t", "hello").await.unwrap();
        assert_eq!(sub.recv().await.as_deref(), Some("hello"));
        assert_eq!(bus.increment("k", Duration::from_secs(1)).await.unwrap(), 1);
    }
}
