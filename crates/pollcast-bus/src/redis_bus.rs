use futures_util::StreamExt;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client};
use std::time::Duration;

use crate::{BusError, CounterStore, PubSub, Subscription};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);
const CONNECT_RETRIES: usize = 3;

/// Redis-backed bus shared by every server process.
///
/// Commands go through a [`ConnectionManager`], which reconnects on its own.
/// Each subscription holds a dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    connection: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = Client::open(url)?;
        let connection = client
            .get_connection_manager_with_config(manager_config())
            .await?;
        Ok(Self { client, connection })
    }
}

fn manager_config() -> ConnectionManagerConfig {
    ConnectionManagerConfig::new()
        .set_number_of_retries(CONNECT_RETRIES)
        .set_connection_timeout(CONNECT_TIMEOUT)
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

impl CounterStore for RedisBus {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, BusError> {
        let mut conn = self.connection.clone();
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .pexpire(key, ttl_millis(ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn decrement(&self, key: &str) -> Result<(), BusError> {
        let mut conn = self.connection.clone();
        let _: i64 = conn.decr(key, 1).await?;
        Ok(())
    }

    async fn reset_key(&self, key: &str) -> Result<(), BusError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn add_member(&self, set_key: &str, member: &str) -> Result<(), BusError> {
        let mut conn = self.connection.clone();
        let _: () = conn.sadd(set_key, member).await?;
        Ok(())
    }

    async fn remove_member(&self, set_key: &str, member: &str) -> Result<(), BusError> {
        let mut conn = self.connection.clone();
        let _: () = conn.srem(set_key, member).await?;
        Ok(())
    }

    async fn members(&self, set_key: &str) -> Result<Vec<String>, BusError> {
        let mut conn = self.connection.clone();
        let mut members: Vec<String> = conn.smembers(set_key).await?;
        members.sort();
        Ok(members)
    }
}

impl PubSub for RedisBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.connection.clone();
        let _: () = conn.publish(topic, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;

        let (sender, receiver) = Subscription::channel();
        let topic = topic.to_string();
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("bus: non-text payload on '{topic}': {e}");
                        continue;
                    }
                };
                if sender.send(payload).await.is_err() {
                    break;
                }
            }
            tracing::warn!("bus: redis subscription on '{topic}' ended");
        });

        Ok(Subscription::new(receiver, forwarder))
    }
}
