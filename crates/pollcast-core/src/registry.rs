use pollcast_bus::{Bus, CounterStore};
use pollcast_models::UpdateEvent;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::CoreError;
use crate::observability;

/// Pending outbound updates per connection before new ones are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Serialized update shared by every connection it is pushed to.
pub type Outbound = Arc<str>;

/// Per-process map of live connections and the polls each one watches.
///
/// Local state answers delivery; the shared set `poll:{id}:subscribers` on
/// the bus mirrors it across processes (members are `{node}:{connection}`)
/// for counting only. The local lock is never held across an await.
pub struct ConnectionRegistry {
    node_id: String,
    queue_capacity: usize,
    store: Bus,
    connections: RwLock<HashMap<String, Connection>>,
}

struct Connection {
    poll_ids: HashSet<String>,
    sender: mpsc::Sender<Outbound>,
}

pub fn subscribers_key(poll_id: &str) -> String {
    format!("poll:{poll_id}:subscribers")
}

impl ConnectionRegistry {
    pub fn new(node_id: impl Into<String>, store: Bus) -> Self {
        Self::with_queue_capacity(node_id, store, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(node_id: impl Into<String>, store: Bus, capacity: usize) -> Self {
        Self {
            node_id: node_id.into(),
            queue_capacity: capacity.max(1),
            store,
            connections: RwLock::new(HashMap::new()),
        }
    }

    fn read_connections(&self) -> RwLockReadGuard<'_, HashMap<String, Connection>> {
        match self.connections.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_connections(&self) -> RwLockWriteGuard<'_, HashMap<String, Connection>> {
        match self.connections.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn member(&self, connection_id: &str) -> String {
        format!("{}:{connection_id}", self.node_id)
    }

    pub fn register(&self, connection_id: impl Into<String>) -> mpsc::Receiver<Outbound> {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        self.write_connections().insert(
            connection_id.into(),
            Connection {
                poll_ids: HashSet::new(),
                sender,
            },
        );
        receiver
    }

    /// Add `poll_id` to the connection's subscriptions. Idempotent; returns
    /// `false` for unknown connections.
    pub async fn subscribe(&self, connection_id: &str, poll_id: &str) -> bool {
        let known = {
            let mut connections = self.write_connections();
            match connections.get_mut(connection_id) {
                Some(connection) => {
                    connection.poll_ids.insert(poll_id.to_string());
                    true
                }
                None => false,
            }
        };
        if known {
            let member = self.member(connection_id);
            if let Err(e) = self.store.add_member(&subscribers_key(poll_id), &member).await {
                tracing::warn!("registry: failed to record subscriber {member} for poll {poll_id}: {e}");
            }
        }
        known
    }

    /// Remove `poll_id` from the connection's subscriptions. Unsubscribing
    /// from a poll that was never subscribed is a no-op.
    pub async fn unsubscribe(&self, connection_id: &str, poll_id: &str) {
        let was_subscribed = {
            let mut connections = self.write_connections();
            connections
                .get_mut(connection_id)
                .is_some_and(|connection| connection.poll_ids.remove(poll_id))
        };
        if was_subscribed {
            self.forget_member(connection_id, poll_id).await;
        }
    }

    /// Drop the connection and every subscription it held.
    pub async fn unregister(&self, connection_id: &str) {
        let removed = self.write_connections().remove(connection_id);
        if let Some(connection) = removed {
            for poll_id in &connection.poll_ids {
                self.forget_member(connection_id, poll_id).await;
            }
        }
    }

    async fn forget_member(&self, connection_id: &str, poll_id: &str) {
        let member = self.member(connection_id);
        if let Err(e) = self
            .store
            .remove_member(&subscribers_key(poll_id), &member)
            .await
        {
            tracing::warn!("registry: failed to remove subscriber {member} for poll {poll_id}: {e}");
        }
    }

    /// Queue `event` for every local connection subscribed to its poll.
    /// Returns how many connections it was queued for. A connection whose
    /// queue is full misses this event; closed connections are skipped.
    pub fn deliver(&self, event: &UpdateEvent) -> usize {
        let poll_id = event.poll_id();
        let targets: Vec<(String, mpsc::Sender<Outbound>)> = {
            let connections = self.read_connections();
            connections
                .iter()
                .filter(|(_, connection)| connection.poll_ids.contains(poll_id))
                .map(|(id, connection)| (id.clone(), connection.sender.clone()))
                .collect()
        };
        if targets.is_empty() {
            return 0;
        }

        let payload: Outbound = match serde_json::to_string(event) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                tracing::warn!("registry: failed to encode {}: {e}", event.event_type());
                return 0;
            }
        };

        let mut delivered = 0;
        for (connection_id, sender) in targets {
            match sender.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    observability::delivery_dropped();
                    tracing::warn!(
                        "registry: queue full for connection {connection_id}, dropping {} for poll {poll_id}",
                        event.event_type()
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        observability::updates_delivered(delivered);
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.read_connections().len()
    }

    pub fn local_subscriber_count(&self, poll_id: &str) -> usize {
        self.read_connections()
            .values()
            .filter(|connection| connection.poll_ids.contains(poll_id))
            .count()
    }

    pub fn subscriptions_of(&self, connection_id: &str) -> Vec<String> {
        let mut polls: Vec<String> = self
            .read_connections()
            .get(connection_id)
            .map(|connection| connection.poll_ids.iter().cloned().collect())
            .unwrap_or_default();
        polls.sort();
        polls
    }

    /// Subscribers of `poll_id` across every process sharing the bus.
    pub async fn cluster_subscribers(&self, poll_id: &str) -> Result<Vec<String>, CoreError> {
        Ok(self.store.members(&subscribers_key(poll_id)).await?)
    }
}
