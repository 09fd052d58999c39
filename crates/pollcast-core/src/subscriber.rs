use pollcast_bus::{Bus, PubSub, Subscription};
use pollcast_models::UpdateEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::registry::ConnectionRegistry;

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

/// Subscribe to the update topic and spawn the loop that hands every
/// received update to the local registry. Subscribing happens before this
/// returns, so no update published afterwards is missed.
pub async fn start(
    bus: Bus,
    topic: String,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, CoreError> {
    let subscription = bus.subscribe(&topic).await?;
    tracing::info!("subscriber: listening for updates on '{topic}'");
    Ok(tokio::spawn(run(bus, topic, registry, shutdown, subscription)))
}

async fn run(
    bus: Bus,
    topic: String,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    initial: Subscription,
) {
    let mut current = Some(initial);
    loop {
        let mut subscription = match current.take() {
            Some(subscription) => subscription,
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => {}
                }
                match bus.subscribe(&topic).await {
                    Ok(subscription) => {
                        tracing::info!("subscriber: resubscribed to '{topic}'");
                        subscription
                    }
                    Err(e) => {
                        tracing::warn!("subscriber: resubscribe to '{topic}' failed: {e}");
                        continue;
                    }
                }
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("subscriber: shutting down");
                    return;
                }
                payload = subscription.recv() => match payload {
                    Some(payload) => {
                        handle_payload(&registry, &payload);
                    }
                    None => {
                        tracing::warn!("subscriber: lost subscription to '{topic}'");
                        break;
                    }
                },
            }
        }
    }
}

/// Deliver one bus payload locally. Malformed payloads are logged and skipped.
pub fn handle_payload(registry: &ConnectionRegistry, payload: &str) -> usize {
    match serde_json::from_str::<UpdateEvent>(payload) {
        Ok(event) => registry.deliver(&event),
        Err(e) => {
            tracing::warn!("subscriber: ignoring malformed update: {e}");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polls::{close_poll, create_poll};
    use crate::test_support::{file_pool, state_with};
    use crate::votes::cast_vote_and_publish;
    use chrono::{Duration as ChronoDuration, Utc};
    use pollcast_bus::MemoryBus;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn next_event(rx: &mut tokio::sync::mpsc::Receiver<crate::registry::Outbound>) -> serde_json::Value {
        let payload = timeout(WAIT, rx.recv())
            .await
            .expect("update in time")
            .expect("open queue");
        serde_json::from_str(&payload).expect("json")
    }

    #[tokio::test]
    async fn malformed_payloads_are_skipped() {
        let registry = ConnectionRegistry::new("n1", Bus::Memory(MemoryBus::new()));
        let _rx = registry.register("c1");
        registry.subscribe("c1", "p1").await;

        assert_eq!(handle_payload(&registry, "not json"), 0);
        assert_eq!(handle_payload(&registry, r#"{"type":"unknown","pollId":"p1"}"#), 0);
        assert_eq!(
            handle_payload(&registry, r#"{"type":"poll_closed","pollId":"p1"}"#),
            1
        );
    }

    #[tokio::test]
    async fn updates_cross_processes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = file_pool(&dir, 4).await;
        let bus = MemoryBus::new();
        let first = state_with(db.clone(), &bus, "n1");
        let second = state_with(db, &bus, "n2");
        let first_sub = first.start_update_subscriber().await.unwrap();
        let second_sub = second.start_update_subscriber().await.unwrap();

        let poll = create_poll(
            &first.db,
            "Cross?",
            &["A".to_string(), "B".to_string()],
            Utc::now() + ChronoDuration::hours(1),
            Some("owner"),
        )
        .await
        .unwrap();

        let mut watcher = second.registry.register("watcher");
        second.registry.subscribe("watcher", &poll.id).await;

        cast_vote_and_publish(&first, &poll.id, "voter", 0).await.unwrap();
        let update = next_event(&mut watcher).await;
        assert_eq!(update["type"], "vote_update");
        assert_eq!(update["pollId"], poll.id.as_str());
        assert_eq!(update["data"]["votes"], serde_json::json!([1, 0]));
        assert_eq!(update["data"]["totalVotes"], 1);

        close_poll(&first, &poll.id, "owner").await.unwrap();
        let closed = next_event(&mut watcher).await;
        assert_eq!(closed["type"], "poll_closed");
        assert_eq!(closed["data"]["closed"], true);

        // Exactly one poll_closed reached the watcher.
        second
            .publisher
            .publish_poll_closed("another-poll")
            .await;
        assert!(timeout(Duration::from_millis(200), watcher.recv()).await.is_err());

        first.shutdown.cancel();
        second.shutdown.cancel();
        let _ = timeout(WAIT, first_sub).await;
        let _ = timeout(WAIT, second_sub).await;
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let bus = Bus::Memory(MemoryBus::new());
        let registry = Arc::new(ConnectionRegistry::new("n1", bus.clone()));
        let shutdown = CancellationToken::new();
        let handle = start(bus, "t".into(), registry, shutdown.clone())
            .await
            .unwrap();

        // Cancelled before the loop is ever polled.
        shutdown.cancel();
        let stopped = timeout(WAIT, handle).await;
        assert!(stopped.is_ok());
    }

    #[tokio::test]
    async fn shutdown_during_delivery_is_not_lost() {
        let bus = Bus::Memory(MemoryBus::new());
        let registry = Arc::new(ConnectionRegistry::new("n1", bus.clone()));
        let shutdown = CancellationToken::new();
        let handle = start(bus.clone(), "t".into(), registry, shutdown.clone())
            .await
            .unwrap();

        let update = r#"{"type":"poll_closed","pollId":"p1","data":{"closed":true}}"#;
        bus.publish("t", update).await.unwrap();
        shutdown.cancel();
        bus.publish("t", update).await.unwrap();
        assert!(timeout(WAIT, handle).await.is_ok());
    }
}
