use pollcast_bus::{Bus, PubSub};
use pollcast_models::{PollResults, UpdateEvent};

use crate::observability;

pub const DEFAULT_UPDATE_TOPIC: &str = "poll-updates";

/// Publishes poll updates on the shared bus topic.
///
/// Publishing is fire-and-forget: a failure is logged and counted but never
/// reaches the caller, whose write has already committed.
#[derive(Clone)]
pub struct UpdatePublisher {
    bus: Bus,
    topic: String,
}

impl UpdatePublisher {
    pub fn new(bus: Bus, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn publish_vote_update(&self, poll_id: &str, results: &PollResults) {
        self.publish(&UpdateEvent::vote_update(poll_id, results)).await;
    }

    pub async fn publish_poll_closed(&self, poll_id: &str) {
        self.publish(&UpdateEvent::poll_closed(poll_id)).await;
    }

    async fn publish(&self, event: &UpdateEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                observability::publish_failed();
                tracing::warn!("events: failed to encode {}: {e}", event.event_type());
                return;
            }
        };

        match self.bus.publish(&self.topic, &payload).await {
            Ok(()) => {
                observability::update_published();
                tracing::debug!(
                    poll_id = %event.poll_id(),
                    "events: published {}",
                    event.event_type()
                );
            }
            Err(e) => {
                observability::publish_failed();
                tracing::warn!(
                    poll_id = %event.poll_id(),
                    "events: failed to publish {}: {e}",
                    event.event_type()
                );
            }
        }
    }
}
