use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

static WS_CONNECTIONS_ACTIVE: AtomicU64 = AtomicU64::new(0);
static VOTES_CAST: AtomicU64 = AtomicU64::new(0);
static UPDATES_PUBLISHED: AtomicU64 = AtomicU64::new(0);
static PUBLISH_FAILURES: AtomicU64 = AtomicU64::new(0);
static UPDATES_DELIVERED: AtomicU64 = AtomicU64::new(0);
static DELIVERIES_DROPPED: AtomicU64 = AtomicU64::new(0);
static RATE_LIMITED: AtomicU64 = AtomicU64::new(0);

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

pub fn ws_connection_open() {
    bump(&WS_CONNECTIONS_ACTIVE, 1);
}

pub fn ws_connection_close() {
    let _ = WS_CONNECTIONS_ACTIVE.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(1))
    });
}

pub fn vote_cast() {
    bump(&VOTES_CAST, 1);
}

pub fn update_published() {
    bump(&UPDATES_PUBLISHED, 1);
}

pub fn publish_failed() {
    bump(&PUBLISH_FAILURES, 1);
}

pub fn updates_delivered(count: usize) {
    bump(&UPDATES_DELIVERED, count as u64);
}

pub fn delivery_dropped() {
    bump(&DELIVERIES_DROPPED, 1);
}

pub fn request_rate_limited() {
    bump(&RATE_LIMITED, 1);
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub active_connections: u64,
    pub votes_cast: u64,
    pub updates_published: u64,
    pub publish_failures: u64,
    pub updates_delivered: u64,
    pub deliveries_dropped: u64,
    pub rate_limited: u64,
}

pub fn metrics_snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        active_connections: WS_CONNECTIONS_ACTIVE.load(Ordering::Relaxed),
        votes_cast: VOTES_CAST.load(Ordering::Relaxed),
        updates_published: UPDATES_PUBLISHED.load(Ordering::Relaxed),
        publish_failures: PUBLISH_FAILURES.load(Ordering::Relaxed),
        updates_delivered: UPDATES_DELIVERED.load(Ordering::Relaxed),
        deliveries_dropped: DELIVERIES_DROPPED.load(Ordering::Relaxed),
        rate_limited: RATE_LIMITED.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_connection_close_is_saturating() {
        // Other tests in this binary never open connections.
        ws_connection_close();
        ws_connection_close();
        assert_eq!(metrics_snapshot().active_connections, 0);
    }

    #[test]
    fn counters_only_grow() {
        let before = metrics_snapshot();
        vote_cast();
        updates_delivered(3);
        let after = metrics_snapshot();
        assert!(after.votes_cast > before.votes_cast);
        assert!(after.updates_delivered >= before.updates_delivered + 3);
    }
}
