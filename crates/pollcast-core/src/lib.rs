pub mod auth;
pub mod error;
pub mod events;
pub mod observability;
pub mod polls;
pub mod rate_limit;
pub mod registry;
pub mod subscriber;
pub mod votes;

use pollcast_bus::Bus;
use pollcast_db::DbPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use error::CoreError;
pub use events::{UpdatePublisher, DEFAULT_UPDATE_TOPIC};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use registry::ConnectionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub bus: Bus,
    pub config: AppConfig,
    pub rate_limiter: RateLimiter,
    pub publisher: UpdatePublisher,
    /// Live WebSocket connections on this process and their poll subscriptions.
    pub registry: Arc<ConnectionRegistry>,
    /// Cancelled once on process shutdown; every loop watches it.
    pub shutdown: CancellationToken,
    subscriber_started: Arc<AtomicBool>,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Identifies this process in shared subscriber sets.
    pub node_id: String,
    pub jwt_secret: String,
    pub jwt_expiry_seconds: u64,
    pub rate_limit: RateLimitConfig,
    pub update_topic: String,
    /// The public URL of this server. Used for the WebSocket origin allow-list.
    pub public_url: Option<String>,
    pub allowed_origins: Vec<String>,
    /// Outbound update queue depth per WebSocket connection.
    pub ws_queue_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: new_node_id(),
            jwt_secret: String::new(),
            jwt_expiry_seconds: 3600,
            rate_limit: RateLimitConfig::default(),
            update_topic: DEFAULT_UPDATE_TOPIC.to_string(),
            public_url: None,
            allowed_origins: Vec::new(),
            ws_queue_capacity: registry::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

pub fn new_node_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl AppState {
    pub fn new(db: DbPool, bus: Bus, config: AppConfig) -> Self {
        let registry = ConnectionRegistry::with_queue_capacity(
            config.node_id.clone(),
            bus.clone(),
            config.ws_queue_capacity,
        );
        Self {
            rate_limiter: RateLimiter::new(bus.clone(), config.rate_limit),
            publisher: UpdatePublisher::new(bus.clone(), config.update_topic.clone()),
            registry: Arc::new(registry),
            shutdown: CancellationToken::new(),
            subscriber_started: Arc::new(AtomicBool::new(false)),
            db,
            bus,
            config,
        }
    }

    /// Start this process's single update subscriber. The subscription is
    /// live when this returns. A second call is rejected.
    pub async fn start_update_subscriber(&self) -> Result<JoinHandle<()>, CoreError> {
        if self.subscriber_started.swap(true, Ordering::SeqCst) {
            return Err(CoreError::Internal(
                "update subscriber already started".into(),
            ));
        }
        let started = subscriber::start(
            self.bus.clone(),
            self.config.update_topic.clone(),
            self.registry.clone(),
            self.shutdown.clone(),
        )
        .await;
        if started.is_err() {
            self.subscriber_started.store(false, Ordering::SeqCst);
        }
        started
    }
}
