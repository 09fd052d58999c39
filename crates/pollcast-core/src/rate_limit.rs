use pollcast_bus::{Bus, CounterStore};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

use crate::error::CoreError;
use crate::observability;

const KEY_PREFIX: &str = "rate-limit:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 1000,
            max_requests: 5,
        }
    }
}

impl RateLimitConfig {
    fn normalized(self) -> Self {
        Self {
            window_ms: self.window_ms.max(1),
            max_requests: self.max_requests.max(1),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Whole seconds a rejected caller should wait, rounded up.
    pub fn retry_after_seconds(&self) -> u64 {
        self.window_ms.div_ceil(1000).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub accepted: bool,
    /// Counter value after this request.
    pub hits: u64,
    pub retry_after_seconds: u64,
}

/// Fixed-window request limiter backed by the shared counter store, so the
/// limit holds across every server process.
///
/// Each accepted or rejected request increments the key and pushes its
/// expiry a full window forward. Rejected requests therefore keep the window
/// alive, and a caller hammering at exactly the limit stays blocked.
#[derive(Clone)]
pub struct RateLimiter {
    store: Bus,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Bus, config: RateLimitConfig) -> Self {
        Self {
            store,
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    pub async fn check(&self, identity_key: &str) -> Result<RateLimitDecision, CoreError> {
        let hits = self
            .store
            .increment(&store_key(identity_key), self.config.window())
            .await?;
        let accepted = hits <= self.config.max_requests;
        if !accepted {
            observability::request_rate_limited();
            tracing::debug!("rate limit: '{identity_key}' rejected after {hits} hits");
        }
        Ok(RateLimitDecision {
            accepted,
            hits,
            retry_after_seconds: self.config.retry_after_seconds(),
        })
    }

    /// Admit or reject one request. Rejection is `CoreError::RateLimited`.
    pub async fn admit(&self, identity_key: &str) -> Result<(), CoreError> {
        let decision = self.check(identity_key).await?;
        if decision.accepted {
            Ok(())
        } else {
            Err(CoreError::RateLimited {
                retry_after_seconds: decision.retry_after_seconds,
            })
        }
    }

    /// Give back one hit, e.g. when a request should not count.
    pub async fn decrement(&self, identity_key: &str) -> Result<(), CoreError> {
        self.store.decrement(&store_key(identity_key)).await?;
        Ok(())
    }

    pub async fn reset_key(&self, identity_key: &str) -> Result<(), CoreError> {
        self.store.reset_key(&store_key(identity_key)).await?;
        Ok(())
    }
}

fn store_key(identity_key: &str) -> String {
    format!("{KEY_PREFIX}{identity_key}")
}

/// Authenticated requests are limited per identity, anonymous ones per
/// remote address.
pub fn identity_key(user_id: Option<&str>, remote: Option<IpAddr>) -> String {
    match (user_id, remote) {
        (Some(user_id), _) => format!("user:{user_id}"),
        (None, Some(addr)) => format!("ip:{addr}"),
        (None, None) => "ip:unknown".to_string(),
    }
}
