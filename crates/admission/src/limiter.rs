//! Fixed-window rate limiter over shared counters.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use external_services::SharedStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Counts requests per client in non-overlapping windows.
///
/// The first request of a window creates `ratelimit:{key}:{window}` and gives
/// it a TTL of twice the window, so counters clean themselves up.
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    /// One-second windows allowing `limit` requests each.
    pub fn new(store: Arc<dyn SharedStore>, limit: u32) -> Self {
        Self::with_window(store, limit, Duration::from_secs(1))
    }

    pub fn with_window(store: Arc<dyn SharedStore>, limit: u32, window: Duration) -> Self {
        Self {
            store,
            limit,
            window: window.max(Duration::from_secs(1)),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Count one request for `key`. Returns whether it is allowed and how many remain.
    pub async fn allow(&self, key: &str) -> Result<(bool, u32)> {
        self.allow_at(key, Utc::now()).await
    }

    pub async fn allow_at(&self, key: &str, now: DateTime<Utc>) -> Result<(bool, u32)> {
        if key.is_empty() {
            return Err(Error::InvalidKey("empty client key".to_string()));
        }
        let window_key = self.window_key(key, now);
        let count = self.store.incr(&window_key).await?;
        if count == 1 {
            self.store.expire(&window_key, self.window * 2).await?;
        }

        let limit = i64::from(self.limit);
        let remaining = (limit - count).max(0) as u32;
        let allowed = count <= limit;
        if !allowed {
            debug!("Rate limited {} ({} in window)", key, count);
        }
        Ok((allowed, remaining))
    }

    fn window_key(&self, key: &str, now: DateTime<Utc>) -> String {
        let window = now.timestamp().div_euclid(self.window.as_secs() as i64);
        format!("ratelimit:{}:{}", key, window)
    }
}
