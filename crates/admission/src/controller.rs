//! Admission decisions: global cap first, then the per-client window.

use crate::error::Result;
use crate::limiter::RateLimiter;
use crate::usage::UsageTracker;
use chrono::{DateTime, Utc};
use external_services::SharedStore;
use metrics::counter;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

/// Counter compared against the global cap.
pub const GLOBAL_USAGE_KEY: &str = "usage:global";

pub const DEFAULT_GLOBAL_LIMIT: i64 = 10_000_000;
pub const DEFAULT_RATE_LIMIT: u32 = 2;

/// What to do when the shared store cannot answer an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreFailurePolicy {
    /// Admit the request and log the failure.
    #[default]
    FailOpen,
    /// Reject the request with the store error.
    FailClosed,
}

impl FromStr for StoreFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_open" | "open" => Ok(Self::FailOpen),
            "fail_closed" | "closed" => Ok(Self::FailClosed),
            other => Err(format!("unknown store failure policy: {}", other)),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted {
        remaining: u32,
        global_remaining: i64,
    },
    /// The service-wide cap is exhausted.
    GlobalLimited,
    /// The client's window is exhausted.
    RateLimited { remaining: u32, global_remaining: i64 },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub rate_limit: u32,
    pub global_limit: i64,
    pub failure_policy: StoreFailurePolicy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rate_limit: DEFAULT_RATE_LIMIT,
            global_limit: DEFAULT_GLOBAL_LIMIT,
            failure_policy: StoreFailurePolicy::FailOpen,
        }
    }
}

pub struct AdmissionController {
    store: Arc<dyn SharedStore>,
    limiter: RateLimiter,
    usage: UsageTracker,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn SharedStore>, config: AdmissionConfig) -> Self {
        Self {
            limiter: RateLimiter::new(store.clone(), config.rate_limit),
            usage: UsageTracker::new(store.clone()),
            store,
            config,
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    /// Decide whether a request from `key` may proceed.
    pub async fn admit(&self, key: &str) -> Result<Admission> {
        self.admit_at(key, Utc::now()).await
    }

    pub async fn admit_at(&self, key: &str, now: DateTime<Utc>) -> Result<Admission> {
        let global_used = match self.store.get_counter(GLOBAL_USAGE_KEY).await {
            Ok(used) => used.unwrap_or(0),
            Err(e) => return self.on_store_error("global check", e),
        };
        if global_used >= self.config.global_limit {
            counter!("admission_rejected_total", "reason" => "global").increment(1);
            return Ok(Admission::GlobalLimited);
        }

        let (allowed, remaining) = match self.limiter.allow_at(key, now).await {
            Ok(result) => result,
            Err(crate::Error::Store(e)) => return self.on_store_error("rate check", e),
            Err(e) => return Err(e),
        };
        if !allowed {
            counter!("admission_rejected_total", "reason" => "rate").increment(1);
            return Ok(Admission::RateLimited {
                remaining,
                global_remaining: (self.config.global_limit - global_used).max(0),
            });
        }

        let global_remaining = match self.store.incr(GLOBAL_USAGE_KEY).await {
            Ok(used) => (self.config.global_limit - used).max(0),
            Err(e) => {
                warn!("Failed to count admitted request globally: {}", e);
                (self.config.global_limit - global_used - 1).max(0)
            }
        };
        counter!("admission_admitted_total").increment(1);
        Ok(Admission::Admitted {
            remaining,
            global_remaining,
        })
    }

    fn on_store_error(
        &self,
        stage: &str,
        err: external_services::Error,
    ) -> Result<Admission> {
        counter!("admission_store_errors_total").increment(1);
        match self.config.failure_policy {
            StoreFailurePolicy::FailOpen => {
                warn!("Admission {} failed, admitting: {}", stage, err);
                Ok(Admission::Admitted {
                    remaining: self.config.rate_limit,
                    global_remaining: self.config.global_limit,
                })
            }
            StoreFailurePolicy::FailClosed => {
                warn!("Admission {} failed, rejecting: {}", stage, err);
                Err(err.into())
            }
        }
    }

    /// Record a processed request. Failures are logged, never surfaced.
    pub async fn record_usage(&self, key: &str) {
        if let Err(e) = self.usage.record_usage(key).await {
            warn!("Failed to record usage for {}: {}", crate::usage::mask_key(key), e);
        }
    }

    /// Requests counted against the global cap so far.
    pub async fn global_usage(&self) -> Result<i64> {
        Ok(self
            .store
            .get_counter(GLOBAL_USAGE_KEY)
            .await?
            .unwrap_or(0))
    }
}
