//! Request admission for the price gateway.
//!
//! Every protected request passes a global cap check and then a per-client
//! fixed-window rate check, both backed by shared counters. Admitted and
//! processed requests are counted per client at lifetime, daily and hourly
//! granularity.
//!
//! # Example
//!
//! ```ignore
//! use admission::{Admission, AdmissionConfig, AdmissionController};
//!
//! let controller = AdmissionController::new(store, AdmissionConfig::default());
//! match controller.admit("client-key").await? {
//!     Admission::Admitted { remaining, .. } => { /* serve, then record_usage */ }
//!     Admission::GlobalLimited | Admission::RateLimited { .. } => { /* 429 */ }
//! }
//! ```

pub mod controller;
pub mod error;
pub mod limiter;
pub mod usage;

pub use controller::{
    Admission, AdmissionConfig, AdmissionController, StoreFailurePolicy, DEFAULT_GLOBAL_LIMIT,
    DEFAULT_RATE_LIMIT, GLOBAL_USAGE_KEY,
};
pub use error::{Error, Result};
pub use limiter::RateLimiter;
pub use usage::{mask_key, DailyCount, GlobalStats, UsageStats, UsageTracker};
