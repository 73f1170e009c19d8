//! HTTP price gateway.
//!
//! This service:
//! - Admits requests through a global cap and a per-client rate window
//! - Serves prices from the streaming cache, falling back to the pull API
//! - Subscribes requested instruments on demand and prunes idle ones
//! - Reports per-client and global usage to admins
//!
//! ## Architecture
//!
//! ```text
//! HTTP request
//!         ↓
//! admission middleware (global cap → per-client window)
//!         ↓
//! PriceLookup ── hit ──→ StreamingPriceCache ←── upstream websocket
//!         │                      ↑
//!        miss                 subscribe
//!         ↓                      │
//! pull API fallback ──→ SubscriptionManager (protected set + access ledger)
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod state;

pub use api::{create_router, instrument_code, ClientKey, PriceResponse};
pub use config::Config;
pub use error::{GatewayError, Result};
pub use state::AppContext;
