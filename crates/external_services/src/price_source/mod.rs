//! Upstream market-data provider.
//!
//! Provides the pull API client and the streaming wire format.

pub mod client;
pub mod types;
pub mod websocket;

pub use client::{PriceSourceClient, DEFAULT_BASE_URL};
pub use types::{Market, PriceData, SourceResponse};
pub use websocket::{build_subscription_message, parse_quote_update, QuoteUpdate, WS_URL};
