//! Live price serving for the gateway.
//!
//! - `StreamingPriceCache`: one upstream websocket, latest quote per code, self-healing reconnects
//! - `SubscriptionManager`: protected set plus on-demand codes with stale pruning
//! - `PriceLookup`: cache read with pull-API fallback, single and batched

pub mod cache;
pub mod error;
pub mod lookup;
pub mod quote;
pub mod subscription;
pub mod traits;

pub use cache::{ConnectionState, StreamConfig, StreamingPriceCache};
pub use error::{Error, Result};
pub use lookup::PriceLookup;
pub use quote::{Quote, Source};
pub use subscription::{
    code_for_symbol, default_protected_set, SubscriptionConfig, SubscriptionManager,
    SubscriptionSet, SubscriptionStats,
};
pub use traits::{PriceStream, QuoteSource, RankingSource};
