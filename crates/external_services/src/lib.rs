//! External service clients for the price gateway.
//!
//! This library provides:
//! - `price_source`: the upstream market-data provider (pull API client and
//!   streaming wire format)
//! - `ranking`: CoinGecko market-cap ranking, used to refresh the protected set
//! - `SharedStore`: the counter/key-value store behind rate limiting, usage
//!   accounting and subscription persistence, with Redis and in-memory backends
//!
//! # Example
//!
//! ```ignore
//! use external_services::price_source::PriceSourceClient;
//! use external_services::{RedisStore, SharedStore};
//!
//! let client = PriceSourceClient::new("https://api.price.usenobi.com/v1", api_key)?;
//! let price = client.get_price("Crypto:ALL:BTC/USDT").await?;
//!
//! let store = RedisStore::new("redis://localhost:6379")?;
//! let hits = store.incr("usage:total:abc").await?;
//! ```

pub mod error;
pub mod memory_store;
pub mod price_source;
pub mod ranking;
pub mod redis_client;
pub mod store;

pub use error::{Error, Result};
pub use memory_store::MemoryStore;
pub use ranking::{CoinGeckoClient, CoinRank};
pub use redis_client::RedisStore;
pub use store::{glob_match, SharedStore};
