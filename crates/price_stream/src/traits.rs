//! Seams between the stream cache, the subscription manager and the upstream APIs.

use crate::error::Result;
use crate::quote::Quote;
use async_trait::async_trait;
use external_services::price_source::PriceSourceClient;
use external_services::CoinGeckoClient;

/// Live quote feed with a local cache.
#[async_trait]
pub trait PriceStream: Send + Sync {
    /// Ask the upstream to stream `codes`. Succeeds without sending when disconnected.
    async fn subscribe(&self, codes: &[String]) -> Result<()>;

    /// Latest cached quote. Never touches the network.
    fn get_cached(&self, code: &str) -> Option<Quote>;

    /// Drop cached quotes for `codes`.
    fn evict(&self, codes: &[String]);
}

/// Synchronous quote fetch used on a cache miss.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch_quote(&self, code: &str) -> Result<Quote>;
}

/// Market-cap ranking used to refresh the protected set.
#[async_trait]
pub trait RankingSource: Send + Sync {
    /// Symbols of the top `limit` coins, highest market cap first.
    async fn top_symbols(&self, limit: usize) -> Result<Vec<String>>;
}

#[async_trait]
impl QuoteSource for PriceSourceClient {
    async fn fetch_quote(&self, code: &str) -> Result<Quote> {
        let data = self.get_price(code).await?;
        Ok(Quote::from(data))
    }
}

#[async_trait]
impl RankingSource for CoinGeckoClient {
    async fn top_symbols(&self, limit: usize) -> Result<Vec<String>> {
        Ok(CoinGeckoClient::top_symbols(self, limit).await?)
    }
}
