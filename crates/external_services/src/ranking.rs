//! CoinGecko market-cap ranking client.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Base URL for the CoinGecko public API.
pub const COINGECKO_BASE_URL: &str = "https://api.coingecko.com/api/v3";

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One coin's ranking entry from `/coins/markets`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinRank {
    pub id: String,
    pub symbol: String,
    pub name: String,
    #[serde(default)]
    pub market_cap_rank: Option<u32>,
    #[serde(default)]
    pub market_cap: Option<f64>,
    #[serde(rename = "price_change_percentage_24h", default)]
    pub price_change_24h: Option<f64>,
}

struct CachedRanking {
    fetched_at: Instant,
    coins: Vec<CoinRank>,
}

/// Market-cap ranking client. Responses are cached for five minutes.
pub struct CoinGeckoClient {
    http: reqwest::Client,
    base_url: String,
    cache: RwLock<Option<CachedRanking>>,
}

impl CoinGeckoClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(COINGECKO_BASE_URL)
    }

    /// Client against `base_url` with the default 10 second request timeout.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache: RwLock::new(None),
        })
    }

    /// Top `limit` coins by market cap, served from cache when fresh.
    pub async fn top_coins(&self, limit: usize) -> Result<Vec<CoinRank>> {
        if let Some(coins) = self.cached(limit) {
            return Ok(coins);
        }

        let url = format!(
            "{}/coins/markets?vs_currency=usd&order=market_cap_desc&per_page=100&page=1",
            self.base_url
        );
        debug!("Fetching rankings from: {}", url);

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Api(format!(
                "CoinGecko returned status {}",
                response.status()
            )));
        }
        let coins: Vec<CoinRank> = response.json().await?;
        info!("Fetched {} coin rankings", coins.len());

        let top = coins.iter().take(limit).cloned().collect();
        self.store(coins);
        Ok(top)
    }

    /// Lower-case symbols of the top `limit` coins, in rank order.
    pub async fn top_symbols(&self, limit: usize) -> Result<Vec<String>> {
        let coins = self.top_coins(limit).await?;
        Ok(coins.into_iter().map(|c| c.symbol).collect())
    }

    fn cached(&self, limit: usize) -> Option<Vec<CoinRank>> {
        let guard = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        let cached = guard.as_ref()?;
        if cached.fetched_at.elapsed() < CACHE_TTL && cached.coins.len() >= limit {
            Some(cached.coins[..limit].to_vec())
        } else {
            None
        }
    }

    fn store(&self, coins: Vec<CoinRank>) {
        let mut guard = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(CachedRanking {
            fetched_at: Instant::now(),
            coins,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coin(symbol: &str, rank: u32) -> CoinRank {
        CoinRank {
            id: symbol.to_string(),
            symbol: symbol.to_string(),
            name: symbol.to_uppercase(),
            market_cap_rank: Some(rank),
            market_cap: None,
            price_change_24h: None,
        }
    }

    #[test]
    fn test_deserialize_markets() {
        let json = r#"[
            {"id":"bitcoin","symbol":"btc","name":"Bitcoin","market_cap_rank":1,
             "market_cap":850000000000.0,"price_change_percentage_24h":-1.2,"current_price":43000},
            {"id":"x","symbol":"x","name":"X","market_cap_rank":null,"market_cap":null}
        ]"#;
        let coins: Vec<CoinRank> = serde_json::from_str(json).unwrap();
        assert_eq!(coins[0].symbol, "btc");
        assert_eq!(coins[0].market_cap_rank, Some(1));
        assert_eq!(coins[0].price_change_24h, Some(-1.2));
        assert_eq!(coins[1].market_cap_rank, None);
    }

    #[tokio::test]
    async fn test_served_from_cache() {
        // Unroutable base URL: any network call would fail
        let client = CoinGeckoClient::with_base_url("http://127.0.0.1:1").unwrap();
        client.store(vec![coin("btc", 1), coin("eth", 2), coin("bnb", 3)]);

        let symbols = client.top_symbols(2).await.unwrap();
        assert_eq!(symbols, vec!["btc", "eth"]);
    }

    #[test]
    fn test_cache_too_small_misses() {
        let client = CoinGeckoClient::new().unwrap();
        client.store(vec![coin("btc", 1)]);
        assert!(client.cached(1).is_some());
        assert!(client.cached(2).is_none());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client =
            CoinGeckoClient::with_timeout(format!("http://{}", addr), Duration::from_millis(200))
                .unwrap();
        let started = Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(5), client.top_coins(10))
            .await
            .expect("request should be bounded by the client timeout");
        match result {
            Err(Error::Http(e)) => assert!(e.is_timeout()),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        server.abort();
    }
}
