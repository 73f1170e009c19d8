//! Shared application state wired from configuration.

use crate::config::Config;
use crate::error::Result;
use admission::AdmissionController;
use external_services::price_source::PriceSourceClient;
use external_services::{CoinGeckoClient, RedisStore, SharedStore};
use price_stream::{
    PriceLookup, QuoteSource, StreamingPriceCache, SubscriptionManager, SubscriptionSet,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Everything the HTTP handlers and middleware need.
pub struct AppContext {
    pub admin_key: String,
    pub stream: Arc<StreamingPriceCache>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub lookup: Arc<PriceLookup>,
    pub admission: Arc<AdmissionController>,
    pub ranking: Arc<CoinGeckoClient>,
}

impl AppContext {
    /// Build production clients from `config`: Redis store, pull API and CoinGecko.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = Arc::new(RedisStore::new(&config.redis_url)?);
        if let Err(e) = store.ping().await {
            // Admission follows its failure policy until the store comes back
            warn!("Redis not reachable at startup: {}", e);
        }

        let source = Arc::new(PriceSourceClient::new(
            config.source_url.clone(),
            config.source_api_key.clone(),
        )?);
        let ranking = Arc::new(CoinGeckoClient::with_base_url(config.coingecko_url.clone())?);

        Ok(Self::new(config, store, source, ranking))
    }

    /// Build the component graph. Nothing connects until [`AppContext::start`].
    pub fn new(
        config: &Config,
        store: Arc<dyn SharedStore>,
        source: Arc<dyn QuoteSource>,
        ranking: Arc<CoinGeckoClient>,
    ) -> Self {
        let set = SubscriptionSet::new();
        let stream = Arc::new(StreamingPriceCache::new(config.stream_config(), set.clone()));

        // Background loops stop when the stream cache closes
        let subscriptions = Arc::new(
            SubscriptionManager::new(
                store.clone(),
                stream.clone(),
                set,
                config.subscription_config(),
                stream.shutdown_signal(),
            )
            .with_ranking(ranking.clone()),
        );

        let lookup = Arc::new(PriceLookup::new(
            stream.clone(),
            source,
            subscriptions.clone(),
        ));
        let admission = Arc::new(AdmissionController::new(store, config.admission_config()));

        Self {
            admin_key: config.admin_key.clone(),
            stream,
            subscriptions,
            lookup,
            admission,
            ranking,
        }
    }

    /// Connect the stream and start the subscription loops.
    pub async fn start(&self) {
        self.stream.start().await;
        self.subscriptions.start().await;
        info!(
            "Price stream {} with {} subscriptions",
            self.stream.state().as_str(),
            self.subscriptions.stats().total_subscribed
        );
    }

    /// Close the upstream stream and wait for background loops to stop.
    pub async fn shutdown(&self) {
        self.stream.close().await;
        self.stream.join().await;
        self.subscriptions.join().await;
    }
}
