//! Per-request price resolution: stream cache first, pull API on a miss.

use crate::quote::{Quote, Source};
use crate::subscription::SubscriptionManager;
use crate::traits::{PriceStream, QuoteSource};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct PriceLookup {
    stream: Arc<dyn PriceStream>,
    source: Arc<dyn QuoteSource>,
    subscriptions: Arc<SubscriptionManager>,
}

impl PriceLookup {
    pub fn new(
        stream: Arc<dyn PriceStream>,
        source: Arc<dyn QuoteSource>,
        subscriptions: Arc<SubscriptionManager>,
    ) -> Self {
        Self {
            stream,
            source,
            subscriptions,
        }
    }

    /// Resolve one instrument. Every successful lookup is recorded as an
    /// access, so a fallback hit gets streamed from then on.
    pub async fn resolve(&self, code: &str) -> Option<(Quote, Source)> {
        if let Some(quote) = self.stream.get_cached(code) {
            self.subscriptions.record_access(code).await;
            return Some((quote, Source::Stream));
        }

        match self.source.fetch_quote(code).await {
            Ok(quote) => {
                debug!("Fallback fetch for {}", code);
                self.subscriptions.record_access(code).await;
                Some((quote, Source::Fallback))
            }
            Err(e) => {
                debug!("Fallback fetch for {} failed: {}", code, e);
                None
            }
        }
    }

    /// Resolve `codes` concurrently, one task each. The output has one slot per
    /// input, in input order.
    pub async fn resolve_many(self: &Arc<Self>, codes: &[String]) -> Vec<Option<(Quote, Source)>> {
        let handles = codes.iter().cloned().map(|code| {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.resolve(&code).await })
        });

        join_all(handles)
            .await
            .into_iter()
            .map(|joined| match joined {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!("Lookup task failed: {}", e);
                    None
                }
            })
            .collect()
    }
}
