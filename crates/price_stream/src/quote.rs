//! Quote snapshot shared by the stream cache and the pull fallback.

use external_services::price_source::{PriceData, QuoteUpdate};
use serde::{Deserialize, Serialize};

/// Latest known price for one instrument. Decimal fields keep the upstream text encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub code: String,
    pub price: String,
    pub ask: String,
    pub bid: String,
    pub market_open: bool,
}

/// Where a resolved quote came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Served from the streaming cache.
    Stream,
    /// Fetched from the pull API on a cache miss.
    Fallback,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Stream => "stream",
            Source::Fallback => "fallback",
        }
    }
}

impl From<PriceData> for Quote {
    fn from(data: PriceData) -> Self {
        Self {
            code: data.code,
            price: data.price,
            ask: data.ask,
            bid: data.bid,
            market_open: data.market.open,
        }
    }
}

impl From<QuoteUpdate> for Quote {
    /// Streamed prices are live, so the market is reported open.
    fn from(update: QuoteUpdate) -> Self {
        Self {
            code: update.code,
            price: update.price,
            ask: update.ask,
            bid: update.bid,
            market_open: true,
        }
    }
}
