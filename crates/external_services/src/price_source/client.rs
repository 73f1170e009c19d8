//! Price provider pull API client.

use crate::error::{Error, Result};
use crate::price_source::types::{PriceData, SourceResponse};
use std::time::Duration;
use tracing::debug;

/// Default base URL for the pull API.
pub const DEFAULT_BASE_URL: &str = "https://api.price.usenobi.com/v1";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Pull API client. Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PriceSourceClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl PriceSourceClient {
    /// Create a client with the default 5 second request timeout.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the current quote for `code`.
    ///
    /// # Arguments
    /// * `code` - Instrument code (e.g., "Crypto:ALL:BTC/USDT")
    pub async fn get_price(&self, code: &str) -> Result<PriceData> {
        let url = format!("{}/price", self.base_url);
        debug!("Fetching price for {} from {}", code, url);

        let response = self
            .http
            .get(&url)
            .query(&[("code", code)])
            .header("X-API-KEY", &self.api_key)
            .send()
            .await?;

        let body = response.text().await?;
        parse_price_response(code, &body)
    }
}

/// Decode a `/price` response body, checking the envelope status.
pub fn parse_price_response(code: &str, body: &str) -> Result<PriceData> {
    let resp: SourceResponse<PriceData> = serde_json::from_str(body)?;

    if !resp.is_ok() {
        return Err(Error::Api(format!(
            "{} - {}",
            resp.status_number, resp.message
        )));
    }

    resp.data
        .filter(|d| !d.price.is_empty())
        .ok_or_else(|| Error::InstrumentNotFound(code.to_string()))
}
