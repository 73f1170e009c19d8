//! Price provider WebSocket wire format.

use crate::error::Result;
use crate::price_source::types::Market;
use serde::{Deserialize, Serialize};

/// Price provider streaming endpoint.
pub const WS_URL: &str = "wss://ws.price.usenobi.com/v1";

#[derive(Debug, Serialize)]
struct SubscriptionMessage<'a> {
    method: &'static str,
    params: SubscriptionParams<'a>,
}

#[derive(Debug, Serialize)]
struct SubscriptionParams<'a> {
    pairs: &'a [String],
}

/// Build a subscribe request for `codes`.
///
/// Produces `{"method":"subscribe","params":{"pairs":[...]}}`.
pub fn build_subscription_message(codes: &[String]) -> Result<String> {
    let msg = SubscriptionMessage {
        method: "subscribe",
        params: SubscriptionParams { pairs: codes },
    };
    Ok(serde_json::to_string(&msg)?)
}

/// One streamed quote.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QuoteUpdate {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub ask: String,
    #[serde(default)]
    pub bid: String,
    #[serde(default)]
    pub market: Market,
}

/// Parse a text frame as a quote update.
///
/// Method acknowledgements, errors and anything else lacking a non-empty
/// `code` and `price` yield `None`.
pub fn parse_quote_update(text: &str) -> Option<QuoteUpdate> {
    let update: QuoteUpdate = serde_json::from_str(text).ok()?;
    if update.code.is_empty() || update.price.is_empty() {
        return None;
    }
    Some(update)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_subscription_message() {
        let codes = vec!["Crypto:ALL:BTC/USDT".to_string(), "Crypto:ALL:ETH/USDT".to_string()];
        let msg = build_subscription_message(&codes).unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["method"], "subscribe");
        assert_eq!(parsed["params"]["pairs"][0], "Crypto:ALL:BTC/USDT");
        assert_eq!(parsed["params"]["pairs"][1], "Crypto:ALL:ETH/USDT");
    }

    #[test]
    fn test_parse_quote_update() {
        let text = r#"{"code":"Crypto:ALL:BTC/USDT","price":"43000.8","ask":"43001","bid":"43000"}"#;
        let update = parse_quote_update(text).unwrap();
        assert_eq!(update.code, "Crypto:ALL:BTC/USDT");
        assert_eq!(update.bid, "43000");
    }

    #[test]
    fn test_parse_skips_non_quotes() {
        assert!(parse_quote_update(r#"{"method":"subscribe","result":"ok"}"#).is_none());
        assert!(parse_quote_update(r#"{"code":"X","price":""}"#).is_none());
        assert!(parse_quote_update(r#"{"price":"1"}"#).is_none());
        assert!(parse_quote_update("not json").is_none());
    }
}
