//! Price provider data types.

use serde::{Deserialize, Serialize};

/// Envelope returned by every pull API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceResponse<T> {
    pub status_number: String,
    #[serde(rename = "ts", default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub data: Option<T>,
}

impl<T> SourceResponse<T> {
    pub fn is_ok(&self) -> bool {
        self.status_number == "200"
    }
}

/// Latest quote for one instrument. Prices stay as the provider's decimal strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceData {
    pub code: String,
    #[serde(default)]
    pub ask: String,
    #[serde(default)]
    pub bid: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub market: Market,
}

/// Trading session status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Market {
    #[serde(default)]
    pub open: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub session: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timezone: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_envelope() {
        let json = r#"{
            "status_number": "200",
            "ts": 1700000000,
            "data": {
                "code": "Crypto:ALL:BTC/USDT",
                "ask": "43001.5",
                "bid": "43000.1",
                "price": "43000.8",
                "market": {"open": true, "reason": "", "session": "regular"}
            }
        }"#;

        let resp: SourceResponse<PriceData> = serde_json::from_str(json).unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.timestamp, 1700000000);
        let data = resp.data.unwrap();
        assert_eq!(data.code, "Crypto:ALL:BTC/USDT");
        assert_eq!(data.price, "43000.8");
        assert!(data.market.open);
    }

    #[test]
    fn test_deserialize_error_envelope() {
        let json = r#"{"status_number": "404", "ts": 1, "message": "code not found", "data": null}"#;
        let resp: SourceResponse<PriceData> = serde_json::from_str(json).unwrap();
        assert!(!resp.is_ok());
        assert_eq!(resp.message, "code not found");
        assert!(resp.data.is_none());
    }
}
