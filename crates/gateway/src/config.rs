//! Process configuration from environment variables.

use crate::error::{GatewayError, Result};
use admission::{AdmissionConfig, StoreFailurePolicy, DEFAULT_GLOBAL_LIMIT, DEFAULT_RATE_LIMIT};
use external_services::price_source::{DEFAULT_BASE_URL, WS_URL};
use external_services::ranking::COINGECKO_BASE_URL;
use price_stream::{StreamConfig, SubscriptionConfig};
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub metrics_port: u16,
    pub source_url: String,
    pub source_api_key: String,
    pub ws_url: String,
    pub redis_url: String,
    pub admin_key: String,
    pub rate_limit: u32,
    pub global_limit: i64,
    pub failure_policy: StoreFailurePolicy,
    pub protected_set_size: usize,
    pub coingecko_url: String,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through `lookup`, which returns a variable's value if set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str, default: &str| -> String {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let required = |name: &str| -> Result<String> {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| GatewayError::Config(format!("{} is required", name)))
        };

        Ok(Self {
            http_port: parse("HTTP_PORT", &get("HTTP_PORT", "8080"))?,
            metrics_port: parse("METRICS_PORT", &get("METRICS_PORT", "9090"))?,
            source_url: get("SOURCE_URL", DEFAULT_BASE_URL),
            source_api_key: required("SOURCE_API_KEY")?,
            ws_url: get("WS_URL", WS_URL),
            redis_url: get("REDIS_URL", "redis://localhost:6379"),
            admin_key: required("ADMIN_KEY")?,
            rate_limit: parse(
                "RATE_LIMIT_PER_SEC",
                &get("RATE_LIMIT_PER_SEC", &DEFAULT_RATE_LIMIT.to_string()),
            )?,
            global_limit: parse(
                "GLOBAL_LIMIT",
                &get("GLOBAL_LIMIT", &DEFAULT_GLOBAL_LIMIT.to_string()),
            )?,
            failure_policy: get("ADMISSION_STORE_FAILURE_POLICY", "fail_open")
                .parse()
                .map_err(GatewayError::Config)?,
            protected_set_size: parse("PROTECTED_SET_SIZE", &get("PROTECTED_SET_SIZE", "10"))?,
            coingecko_url: get("COINGECKO_URL", COINGECKO_BASE_URL),
        })
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            url: self.ws_url.clone(),
            api_key: self.source_api_key.clone(),
            ..Default::default()
        }
    }

    pub fn subscription_config(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            protected_size: self.protected_set_size,
            ..Default::default()
        }
    }

    pub fn admission_config(&self) -> AdmissionConfig {
        AdmissionConfig {
            rate_limit: self.rate_limit,
            global_limit: self.global_limit,
            failure_policy: self.failure_policy,
        }
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GatewayError::Config(format!("{} must be a number, got {:?}", name, value)))
}
