//! HTTP API for the price gateway.

use crate::state::AppContext;
use admission::{mask_key, Admission, DailyCount};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use chrono::Utc;
use external_services::CoinRank;
use metrics::counter;
use price_stream::{code_for_symbol, Quote, Source, SubscriptionStats};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

const GLOBAL_LIMIT_HEADER: HeaderName = HeaderName::from_static("x-global-limit");
const GLOBAL_REMAINING_HEADER: HeaderName = HeaderName::from_static("x-global-remaining");
const RATE_LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

const DEFAULT_TOP_LIMIT: usize = 10;
const MAX_TOP_LIMIT: usize = 100;
const DEFAULT_DAILY_DAYS: u32 = 7;
const MAX_DAILY_DAYS: u32 = 30;

/// Create the API router.
pub fn create_router(state: Arc<AppContext>) -> Router {
    let protected = Router::new()
        .route("/v1/price/{pair}", get(price_handler))
        .route("/v1/batch", post(batch_handler))
        .route("/v1/usage", get(usage_handler))
        .route("/v1/top", get(top_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admission_middleware,
        ));

    let admin = Router::new()
        .route("/admin/stats", get(admin_stats_handler))
        .route("/admin/daily", get(admin_daily_handler))
        .route("/admin/usage/{key}", get(admin_key_usage_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_middleware));

    Router::new()
        .route("/health", get(health_handler))
        .merge(protected)
        .merge(admin)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Map a requested pair to an instrument code.
///
/// Codes containing `:` pass through. `BASE/QUOTE` and bare symbols are crypto pairs.
pub fn instrument_code(pair: &str) -> String {
    if pair.contains(':') {
        pair.to_string()
    } else if pair.contains('/') {
        format!("Crypto:ALL:{}", pair.to_uppercase())
    } else {
        code_for_symbol(pair)
    }
}

/// Quote currency: the last segment of the code, `USD` if there is none.
fn currency_of(code: &str) -> String {
    code.split([':', '/'])
        .filter(|s| !s.is_empty())
        .last()
        .unwrap_or("USD")
        .to_string()
}

fn parse_decimal(value: &str) -> Option<Decimal> {
    let value = value.trim();
    Decimal::from_str(value)
        .or_else(|_| Decimal::from_scientific(value))
        .ok()
}

/// Unparseable prices are reported as zero rather than failing the request.
fn price_or_zero(code: &str, value: &str) -> Decimal {
    parse_decimal(value).unwrap_or_else(|| {
        warn!("Unparseable price {:?} for {}, reporting 0", value, code);
        counter!("gateway_unparseable_prices_total").increment(1);
        Decimal::ZERO
    })
}

// =============================================================================
// Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pair: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            pair: None,
            details: None,
        }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse::new(error)))
}

fn internal_error(context: &str, err: impl std::fmt::Display) -> ApiError {
    error!("{}: {}", context, err);
    api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    ts: i64,
    stream: &'static str,
    cached_quotes: usize,
    subscriptions: SubscriptionStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceResponse {
    pub pair: String,
    pub price: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<Decimal>,
    pub currency: String,
    pub market: &'static str,
    pub timestamp: i64,
    pub source: Source,
}

impl PriceResponse {
    fn new(pair: String, quote: &Quote, source: Source) -> Self {
        let nonzero = |v: &str| parse_decimal(v).filter(|d| !d.is_zero());
        Self {
            pair,
            price: price_or_zero(&quote.code, &quote.price),
            ask: nonzero(&quote.ask),
            bid: nonzero(&quote.bid),
            currency: currency_of(&quote.code),
            market: if quote.market_open { "open" } else { "closed" },
            timestamp: Utc::now().timestamp(),
            source,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    pairs: Vec<String>,
}

#[derive(Debug, Serialize)]
struct BatchError {
    pair: String,
    error: &'static str,
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    results: Vec<PriceResponse>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<BatchError>,
}

#[derive(Debug, Serialize)]
struct ClientUsageResponse {
    api_key: String,
    total: i64,
    last_24h: i64,
    last_7_days: i64,
    rate_limit: u32,
}

#[derive(Debug, Serialize)]
struct TopEntry {
    rank: Option<u32>,
    symbol: String,
    name: String,
    market_cap: Option<f64>,
    price_change_24h: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    currency: Option<String>,
}

#[derive(Debug, Serialize)]
struct TopResponse {
    limit: usize,
    results: Vec<TopEntry>,
}

#[derive(Debug, Serialize)]
struct AdminStatsResponse {
    total_api_keys: usize,
    total_hits: i64,
    today_hits: i64,
    global_usage: i64,
    global_limit: i64,
    global_remaining: i64,
    stream: &'static str,
    cached_quotes: usize,
    subscriptions: SubscriptionStats,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
struct DailyResponse {
    days: u32,
    breakdown: Vec<DailyCount>,
}

#[derive(Debug, Serialize)]
struct KeyUsageResponse {
    api_key: String,
    total: i64,
    last_24h: i64,
    last_7_days: i64,
    daily_breakdown: Vec<DailyCount>,
}

// =============================================================================
// Middleware
// =============================================================================

/// Client identity of an admitted request.
#[derive(Debug, Clone)]
pub struct ClientKey(pub String);

#[derive(Debug, Default, Deserialize)]
struct AuthParams {
    api_key: Option<String>,
    admin_key: Option<String>,
}

fn credential(headers: &HeaderMap, header: &str, param: Option<String>) -> Option<String> {
    headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(param)
        .filter(|k| !k.is_empty())
}

fn set_global_headers(headers: &mut HeaderMap, limit: i64, remaining: i64) {
    headers.insert(GLOBAL_LIMIT_HEADER, HeaderValue::from(limit));
    headers.insert(GLOBAL_REMAINING_HEADER, HeaderValue::from(remaining));
}

fn set_rate_headers(headers: &mut HeaderMap, limit: u32, remaining: u32) {
    headers.insert(RATE_LIMIT_HEADER, HeaderValue::from(limit));
    headers.insert(RATE_REMAINING_HEADER, HeaderValue::from(remaining));
}

/// Global cap, then per-client window. Usage is counted after the handler ran.
async fn admission_middleware(
    State(state): State<Arc<AppContext>>,
    Query(params): Query<AuthParams>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(key) = credential(request.headers(), "x-api-key", params.api_key) else {
        return api_error(StatusCode::UNAUTHORIZED, "API key required").into_response();
    };

    let limits = state.admission.config();
    let (rate_limit, global_limit) = (limits.rate_limit, limits.global_limit);

    let admission = match state.admission.admit(&key).await {
        Ok(admission) => admission,
        Err(e) => {
            error!("Admission check failed for {}: {}", mask_key(&key), e);
            return api_error(StatusCode::SERVICE_UNAVAILABLE, "Admission check unavailable")
                .into_response();
        }
    };

    match admission {
        Admission::GlobalLimited => {
            warn!("Global limit reached, rejecting {}", mask_key(&key));
            let body = serde_json::json!({
                "error": "Global limit exceeded",
                "message": "Service has reached maximum capacity. Try again later.",
                "global_limit": global_limit,
                "global_remaining": 0,
            });
            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            set_global_headers(response.headers_mut(), global_limit, 0);
            response
        }
        Admission::RateLimited {
            remaining,
            global_remaining,
        } => {
            let body = serde_json::json!({
                "error": "Rate limit exceeded",
                "limit": rate_limit,
                "remaining": remaining,
                "retry_after": 1,
            });
            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            set_global_headers(response.headers_mut(), global_limit, global_remaining);
            set_rate_headers(response.headers_mut(), rate_limit, remaining);
            response
        }
        Admission::Admitted {
            remaining,
            global_remaining,
        } => {
            request.extensions_mut().insert(ClientKey(key.clone()));
            let mut response = next.run(request).await;
            state.admission.record_usage(&key).await;

            set_global_headers(response.headers_mut(), global_limit, global_remaining);
            set_rate_headers(response.headers_mut(), rate_limit, remaining);
            response
        }
    }
}

async fn admin_middleware(
    State(state): State<Arc<AppContext>>,
    Query(params): Query<AuthParams>,
    request: Request,
    next: Next,
) -> Response {
    match credential(request.headers(), "x-admin-key", params.admin_key) {
        Some(key) if key == state.admin_key => next.run(request).await,
        _ => api_error(StatusCode::UNAUTHORIZED, "Invalid admin key").into_response(),
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<AppContext>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        ts: Utc::now().timestamp(),
        stream: state.stream.state().as_str(),
        cached_quotes: state.stream.cache_len(),
        subscriptions: state.subscriptions.stats(),
    })
}

fn display_pair(pair: &str) -> String {
    if pair.contains(':') {
        pair.to_string()
    } else {
        pair.to_uppercase()
    }
}

/// Get the latest price for one pair.
async fn price_handler(
    State(state): State<Arc<AppContext>>,
    Path(pair): Path<String>,
) -> Result<Json<PriceResponse>, ApiError> {
    let code = instrument_code(&pair);
    match state.lookup.resolve(&code).await {
        Some((quote, source)) => {
            counter!("gateway_price_lookups_total", "source" => source.as_str()).increment(1);
            Ok(Json(PriceResponse::new(display_pair(&pair), &quote, source)))
        }
        None => {
            counter!("gateway_price_lookups_total", "source" => "none").increment(1);
            Err((
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: "pair not found".to_string(),
                    pair: Some(pair),
                    details: None,
                }),
            ))
        }
    }
}

/// Resolve several pairs concurrently. Results keep request order.
async fn batch_handler(
    State(state): State<Arc<AppContext>>,
    payload: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Json<BatchResponse>, ApiError> {
    let pairs = match payload {
        Ok(Json(req)) if !req.pairs.is_empty() => req.pairs,
        _ => return Err(api_error(StatusCode::BAD_REQUEST, "pairs array is required")),
    };

    let codes: Vec<String> = pairs.iter().map(|p| instrument_code(p)).collect();
    let resolved = state.lookup.resolve_many(&codes).await;

    let mut results = Vec::with_capacity(pairs.len());
    let mut errors = Vec::new();
    for (pair, item) in pairs.into_iter().zip(resolved) {
        match item {
            Some((quote, source)) => {
                results.push(PriceResponse::new(display_pair(&pair), &quote, source))
            }
            None => errors.push(BatchError {
                pair,
                error: "not found",
            }),
        }
    }

    Ok(Json(BatchResponse { results, errors }))
}

async fn usage_handler(
    State(state): State<Arc<AppContext>>,
    Extension(ClientKey(key)): Extension<ClientKey>,
) -> Result<Json<ClientUsageResponse>, ApiError> {
    let usage = state.admission.usage();
    let stats = usage
        .usage_stats(std::slice::from_ref(&key))
        .await
        .map_err(|e| internal_error("Failed to get usage stats", e))?;
    let Some(stats) = stats.into_iter().next() else {
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to get usage stats",
        ));
    };

    Ok(Json(ClientUsageResponse {
        api_key: stats.api_key,
        total: stats.total,
        last_24h: stats.last_24h,
        last_7_days: stats.last_7_days,
        rate_limit: state.admission.config().rate_limit,
    }))
}

#[derive(Debug, Deserialize)]
struct TopParams {
    limit: Option<String>,
}

/// Top coins by market cap, with prices where available.
async fn top_handler(
    State(state): State<Arc<AppContext>>,
    Query(params): Query<TopParams>,
) -> Result<Json<TopResponse>, ApiError> {
    let limit = params
        .limit
        .and_then(|l| l.parse::<usize>().ok())
        .filter(|l| (1..=MAX_TOP_LIMIT).contains(l))
        .unwrap_or(DEFAULT_TOP_LIMIT);

    let coins: Vec<CoinRank> = state.ranking.top_coins(limit).await.map_err(|e| {
        error!("Failed to fetch rankings: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Failed to fetch rankings".to_string(),
                pair: None,
                details: Some(e.to_string()),
            }),
        )
    })?;

    let codes: Vec<String> = coins.iter().map(|c| code_for_symbol(&c.symbol)).collect();
    let prices = state.lookup.resolve_many(&codes).await;

    let results = coins
        .into_iter()
        .zip(prices)
        .map(|(coin, price)| {
            let price = price.map(|(quote, source)| {
                PriceResponse::new(coin.symbol.to_uppercase(), &quote, source)
            });
            TopEntry {
                rank: coin.market_cap_rank,
                symbol: coin.symbol,
                name: coin.name,
                market_cap: coin.market_cap,
                price_change_24h: coin.price_change_24h,
                price: price.as_ref().map(|p| p.price),
                currency: price.map(|p| p.currency),
            }
        })
        .collect();

    Ok(Json(TopResponse { limit, results }))
}

async fn admin_stats_handler(
    State(state): State<Arc<AppContext>>,
) -> Result<Json<AdminStatsResponse>, ApiError> {
    let global = state
        .admission
        .usage()
        .global_stats()
        .await
        .map_err(|e| internal_error("Failed to get global stats", e))?;
    let global_usage = state
        .admission
        .global_usage()
        .await
        .map_err(|e| internal_error("Failed to get global usage", e))?;
    let global_limit = state.admission.config().global_limit;

    Ok(Json(AdminStatsResponse {
        total_api_keys: global.total_api_keys,
        total_hits: global.total_hits,
        today_hits: global.today_hits,
        global_usage,
        global_limit,
        global_remaining: (global_limit - global_usage).max(0),
        stream: state.stream.state().as_str(),
        cached_quotes: state.stream.cache_len(),
        subscriptions: state.subscriptions.stats(),
        timestamp: Utc::now().timestamp(),
    }))
}

#[derive(Debug, Deserialize)]
struct DailyParams {
    days: Option<String>,
}

async fn admin_daily_handler(
    State(state): State<Arc<AppContext>>,
    Query(params): Query<DailyParams>,
) -> Result<Json<DailyResponse>, ApiError> {
    let days = params
        .days
        .and_then(|d| d.parse::<u32>().ok())
        .filter(|d| (1..=MAX_DAILY_DAYS).contains(d))
        .unwrap_or(DEFAULT_DAILY_DAYS);

    let breakdown = state
        .admission
        .usage()
        .global_daily_breakdown(days)
        .await
        .map_err(|e| internal_error("Failed to get daily breakdown", e))?;

    Ok(Json(DailyResponse { days, breakdown }))
}

/// Usage for the client whose key starts with `prefix`.
async fn admin_key_usage_handler(
    State(state): State<Arc<AppContext>>,
    Path(prefix): Path<String>,
) -> Result<Json<KeyUsageResponse>, ApiError> {
    if prefix.contains(['*', '?', '[', ']']) {
        return Err(api_error(StatusCode::BAD_REQUEST, "Invalid key prefix"));
    }

    let usage = state.admission.usage();
    let key = usage
        .find_key(&prefix)
        .await
        .map_err(|e| internal_error("Failed to look up key", e))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Key not found"))?;

    let stats = usage
        .usage_stats(std::slice::from_ref(&key))
        .await
        .map_err(|e| internal_error("Failed to get usage stats", e))?;
    let breakdown = usage
        .daily_breakdown(&key, DEFAULT_DAILY_DAYS)
        .await
        .map_err(|e| internal_error("Failed to get daily breakdown", e))?;

    let (total, last_24h, last_7_days) = stats
        .first()
        .map(|s| (s.total, s.last_24h, s.last_7_days))
        .unwrap_or_default();

    Ok(Json(KeyUsageResponse {
        api_key: mask_key(&key),
        total,
        last_24h,
        last_7_days,
        daily_breakdown: breakdown,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use external_services::{CoinGeckoClient, MemoryStore, SharedStore};
    use price_stream::QuoteSource;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tower::ServiceExt;

    const ADMIN: &str = "admin-secret";

    /// Pull API stand-in that knows a fixed set of codes.
    struct FixedSource;

    #[async_trait]
    impl QuoteSource for FixedSource {
        async fn fetch_quote(&self, code: &str) -> price_stream::Result<Quote> {
            match code {
                "Crypto:ALL:ETH/USDT" => Ok(quote(code, "3000.25", false)),
                "Stock:US:AAPL" => Ok(quote(code, "190.5", false)),
                _ => Err(external_services::Error::InstrumentNotFound(code.to_string()).into()),
            }
        }
    }

    fn quote(code: &str, price: &str, market_open: bool) -> Quote {
        Quote {
            code: code.to_string(),
            price: price.to_string(),
            ask: price.to_string(),
            bid: "0".to_string(),
            market_open,
        }
    }

    fn test_config(vars: &[(&str, &str)]) -> Config {
        let mut env: HashMap<String, String> = [
            ("SOURCE_API_KEY", "source-key"),
            ("ADMIN_KEY", ADMIN),
            ("RATE_LIMIT_PER_SEC", "100"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in vars {
            env.insert(k.to_string(), v.to_string());
        }
        Config::from_lookup(|name| env.get(name).cloned()).unwrap()
    }

    fn test_context(
        vars: &[(&str, &str)],
        ranking_url: &str,
    ) -> (Arc<AppContext>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let ctx = AppContext::new(
            &test_config(vars),
            store.clone(),
            Arc::new(FixedSource),
            Arc::new(CoinGeckoClient::with_base_url(ranking_url).unwrap()),
        );
        (Arc::new(ctx), store)
    }

    fn setup() -> (Arc<AppContext>, Arc<MemoryStore>) {
        test_context(&[], "http://127.0.0.1:9")
    }

    async fn send(ctx: &Arc<AppContext>, request: HttpRequest<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = create_router(ctx.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, headers, value)
    }

    fn get_req(uri: &str, key: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().uri(uri);
        if let Some(key) = key {
            builder = builder.header("X-API-Key", key);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn admin_get(uri: &str, key: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(uri)
            .header("X-Admin-Key", key)
            .body(Body::empty())
            .unwrap()
    }

    fn batch(body: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri("/v1/batch")
            .header("X-API-Key", "client-1")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn test_instrument_code() {
        assert_eq!(instrument_code("btc"), "Crypto:ALL:BTC/USDT");
        assert_eq!(instrument_code("eth/btc"), "Crypto:ALL:ETH/BTC");
        assert_eq!(instrument_code("Stock:US:AAPL"), "Stock:US:AAPL");
    }

    #[test]
    fn test_currency_of() {
        assert_eq!(currency_of("Crypto:ALL:BTC/USDT"), "USDT");
        assert_eq!(currency_of("Stock:US:AAPL"), "AAPL");
        assert_eq!(currency_of(""), "USD");
    }

    #[test]
    fn test_price_response_fields() {
        let q = quote("Crypto:ALL:BTC/USDT", "64000.5", true);
        let resp = PriceResponse::new("BTC".to_string(), &q, Source::Stream);
        assert_eq!(resp.price, Decimal::from_str("64000.5").unwrap());
        assert_eq!(resp.ask, Some(Decimal::from_str("64000.5").unwrap()));
        // Zero bid is omitted
        assert_eq!(resp.bid, None);
        assert_eq!(resp.currency, "USDT");
        assert_eq!(resp.market, "open");

        let q = quote("Crypto:ALL:X/USDT", "1.5e-3", false);
        let resp = PriceResponse::new("X".to_string(), &q, Source::Fallback);
        assert_eq!(resp.price, Decimal::from_str("0.0015").unwrap());
        assert_eq!(resp.market, "closed");
    }

    /// Log sink shared between a test and its subscriber.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_unparseable_price_warns_and_reports_zero() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let q = quote("Crypto:ALL:BAD/USDT", "not-a-number", true);
        let resp = tracing::subscriber::with_default(subscriber, || {
            PriceResponse::new("BAD".to_string(), &q, Source::Stream)
        });

        assert_eq!(resp.price, Decimal::ZERO);
        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("WARN"));
        assert!(output.contains("Unparseable price \"not-a-number\" for Crypto:ALL:BAD/USDT"));
    }

    #[tokio::test]
    async fn test_health_needs_no_key() {
        let (ctx, _) = setup();
        let (status, _, body) = send(&ctx, get_req("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["stream"], "disconnected");
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let (ctx, _) = setup();
        let (status, _, body) = send(&ctx, get_req("/v1/price/btc", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "API key required");
    }

    #[tokio::test]
    async fn test_price_from_stream_cache() {
        let (ctx, store) = setup();
        ctx.stream
            .insert(quote("Crypto:ALL:BTC/USDT", "64000.5", true));

        let (status, headers, body) = send(&ctx, get_req("/v1/price/btc", Some("client-1"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pair"], "BTC");
        assert_eq!(body["price"], json!(64000.5));
        assert_eq!(body["currency"], "USDT");
        assert_eq!(body["market"], "open");
        assert_eq!(body["source"], "stream");
        assert!(body.get("bid").is_none());

        assert_eq!(headers["x-ratelimit-limit"], "100");
        assert_eq!(headers["x-ratelimit-remaining"], "99");
        assert_eq!(headers["x-global-limit"], "10000000");
        assert_eq!(headers["x-global-remaining"], "9999999");

        // Usage is counted once the handler ran
        assert_eq!(
            store.get_counter("usage:total:client-1").await.unwrap(),
            Some(1)
        );
        assert!(ctx.subscriptions.is_subscribed("Crypto:ALL:BTC/USDT"));
    }

    #[tokio::test]
    async fn test_price_fallback_and_not_found() {
        let (ctx, _) = setup();

        let (status, _, body) =
            send(&ctx, get_req("/v1/price/Stock:US:AAPL?api_key=client-2", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pair"], "Stock:US:AAPL");
        assert_eq!(body["source"], "fallback");
        assert_eq!(body["market"], "closed");
        assert!(ctx.subscriptions.is_subscribed("Stock:US:AAPL"));

        let (status, _, body) = send(&ctx, get_req("/v1/price/nope", Some("client-2"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "pair not found");
        assert_eq!(body["pair"], "nope");
    }

    #[tokio::test]
    async fn test_rate_limited_request() {
        let (ctx, store) = test_context(&[("RATE_LIMIT_PER_SEC", "2")], "http://127.0.0.1:9");
        // Exhaust the window for this second and the next few
        let now = Utc::now().timestamp();
        for sec in now..now + 5 {
            for _ in 0..2 {
                store.incr(&format!("ratelimit:busy:{}", sec)).await.unwrap();
            }
        }

        let (status, headers, body) = send(&ctx, get_req("/v1/price/btc", Some("busy"))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "Rate limit exceeded");
        assert_eq!(body["limit"], 2);
        assert_eq!(body["remaining"], 0);
        assert_eq!(body["retry_after"], 1);
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        // Rejected requests are not counted as usage
        assert_eq!(store.get_counter("usage:total:busy").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_global_limit_rejects_first() {
        let (ctx, store) = test_context(&[("GLOBAL_LIMIT", "1")], "http://127.0.0.1:9");
        store.incr(admission::GLOBAL_USAGE_KEY).await.unwrap();

        let (status, headers, body) = send(&ctx, get_req("/v1/price/btc", Some("client-1"))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "Global limit exceeded");
        assert_eq!(body["global_remaining"], 0);
        assert_eq!(headers["x-global-remaining"], "0");
        assert!(headers.get("x-ratelimit-limit").is_none());
    }

    #[tokio::test]
    async fn test_store_outage_policies() {
        let (ctx, store) = setup();
        store.set_unavailable(true);
        ctx.stream
            .insert(quote("Crypto:ALL:BTC/USDT", "1", true));
        let (status, _, _) = send(&ctx, get_req("/v1/price/btc", Some("client-1"))).await;
        assert_eq!(status, StatusCode::OK);

        let (ctx, store) = test_context(
            &[("ADMISSION_STORE_FAILURE_POLICY", "fail_closed")],
            "http://127.0.0.1:9",
        );
        store.set_unavailable(true);
        let (status, _, body) = send(&ctx, get_req("/v1/price/btc", Some("client-1"))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Admission check unavailable");
    }

    #[tokio::test]
    async fn test_batch_keeps_order_and_collects_errors() {
        let (ctx, _) = setup();
        ctx.stream
            .insert(quote("Crypto:ALL:BTC/USDT", "64000", true));

        let (status, _, body) =
            send(&ctx, batch(r#"{"pairs":["eth","missing","btc"]}"#)).await;
        assert_eq!(status, StatusCode::OK);

        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["pair"], "ETH");
        assert_eq!(results[0]["source"], "fallback");
        assert_eq!(results[1]["pair"], "BTC");
        assert_eq!(results[1]["source"], "stream");
        assert_eq!(body["errors"], json!([{"pair": "missing", "error": "not found"}]));
    }

    #[tokio::test]
    async fn test_batch_omits_empty_errors_and_rejects_bad_body() {
        let (ctx, _) = setup();
        let (status, _, body) = send(&ctx, batch(r#"{"pairs":["eth"]}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("errors").is_none());

        for bad in [r#"{"pairs":[]}"#, r#"{"symbols":["eth"]}"#, "not json"] {
            let (status, _, body) = send(&ctx, batch(bad)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body {:?}", bad);
            assert_eq!(body["error"], "pairs array is required");
        }
    }

    #[tokio::test]
    async fn test_client_usage() {
        let (ctx, _) = setup();
        for _ in 0..3 {
            send(&ctx, get_req("/v1/price/eth", Some("client-usage-key"))).await;
        }

        let (status, _, body) = send(&ctx, get_req("/v1/usage", Some("client-usage-key"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["api_key"], "client-usage...");
        // The usage request itself is counted after it is answered
        assert_eq!(body["total"], 3);
        assert_eq!(body["last_24h"], 3);
        assert_eq!(body["rate_limit"], 100);
    }

    #[tokio::test]
    async fn test_admin_requires_key() {
        let (ctx, _) = setup();
        let (status, _, body) = send(&ctx, admin_get("/admin/stats", "wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid admin key");

        let (status, _, _) = send(&ctx, get_req("/admin/stats", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let uri = format!("/admin/stats?admin_key={}", ADMIN);
        let (status, _, _) = send(&ctx, get_req(&uri, None)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_stats_and_daily() {
        let (ctx, _) = setup();
        send(&ctx, get_req("/v1/price/eth", Some("client-a"))).await;
        send(&ctx, get_req("/v1/price/eth", Some("client-b"))).await;

        let (status, _, body) = send(&ctx, admin_get("/admin/stats", ADMIN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_api_keys"], 2);
        assert_eq!(body["total_hits"], 2);
        assert_eq!(body["today_hits"], 2);
        assert_eq!(body["global_usage"], 2);
        assert_eq!(body["global_remaining"], 10_000_000 - 2);

        let (_, _, body) = send(&ctx, admin_get("/admin/daily?days=3", ADMIN)).await;
        assert_eq!(body["days"], 3);
        assert_eq!(body["breakdown"].as_array().unwrap().len(), 3);

        for bad in ["0", "31", "week"] {
            let uri = format!("/admin/daily?days={}", bad);
            let (_, _, body) = send(&ctx, admin_get(&uri, ADMIN)).await;
            assert_eq!(body["days"], 7);
        }
    }

    #[tokio::test]
    async fn test_admin_key_usage_by_prefix() {
        let (ctx, _) = setup();
        send(&ctx, get_req("/v1/price/eth", Some("pk_live_abcdef123456"))).await;

        let (status, _, body) = send(&ctx, admin_get("/admin/usage/pk_live_ab", ADMIN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["api_key"], "pk_live_abcd...");
        assert_eq!(body["total"], 1);
        assert_eq!(body["daily_breakdown"].as_array().unwrap().len(), 7);

        let (status, _, body) = send(&ctx, admin_get("/admin/usage/unknown", ADMIN)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Key not found");

        let (status, _, _) = send(&ctx, admin_get("/admin/usage/pk*", ADMIN)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    async fn ranking_server() -> String {
        let coins = json!([
            {"id": "bitcoin", "symbol": "btc", "name": "Bitcoin", "market_cap_rank": 1,
             "market_cap": 1.2e12, "price_change_percentage_24h": 1.5},
            {"id": "ethereum", "symbol": "eth", "name": "Ethereum", "market_cap_rank": 2,
             "market_cap": 4.0e11, "price_change_percentage_24h": -0.5},
            {"id": "obscure", "symbol": "obs", "name": "Obscure", "market_cap_rank": 3,
             "market_cap": 1.0e9, "price_change_percentage_24h": null}
        ]);
        let app = Router::new().route(
            "/coins/markets",
            axum::routing::get(move || {
                let coins = coins.clone();
                async move { Json(coins) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_top_coins_with_prices() {
        let url = ranking_server().await;
        let (ctx, _) = test_context(&[], &url);
        ctx.stream
            .insert(quote("Crypto:ALL:BTC/USDT", "64000", true));

        let (status, _, body) = send(&ctx, get_req("/v1/top?limit=3", Some("client-1"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["limit"], 3);

        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0]["rank"], 1);
        assert_eq!(results[0]["symbol"], "btc");
        assert_eq!(results[0]["price"], json!(64000.0));
        assert_eq!(results[0]["currency"], "USDT");
        assert_eq!(results[1]["price"], json!(3000.25));
        // No price source knows this coin
        assert!(results[2].get("price").is_none());
        assert_eq!(results[2]["price_change_24h"], Value::Null);
    }

    #[tokio::test]
    async fn test_top_limit_defaults_and_ranking_failure() {
        let url = ranking_server().await;
        let (ctx, _) = test_context(&[], &url);
        let (_, _, body) = send(&ctx, get_req("/v1/top?limit=500", Some("client-1"))).await;
        assert_eq!(body["limit"], 10);

        let (ctx, _) = test_context(&[], "http://127.0.0.1:9");
        let (status, _, body) = send(&ctx, get_req("/v1/top", Some("client-1"))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to fetch rankings");
        assert!(body["details"].is_string());
    }
}
