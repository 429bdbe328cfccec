//! USD spot-price client with a short-lived cache.

use alloy::primitives::Address;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

use crate::error::{decode, read_body, ApiError, Result};

pub const DEFAULT_PRICES_URL: &str = "https://coins.llama.fi";
pub const DEFAULT_PRICE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
pub struct CoinPrice {
    pub price: f64,
    pub symbol: Option<String>,
    pub decimals: Option<u8>,
    pub timestamp: Option<u64>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CoinsResponse {
    coins: HashMap<String, CoinPrice>,
}

/// Price lookups used to value collateral in loan-token terms.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// USD price of `token` on the chain identified by `chain` slug.
    async fn usd_price(&self, chain: &str, token: Address) -> Result<f64>;

    /// Price of one `base` token in units of `quote`.
    async fn price_in_token(&self, chain: &str, base: Address, quote: Address) -> Result<f64> {
        if base == quote {
            return Ok(1.0);
        }
        let base_price = self.usd_price(chain, base).await?;
        let quote_price = self.usd_price(chain, quote).await?;
        if quote_price == 0.0 {
            return Err(ApiError::ZeroQuotePrice(coin_key(chain, quote)));
        }
        Ok(base_price / quote_price)
    }
}

#[derive(Clone)]
struct CachedPrice {
    price: f64,
    cached_at: Instant,
}

/// Cache and request key: `chain:address` with a lowercased address.
fn coin_key(chain: &str, token: Address) -> String {
    format!("{chain}:{token}").to_lowercase()
}

#[derive(Clone)]
pub struct PriceClient {
    client: reqwest::Client,
    base_url: String,
    cache: Arc<DashMap<String, CachedPrice>>,
    cache_ttl: Duration,
}

impl std::fmt::Debug for PriceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceClient")
            .field("base_url", &self.base_url)
            .field("cache_size", &self.cache.len())
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl PriceClient {
    pub fn new(base_url: impl Into<String>, cache_ttl: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache: Arc::new(DashMap::new()),
            cache_ttl,
        }
    }

    fn cached(&self, key: &str) -> Option<f64> {
        let entry = self.cache.get(key)?;
        (entry.cached_at.elapsed() < self.cache_ttl).then_some(entry.price)
    }

    /// Cache a fresh price, dropping expired entries first.
    fn store(&self, key: String, price: f64) {
        let ttl = self.cache_ttl;
        self.cache.retain(|_, cached| cached.cached_at.elapsed() < ttl);
        self.cache.insert(
            key,
            CachedPrice {
                price,
                cached_at: Instant::now(),
            },
        );
    }

    async fn fetch(&self, key: &str) -> Result<CoinPrice> {
        let url = format!("{}/prices/current/{key}", self.base_url);
        let response = self.client.get(&url).send().await?;
        let body = read_body("prices", response).await?;
        let mut parsed: CoinsResponse = decode("prices", &body)?;

        // The service echoes the id with its own casing.
        let found = parsed
            .coins
            .drain()
            .find(|(id, _)| id.eq_ignore_ascii_case(key))
            .map(|(_, price)| price);
        found.ok_or_else(|| ApiError::MissingPrice(key.to_string()))
    }
}

impl Default for PriceClient {
    fn default() -> Self {
        Self::new(DEFAULT_PRICES_URL, DEFAULT_PRICE_TTL)
    }
}

#[async_trait]
impl PriceOracle for PriceClient {
    #[instrument(skip(self), fields(token = %token))]
    async fn usd_price(&self, chain: &str, token: Address) -> Result<f64> {
        let key = coin_key(chain, token);
        if let Some(price) = self.cached(&key) {
            debug!(key, price, "Price cache hit");
            return Ok(price);
        }

        let coin = self.fetch(&key).await?;
        debug!(key, price = coin.price, symbol = ?coin.symbol, "Fetched price");
        self.store(key, coin.price);
        Ok(coin.price)
    }
}
