//! Market ranking service client.
//!
//! Every response is decoded into strict types: addresses must parse,
//! protocol codes and flags must fit in 16 bits and `auxId` must be a
//! 32-byte hex string. A mismatch fails the whole call with
//! [`ApiError::Schema`].

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::error::{decode, read_body, Result};
#[cfg(test)]
use crate::error::ApiError;

/// Public deployment of the ranking service.
pub const DEFAULT_MARKETS_URL: &str = "https://tezoro-lending-subgraph-git-uni-tezoro.vercel.app/api/";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenRef {
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanAsset {
    pub token: TokenRef,
    pub borrow_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollateralPolicy {
    pub liq_threshold: f64,
    /// Loan-to-value ratio as a fraction (0.8 = 80%)
    pub ltv: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Collateral,
    Yield,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollateralAsset {
    pub token: TokenRef,
    pub policy: CollateralPolicy,
    pub supply_rate: f64,
    #[serde(rename = "type", default)]
    pub kind: Option<AssetKind>,
}

/// One market as ranked by the service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedMarket {
    pub loan_asset: LoanAsset,
    pub collateral_asset: CollateralAsset,
    pub aux_id: B256,
    pub flags: u16,
    pub market_address: Address,
    pub platform: String,
    pub protocol: u16,
}

/// Markets available on one chain.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainMarkets {
    pub chain_id: u64,
    pub chain_name: String,
    pub markets: Vec<RankedMarket>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BorrowMarkets {
    pub borrow_markets: Vec<RankedMarket>,
    pub earning_markets: Vec<RankedMarket>,
}

/// Token plus raw amount, as sent to `best-borrow-markets`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenAmount {
    pub address: Address,
    pub amount: U256,
}

/// Ranking queries the keeper's decision engines depend on.
#[async_trait]
pub trait MarketRanking: Send + Sync {
    /// Best supply market per token on a chain, limited to `protocols` when
    /// non-empty.
    async fn best_supply_markets(
        &self,
        chain_id: u64,
        tokens: &[Address],
        protocols: &[u16],
    ) -> Result<Vec<RankedMarket>>;

    /// Every known market on one chain.
    async fn markets_on_chain(&self, chain_id: u64) -> Result<Vec<RankedMarket>>;
}

fn join_addresses(addresses: impl IntoIterator<Item = Address>) -> String {
    addresses
        .into_iter()
        .map(|a| format!("{a}").to_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

fn join_codes(codes: &[u16]) -> String {
    codes
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// HTTP client for the ranking service.
#[derive(Debug, Clone)]
pub struct MarketClient {
    client: reqwest::Client,
    base_url: String,
}

impl MarketClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_MARKETS_URL)
    }

    /// Create a client with custom base URL.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &'static str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = self
            .client
            .get(self.endpoint(endpoint))
            .query(query)
            .send()
            .await?;
        let body = read_body(endpoint, response).await?;
        decode(endpoint, &body)
    }

    /// All markets per chain, optionally restricted to some collateral tokens.
    #[instrument(skip(self, collaterals), fields(collaterals = collaterals.len()))]
    pub async fn all_markets(&self, collaterals: &[Address]) -> Result<Vec<ChainMarkets>> {
        let mut query = Vec::new();
        if !collaterals.is_empty() {
            query.push(("collaterals", join_addresses(collaterals.iter().copied())));
        }
        let chains: Vec<ChainMarkets> = self.get("markets", &query).await?;
        debug!(chains = chains.len(), "Fetched markets");
        Ok(chains)
    }

    /// Best-yield supply markets for the given tokens.
    ///
    /// `suboptimal` asks the service for the runner-up markets instead.
    #[instrument(skip(self, tokens, protocols), fields(tokens = tokens.len()))]
    pub async fn best_supply_markets_with(
        &self,
        chain_id: u64,
        tokens: &[Address],
        protocols: &[u16],
        suboptimal: bool,
    ) -> Result<Vec<RankedMarket>> {
        let mut query = vec![
            ("tokens", join_addresses(tokens.iter().copied())),
            ("chainId", chain_id.to_string()),
        ];
        if !protocols.is_empty() {
            query.push(("protocols", join_codes(protocols)));
        }
        if suboptimal {
            query.push(("suboptimal", "true".to_string()));
        }
        let markets: Vec<RankedMarket> = self.get("best-markets", &query).await?;
        debug!(markets = markets.len(), "Fetched best supply markets");
        Ok(markets)
    }

    /// Cheapest borrow markets for the given loans and collaterals.
    #[instrument(skip(self, loans, collaterals, protocols))]
    pub async fn best_borrow_markets(
        &self,
        chain_id: u64,
        loans: &[TokenAmount],
        collaterals: &[TokenAmount],
        protocols: &[u16],
    ) -> Result<BorrowMarkets> {
        let amounts = |items: &[TokenAmount]| {
            items
                .iter()
                .map(|t| t.amount.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        let mut query = vec![
            ("loans", join_addresses(loans.iter().map(|l| l.address))),
            ("loansAmount", amounts(loans)),
            ("collaterals", join_addresses(collaterals.iter().map(|c| c.address))),
            ("collateralsAmount", amounts(collaterals)),
            ("chainId", chain_id.to_string()),
        ];
        if !protocols.is_empty() {
            query.push(("protocols", join_codes(protocols)));
        }
        self.get("best-borrow-markets", &query).await
    }

    /// Fire a cheap request so the service stays warm.
    pub async fn ping(&self) -> Result<()> {
        self.all_markets(&[]).await.map(|_| ())
    }
}

impl Default for MarketClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketRanking for MarketClient {
    async fn best_supply_markets(
        &self,
        chain_id: u64,
        tokens: &[Address],
        protocols: &[u16],
    ) -> Result<Vec<RankedMarket>> {
        self.best_supply_markets_with(chain_id, tokens, protocols, false)
            .await
    }

    async fn markets_on_chain(&self, chain_id: u64) -> Result<Vec<RankedMarket>> {
        Ok(self
            .all_markets(&[])
            .await?
            .into_iter()
            .find(|chain| chain.chain_id == chain_id)
            .map(|chain| chain.markets)
            .unwrap_or_default())
    }
}
