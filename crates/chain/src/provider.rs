//! JSON-RPC access to one chain.
//! Uses Alloy providers for type-safe RPC interactions.

use alloy::consensus::Transaction as _;
use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{Address, U256, U64};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::transports::http::reqwest::Url;
use alloy::transports::TransportError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::contracts::{ILendingAdapter, ILendingAgent, MarketKey, IERC20};
use crate::gas::{BlockSample, BlockSource, GasPriceSource, TxSample};
use crate::market::Market;
use crate::reader::ChainReader;

/// Gas limit and fees returned by `linea_estimateGas`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineaGasEstimate {
    pub gas_limit: u64,
    pub base_fee_per_gas: u128,
    pub priority_fee_per_gas: u128,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLineaGasEstimate {
    gas_limit: U64,
    base_fee_per_gas: U256,
    priority_fee_per_gas: U256,
}

impl TryFrom<RawLineaGasEstimate> for LineaGasEstimate {
    type Error = anyhow::Error;

    fn try_from(raw: RawLineaGasEstimate) -> Result<Self> {
        Ok(Self {
            gas_limit: raw.gas_limit.to::<u64>(),
            base_fee_per_gas: u128::try_from(raw.base_fee_per_gas)
                .map_err(|_| anyhow!("linea base fee out of range"))?,
            priority_fee_per_gas: u128::try_from(raw.priority_fee_per_gas)
                .map_err(|_| anyhow!("linea priority fee out of range"))?,
        })
    }
}

/// Why a chain could not be brought up at startup.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid RPC URL for {chain}: {reason}")]
    InvalidUrl { chain: String, reason: String },

    #[error("RPC for {chain} reports chain id {remote}, expected {expected}")]
    ChainIdMismatch {
        chain: String,
        remote: u64,
        expected: u64,
    },

    #[error("RPC for {chain} unreachable: {source}")]
    Unreachable {
        chain: String,
        #[source]
        source: TransportError,
    },
}

impl ConnectError {
    /// Configuration mistakes stop the keeper; an unreachable node only
    /// takes its own chain out.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Unreachable { .. })
    }
}

/// Read access to one chain.
///
/// Holds a single HTTP provider whose connection pool is shared by every
/// clone of the client.
#[derive(Clone)]
pub struct ChainClient {
    name: String,
    chain_id: u64,
    rpc_url: Url,
    provider: DynProvider,
}

impl ChainClient {
    /// Create a client without touching the network.
    pub fn new(name: impl Into<String>, chain_id: u64, rpc_url: &str) -> Result<Self, ConnectError> {
        let name = name.into();
        let rpc_url = Url::parse(rpc_url).map_err(|e| ConnectError::InvalidUrl {
            chain: name.clone(),
            reason: e.to_string(),
        })?;
        let provider = ProviderBuilder::new().on_http(rpc_url.clone()).erased();

        Ok(Self {
            name,
            chain_id,
            rpc_url,
            provider,
        })
    }

    /// Create a client and verify the endpoint serves the expected chain.
    pub async fn connect(
        name: impl Into<String>,
        chain_id: u64,
        rpc_url: &str,
    ) -> Result<Self, ConnectError> {
        let client = Self::new(name, chain_id, rpc_url)?;
        let unreachable = |source| ConnectError::Unreachable {
            chain: client.name.clone(),
            source,
        };

        let remote = client.provider.get_chain_id().await.map_err(unreachable)?;
        if remote != chain_id {
            return Err(ConnectError::ChainIdMismatch {
                chain: client.name.clone(),
                remote,
                expected: chain_id,
            });
        }
        let block = client.provider.get_block_number().await.map_err(unreachable)?;

        info!(chain = %client.name, chain_id, block, "Chain connection verified");
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn rpc_url(&self) -> &Url {
        &self.rpc_url
    }

    /// Shared HTTP provider for this chain.
    pub fn provider(&self) -> &DynProvider {
        &self.provider
    }

    pub async fn block_number(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    /// `linea_estimateGas` for a prospective transaction.
    pub async fn linea_estimate_gas(&self, tx: &TransactionRequest) -> Result<LineaGasEstimate> {
        let raw: RawLineaGasEstimate = self
            .provider
            .raw_request("linea_estimateGas".into(), (tx.clone(),))
            .await?;
        let estimate = LineaGasEstimate::try_from(raw)?;
        debug!(
            gas_limit = estimate.gas_limit,
            base_fee = estimate.base_fee_per_gas,
            priority_fee = estimate.priority_fee_per_gas,
            "Linea gas estimate"
        );
        Ok(estimate)
    }

    /// Check if provider is healthy.
    pub async fn health_check(&self) -> Result<bool> {
        let block = self.block_number().await?;
        debug!(chain = %self.name, block, "Provider health check passed");
        Ok(block > 0)
    }
}

impl std::fmt::Debug for ChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainClient")
            .field("name", &self.name)
            .field("chain_id", &self.chain_id)
            .field("rpc_url", &self.rpc_url.as_str())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl GasPriceSource for ChainClient {
    async fn network_gas_price(&self) -> Result<u128> {
        Ok(self.provider.get_gas_price().await?)
    }
}

#[async_trait]
impl BlockSource for ChainClient {
    async fn latest_block_number(&self) -> Result<u64> {
        self.block_number().await
    }

    async fn block_with_transactions(&self, number: u64) -> Result<Option<BlockSample>> {
        let Some(block) = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .full()
            .await?
        else {
            return Ok(None);
        };

        let transactions = block
            .transactions
            .txns()
            .map(|tx| TxSample {
                gas_limit: tx.gas_limit(),
                gas_price: tx.gas_price(),
                max_fee_per_gas: tx.is_dynamic_fee().then(|| tx.max_fee_per_gas()),
                max_priority_fee_per_gas: tx.max_priority_fee_per_gas(),
            })
            .collect();

        Ok(Some(BlockSample {
            number: block.header.number,
            gas_used: block.header.gas_used,
            gas_limit: block.header.gas_limit,
            base_fee_per_gas: block.header.base_fee_per_gas.map(u128::from),
            transactions,
        }))
    }
}

#[async_trait]
impl ChainReader for ChainClient {
    async fn erc20_balance(&self, token: Address, owner: Address) -> Result<U256> {
        let provider = &self.provider;
        Ok(IERC20::new(token, provider).balanceOf(owner).call().await?._0)
    }

    async fn erc20_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256> {
        let provider = &self.provider;
        Ok(IERC20::new(token, provider)
            .allowance(owner, spender)
            .call()
            .await?
            ._0)
    }

    async fn protocol_to_adapter(&self, agent: Address, protocol: u16) -> Result<Address> {
        let provider = &self.provider;
        Ok(ILendingAgent::new(agent, provider)
            .protocolToAdapter(protocol)
            .call()
            .await?
            ._0)
    }

    async fn agent_protocols(&self, agent: Address) -> Result<Vec<u16>> {
        let provider = &self.provider;
        Ok(ILendingAgent::new(agent, provider)
            .getProtocols()
            .call()
            .await?
            ._0)
    }

    async fn borrow_balance(
        &self,
        adapter: Address,
        market: &Market,
        user: Address,
    ) -> Result<U256> {
        let provider = &self.provider;
        Ok(ILendingAdapter::new(adapter, provider)
            .getBorrowBalance(MarketKey::from(market), user)
            .call()
            .await?
            ._0)
    }

    async fn health_factor(&self, adapter: Address, market: &Market, user: Address) -> Result<U256> {
        let provider = &self.provider;
        Ok(ILendingAdapter::new(adapter, provider)
            .getHealthFactor(MarketKey::from(market), user)
            .call()
            .await?
            ._0)
    }
}
