//! Fee-market statistics over a sample of recent blocks.
//!
//! All price arithmetic is integer and wei-denominated. Buffering uses
//! ceiling division so a suggestion never under-pays the buffered median.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Default multiplier applied to the median heavy price.
pub const DEFAULT_BUFFER_MULTIPLIER: f64 = 1.2;
/// Hard ceiling on the suggestion, as a multiple of the median.
pub const MAX_GAS_MULTIPLIER: u128 = 3;
/// Percentile used as the dynamic floor of the suggestion.
const FLOOR_PERCENTILE: f64 = 0.05;
const GWEI: u128 = 1_000_000_000;

/// Fee fields of one sampled transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxSample {
    /// Gas limit declared by the transaction
    pub gas_limit: u64,
    /// Legacy gas price, if any
    pub gas_price: Option<u128>,
    /// EIP-1559 max fee, if any
    pub max_fee_per_gas: Option<u128>,
    /// EIP-1559 max priority fee, if any
    pub max_priority_fee_per_gas: Option<u128>,
}

impl TxSample {
    /// `maxFeePerGas ?? gasPrice`, zero when neither is set.
    pub fn effective_price(&self) -> u128 {
        self.max_fee_per_gas.or(self.gas_price).unwrap_or(0)
    }
}

/// Header fields and transactions of one sampled block.
#[derive(Debug, Clone, Default)]
pub struct BlockSample {
    pub number: u64,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub base_fee_per_gas: Option<u128>,
    pub transactions: Vec<TxSample>,
}

/// Anything that can report the node's current gas price.
#[async_trait]
pub trait GasPriceSource: Send + Sync {
    async fn network_gas_price(&self) -> Result<u128>;
}

/// Block reads needed to build a sample.
#[async_trait]
pub trait BlockSource: GasPriceSource {
    async fn latest_block_number(&self) -> Result<u64>;

    /// Block with its full transaction list, `None` if the node does not have it.
    async fn block_with_transactions(&self, number: u64) -> Result<Option<BlockSample>>;
}

/// Bounds for [`collect_recent_blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingConfig {
    /// Stop once this many transactions are collected
    pub min_tx_count: usize,
    /// Never read more than this many blocks
    pub max_blocks: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            min_tx_count: 1_000,
            max_blocks: 50,
        }
    }
}

/// Gas price recommendation derived from a block sample.
#[derive(Debug, Clone, PartialEq)]
pub struct GasPriceStats {
    /// Lowest heavy transaction price (wei)
    pub min_price: u128,
    /// Median heavy transaction price (wei)
    pub median_price: u128,
    /// Highest heavy transaction price (wei)
    pub max_price: u128,
    pub suggested_max_fee_per_gas: u128,
    pub suggested_priority_fee_per_gas: u128,
    /// Number of heavy transactions, 0 when the network fallback was used
    pub tx_count: usize,
    /// Mean `gasUsed / gasLimit` over the sampled blocks
    pub avg_gas_used_ratio: f64,
}

impl GasPriceStats {
    pub fn median_gwei(&self) -> u128 {
        self.median_price / GWEI
    }

    pub fn suggested_max_fee_gwei(&self) -> u128 {
        self.suggested_max_fee_per_gas / GWEI
    }
}

/// Observed transaction gas limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasLimitStats {
    pub median_gas_limit: u64,
    pub max_gas_limit: u64,
    pub tx_count: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GasStatsError {
    #[error("no priced transactions in the block sample")]
    NoTransactions,
}

/// Median of a sorted slice. Even lengths average the two middle values.
pub fn median(sorted: &[u128]) -> Option<u128> {
    let mid = sorted.len() / 2;
    let upper = *sorted.get(mid)?;
    if sorted.len() % 2 == 1 {
        return Some(upper);
    }
    let lower = sorted[mid - 1];
    Some(lower / 2 + upper / 2 + (lower % 2 + upper % 2) / 2)
}

/// Value at `floor(len * p)` of a sorted slice, clamped to the last index.
pub fn percentile(sorted: &[u128], p: f64) -> Option<u128> {
    let last = sorted.len().checked_sub(1)?;
    let index = ((sorted.len() as f64) * p).floor() as usize;
    sorted.get(index.min(last)).copied()
}

/// Walk back from the chain tip until `min_tx_count` transactions or
/// `max_blocks` blocks have been collected.
pub async fn collect_recent_blocks<S>(source: &S, config: SamplingConfig) -> Result<Vec<BlockSample>>
where
    S: BlockSource + ?Sized,
{
    let latest = source.latest_block_number().await?;
    let mut blocks = Vec::new();
    let mut tx_count = 0usize;

    for offset in 0..config.max_blocks as u64 {
        if tx_count >= config.min_tx_count {
            break;
        }
        let Some(number) = latest.checked_sub(offset) else {
            break;
        };
        let block = source
            .block_with_transactions(number)
            .await?
            .ok_or_else(|| anyhow!("block {number} not available"))?;
        tx_count += block.transactions.len();
        blocks.push(block);
    }

    debug!(
        latest,
        blocks = blocks.len(),
        transactions = tx_count,
        "Collected recent blocks"
    );
    Ok(blocks)
}

#[derive(Debug, Default)]
struct BlockAnalysis {
    heavy_prices: Vec<u128>,
    gas_ratios: Vec<f64>,
    gas_limits: Vec<u128>,
    priority_fees: Vec<u128>,
}

fn analyze_blocks(blocks: &[BlockSample], min_gas_used: u64) -> BlockAnalysis {
    let mut analysis = BlockAnalysis::default();

    for block in blocks {
        analysis
            .gas_ratios
            .push(block.gas_used as f64 / block.gas_limit.max(1) as f64);
        let base_fee = block.base_fee_per_gas.unwrap_or(0);

        for tx in &block.transactions {
            let price = tx.effective_price();
            if price == 0 {
                continue;
            }
            analysis.gas_limits.push(u128::from(tx.gas_limit));

            if let Some(max_priority) = tx.max_priority_fee_per_gas.filter(|p| *p > 0) {
                let priority = max_priority.min(price.saturating_sub(base_fee));
                if priority > 0 {
                    analysis.priority_fees.push(priority);
                }
            }

            if tx.gas_limit > min_gas_used {
                analysis.heavy_prices.push(price);
            }
        }
    }

    analysis
}

fn buffered(median: u128, buffer: f64) -> u128 {
    let multiplier = (buffer * 1_000.0).round().max(0.0) as u128;
    median.saturating_mul(multiplier).saturating_add(999) / 1_000
}

/// Recommend fees from the heavy transactions of a block sample.
///
/// With no heavy transactions the node's gas price is used when `client` is
/// given; otherwise there is nothing to recommend and `None` is returned.
pub async fn recommend(
    blocks: &[BlockSample],
    min_gas_used: u64,
    buffer: f64,
    client: Option<&dyn GasPriceSource>,
) -> Result<Option<GasPriceStats>> {
    let mut analysis = analyze_blocks(blocks, min_gas_used);

    if analysis.heavy_prices.is_empty() {
        let Some(client) = client else {
            return Ok(None);
        };
        let network = client.network_gas_price().await?;
        debug!(network_gas_price = network, "No heavy transactions, using network gas price");
        return Ok(Some(GasPriceStats {
            min_price: network,
            median_price: network,
            max_price: network,
            suggested_max_fee_per_gas: network,
            suggested_priority_fee_per_gas: network / 10,
            tx_count: 0,
            avg_gas_used_ratio: 0.0,
        }));
    }

    analysis.heavy_prices.sort_unstable();
    let prices = &analysis.heavy_prices;
    let (Some(med), Some(dyn_min)) = (median(prices), percentile(prices, FLOOR_PERCENTILE)) else {
        return Ok(None);
    };

    let hard_cap = med.saturating_mul(MAX_GAS_MULTIPLIER);
    let mut suggested = buffered(med, buffer).min(hard_cap).max(dyn_min);
    if suggested == 0 {
        if let Some(client) = client {
            suggested = client.network_gas_price().await?;
        }
    }

    analysis.priority_fees.sort_unstable();
    let priority = median(&analysis.priority_fees)
        .unwrap_or(suggested / 10)
        .min(suggested);

    let avg_gas_used_ratio =
        analysis.gas_ratios.iter().sum::<f64>() / analysis.gas_ratios.len().max(1) as f64;

    Ok(Some(GasPriceStats {
        min_price: prices[0],
        median_price: med,
        max_price: prices[prices.len() - 1],
        suggested_max_fee_per_gas: suggested,
        suggested_priority_fee_per_gas: priority,
        tx_count: prices.len(),
        avg_gas_used_ratio,
    }))
}

/// Upper bound for a legacy gas price: the median price of every priced
/// transaction in the sample times [`MAX_GAS_MULTIPLIER`].
pub fn legacy_price_ceiling(blocks: &[BlockSample]) -> Option<u128> {
    let mut prices: Vec<u128> = blocks
        .iter()
        .flat_map(|b| b.transactions.iter())
        .map(TxSample::effective_price)
        .filter(|p| *p > 0)
        .collect();
    prices.sort_unstable();
    median(&prices).map(|m| m.saturating_mul(MAX_GAS_MULTIPLIER))
}

/// Median and maximum gas limit over every priced transaction in the sample.
pub fn analyze_gas_limits(blocks: &[BlockSample]) -> Result<GasLimitStats, GasStatsError> {
    let mut limits = analyze_blocks(blocks, 0).gas_limits;
    limits.sort_unstable();

    let median_gas_limit = median(&limits).ok_or(GasStatsError::NoTransactions)?;
    let max_gas_limit = *limits.last().ok_or(GasStatsError::NoTransactions)?;

    // Limits originate from u64 values, so the narrowing is lossless.
    Ok(GasLimitStats {
        median_gas_limit: median_gas_limit as u64,
        max_gas_limit: max_gas_limit as u64,
        tx_count: limits.len(),
    })
}
