//! Gas pricing for keeper transactions.
//!
//! - [`stats`]: fee statistics over recent blocks (median, percentiles,
//!   buffered suggestion, gas-limit ceiling)
//! - [`GasStrategy`]: turns a block sample into concrete fee fields
//!
//! ```rust,ignore
//! use keeper_chain::gas::{create_gas_strategy, GasPricingModel};
//!
//! let strategy = create_gas_strategy(GasPricingModel::Eip1559, None, 0, 1.2);
//! let params = strategy.fetch_params(&client, &sample).await?;
//! strategy.apply_gas(&mut tx, &params);
//! ```

mod eip1559;
mod legacy;
pub mod stats;

pub use eip1559::Eip1559GasStrategy;
pub use legacy::LegacyGasStrategy;
pub use stats::{
    analyze_gas_limits, collect_recent_blocks, recommend, BlockSample, BlockSource,
    GasLimitStats, GasPriceSource, GasPriceStats, GasStatsError, SamplingConfig, TxSample,
};

use alloy::rpc::types::TransactionRequest;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// How a chain prices transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GasPricingModel {
    /// Single `gasPrice` field
    #[default]
    Legacy,
    /// Base fee plus priority fee
    Eip1559,
    /// EIP-1559 with limits and fees from `linea_estimateGas`
    Linea,
}

/// Gas parameters for one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GasParams {
    Legacy {
        /// Gas price in wei.
        gas_price: u128,
    },
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
        /// Base fee of the newest sampled block, for logging.
        base_fee: u128,
    },
}

impl GasParams {
    /// Highest price per gas the transaction may pay.
    pub fn effective_gas_price(&self) -> u128 {
        match self {
            GasParams::Legacy { gas_price } => *gas_price,
            GasParams::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, GasParams::Legacy { .. })
    }
}

/// Fee selection for one pricing model.
#[async_trait]
pub trait GasStrategy: Send + Sync + Debug {
    /// Derive fee fields from the node and a recent block sample.
    async fn fetch_params(
        &self,
        source: &dyn GasPriceSource,
        sample: &[BlockSample],
    ) -> Result<GasParams>;

    /// Write the fee fields into a transaction request.
    fn apply_gas(&self, tx: &mut TransactionRequest, params: &GasParams);

    fn strategy_name(&self) -> &'static str;

    /// Whether the sampled chain can be priced this way.
    fn supports_sample(&self, _sample: &[BlockSample]) -> bool {
        true
    }
}

/// Build the strategy for a chain's pricing model.
///
/// `Linea` chains share the EIP-1559 strategy; their fees normally arrive
/// from `linea_estimateGas` and only fall back to the sample.
pub fn create_gas_strategy(
    model: GasPricingModel,
    max_gas_price_gwei: Option<f64>,
    min_gas_used: u64,
    buffer: f64,
) -> Box<dyn GasStrategy> {
    let cap = max_gas_price_gwei.map(|gwei| (gwei * 1e9) as u128);
    match model {
        GasPricingModel::Legacy => Box::new(LegacyGasStrategy::new(cap)),
        GasPricingModel::Eip1559 | GasPricingModel::Linea => {
            let strategy = Eip1559GasStrategy::new(min_gas_used, buffer);
            match cap {
                Some(cap) => Box::new(strategy.with_max_fee_cap(cap)),
                None => Box::new(strategy),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gas_params_effective_price() {
        let legacy = GasParams::Legacy {
            gas_price: 1_000_000_000,
        };
        assert_eq!(legacy.effective_gas_price(), 1_000_000_000);
        assert!(legacy.is_legacy());

        let eip1559 = GasParams::Eip1559 {
            max_fee_per_gas: 50_000_000_000,
            max_priority_fee_per_gas: 2_000_000_000,
            base_fee: 30_000_000_000,
        };
        assert_eq!(eip1559.effective_gas_price(), 50_000_000_000);
        assert!(!eip1559.is_legacy());
    }

    #[test]
    fn test_create_gas_strategy() {
        let legacy = create_gas_strategy(GasPricingModel::Legacy, None, 0, 1.2);
        assert_eq!(legacy.strategy_name(), "Legacy");

        let eip1559 = create_gas_strategy(GasPricingModel::Eip1559, Some(500.0), 0, 1.2);
        assert_eq!(eip1559.strategy_name(), "EIP-1559");

        let linea = create_gas_strategy(GasPricingModel::Linea, None, 0, 1.2);
        assert_eq!(linea.strategy_name(), "EIP-1559");
    }

    #[test]
    fn test_pricing_model_deserializes() {
        let model: GasPricingModel = serde_json::from_str("\"Linea\"").unwrap();
        assert_eq!(model, GasPricingModel::Linea);
        assert_eq!(GasPricingModel::default(), GasPricingModel::Legacy);
    }
}
