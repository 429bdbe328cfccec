//! Legacy gas pricing (single `gasPrice` field).

use super::stats::{legacy_price_ceiling, BlockSample, GasPriceSource};
use super::{GasParams, GasStrategy};
use alloy::network::TransactionBuilder;
use alloy::rpc::types::TransactionRequest;
use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

/// Prices with `eth_gasPrice`, capped at three times the sampled median and
/// at an optional configured maximum.
#[derive(Debug)]
pub struct LegacyGasStrategy {
    /// Configured maximum gas price in wei.
    max_gas_price: Option<u128>,
}

impl LegacyGasStrategy {
    pub fn new(max_gas_price: Option<u128>) -> Self {
        Self { max_gas_price }
    }

    fn cap(&self, network: u128, sample: &[BlockSample]) -> u128 {
        let mut price = network;
        if let Some(ceiling) = legacy_price_ceiling(sample) {
            price = price.min(ceiling);
        }
        if let Some(max) = self.max_gas_price {
            price = price.min(max);
        }
        price
    }
}

#[async_trait]
impl GasStrategy for LegacyGasStrategy {
    async fn fetch_params(
        &self,
        source: &dyn GasPriceSource,
        sample: &[BlockSample],
    ) -> Result<GasParams> {
        let network = source.network_gas_price().await?;
        let gas_price = self.cap(network, sample);
        if gas_price < network {
            debug!(network, capped = gas_price, "Capped legacy gas price");
        }

        Ok(GasParams::Legacy { gas_price })
    }

    fn apply_gas(&self, tx: &mut TransactionRequest, params: &GasParams) {
        tx.set_gas_price(params.effective_gas_price());
    }

    fn strategy_name(&self) -> &'static str {
        "Legacy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gas::stats::TxSample;
    use alloy::primitives::Address;

    struct FixedGasPrice(u128);

    #[async_trait]
    impl GasPriceSource for FixedGasPrice {
        async fn network_gas_price(&self) -> Result<u128> {
            Ok(self.0)
        }
    }

    fn sample(prices: &[u128]) -> Vec<BlockSample> {
        vec![BlockSample {
            number: 1,
            gas_used: 1,
            gas_limit: 2,
            base_fee_per_gas: None,
            transactions: prices
                .iter()
                .map(|p| TxSample {
                    gas_limit: 21_000,
                    gas_price: Some(*p),
                    ..Default::default()
                })
                .collect(),
        }]
    }

    #[tokio::test]
    async fn test_network_price_passes_through() {
        let strategy = LegacyGasStrategy::new(None);
        let params = strategy
            .fetch_params(&FixedGasPrice(5_000_000_000), &sample(&[4_000_000_000]))
            .await
            .unwrap();
        assert_eq!(params, GasParams::Legacy { gas_price: 5_000_000_000 });
    }

    #[tokio::test]
    async fn test_price_capped_by_sample_and_config() {
        let strategy = LegacyGasStrategy::new(None);
        let params = strategy
            .fetch_params(&FixedGasPrice(100), &sample(&[10, 20, 30]))
            .await
            .unwrap();
        assert_eq!(params.effective_gas_price(), 60);

        let strategy = LegacyGasStrategy::new(Some(40));
        let params = strategy
            .fetch_params(&FixedGasPrice(100), &sample(&[10, 20, 30]))
            .await
            .unwrap();
        assert_eq!(params.effective_gas_price(), 40);
    }

    #[test]
    fn test_legacy_apply_gas() {
        let strategy = LegacyGasStrategy::new(None);
        let mut tx = TransactionRequest::default().with_to(Address::ZERO);

        strategy.apply_gas(&mut tx, &GasParams::Legacy { gas_price: 5_000_000_000 });
        assert_eq!(tx.gas_price(), Some(5_000_000_000));
    }
}
