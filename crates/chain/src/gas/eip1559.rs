//! EIP-1559 pricing from a recent block sample.

use super::stats::{recommend, BlockSample, GasPriceSource};
use super::{GasParams, GasStrategy};
use alloy::network::TransactionBuilder;
use alloy::rpc::types::TransactionRequest;
use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

/// Uses [`recommend`] over the heavy transactions of the sample.
///
/// The max fee is the buffered median heavy price; the priority fee is the
/// median observed tip.
#[derive(Debug)]
pub struct Eip1559GasStrategy {
    /// Transactions at or below this gas limit are ignored.
    min_gas_used: u64,
    /// Multiplier on the median heavy price.
    buffer: f64,
    /// Maximum allowed max_fee_per_gas in wei.
    max_fee_cap: Option<u128>,
}

impl Eip1559GasStrategy {
    pub fn new(min_gas_used: u64, buffer: f64) -> Self {
        Self {
            min_gas_used,
            buffer,
            max_fee_cap: None,
        }
    }

    /// Create with a custom max fee cap.
    pub fn with_max_fee_cap(mut self, cap: u128) -> Self {
        self.max_fee_cap = Some(cap);
        self
    }
}

#[async_trait]
impl GasStrategy for Eip1559GasStrategy {
    async fn fetch_params(
        &self,
        source: &dyn GasPriceSource,
        sample: &[BlockSample],
    ) -> Result<GasParams> {
        let base_fee = sample
            .first()
            .and_then(|b| b.base_fee_per_gas)
            .unwrap_or(0);

        let (mut max_fee, mut priority_fee) =
            match recommend(sample, self.min_gas_used, self.buffer, Some(source)).await? {
                Some(stats) => {
                    debug!(
                        tx_count = stats.tx_count,
                        median_gwei = stats.median_gwei(),
                        suggested_gwei = stats.suggested_max_fee_gwei(),
                        "Heavy transaction fee sample"
                    );
                    (
                        stats.suggested_max_fee_per_gas,
                        stats.suggested_priority_fee_per_gas,
                    )
                }
                None => {
                    let network = source.network_gas_price().await?;
                    (network, network / 10)
                }
            };

        if let Some(cap) = self.max_fee_cap {
            max_fee = max_fee.min(cap);
        }
        priority_fee = priority_fee.min(max_fee);

        debug!(base_fee, max_fee, priority_fee, "EIP-1559 fees");
        Ok(GasParams::Eip1559 {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: priority_fee,
            base_fee,
        })
    }

    fn apply_gas(&self, tx: &mut TransactionRequest, params: &GasParams) {
        match params {
            GasParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
                ..
            } => {
                tx.set_max_fee_per_gas(*max_fee_per_gas);
                tx.set_max_priority_fee_per_gas(*max_priority_fee_per_gas);
            }
            GasParams::Legacy { gas_price } => {
                tx.set_gas_price(*gas_price);
            }
        }
    }

    fn strategy_name(&self) -> &'static str {
        "EIP-1559"
    }

    /// The newest block must carry a base fee.
    fn supports_sample(&self, sample: &[BlockSample]) -> bool {
        sample
            .first()
            .is_some_and(|block| block.base_fee_per_gas.is_some())
    }
}
